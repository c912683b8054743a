//! Per-connection outboxes for the signaling server.
//!
//! The relay knows nothing about rooms or payloads. It delivers a message to
//! the connection registered under an identity, in the order it was handed
//! over.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::signaling::{ConnectionId, ServerMessage};

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Default)]
pub struct SignalRelay {
    outboxes: RwLock<HashMap<ConnectionId, Outbox>>,
}

impl SignalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.write().insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.outboxes.write().remove(id).is_some()
    }

    /// Hands `message` to `target`'s outbox.
    ///
    /// Fails with `TargetUnreachable` if the target is gone; callers are
    /// expected to drop the message, since a `peer-left` for the target is
    /// already on its way to the sender.
    pub fn forward(&self, target: &ConnectionId, message: ServerMessage) -> Result<()> {
        let outboxes = self.outboxes.read();
        let outbox = outboxes
            .get(target)
            .ok_or_else(|| Error::TargetUnreachable(target.clone()))?;
        outbox.send(message).map_err(|_| {
            debug!(peer = %target, "outbox closed");
            Error::TargetUnreachable(target.clone())
        })
    }

    /// Sends `message` to every listed connection, skipping unreachable ones.
    pub fn fan_out<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ConnectionId>,
        message: &ServerMessage,
    ) -> usize {
        targets
            .into_iter()
            .filter(|target| self.forward(target, message.clone()).is_ok())
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.read().len()
    }
}
