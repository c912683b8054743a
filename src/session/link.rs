//! The seam between the session manager and a negotiation engine.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::connection::Role;
use crate::error::Result;
use crate::media::{LocalMedia, MediaKind, RemoteMedia};
use crate::signaling::{ConnectionId, SignalPayload};

use super::Internal;

/// Opens one negotiated link per remote peer.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn open(
        &self,
        peer: &ConnectionId,
        role: Role,
        media: &LocalMedia,
        observer: LinkObserver,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// One direct session with a remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Initiator side: produce the first payload.
    async fn create_offer(&self) -> Result<SignalPayload>;

    /// Responder side: consume the initiator's payload and produce a reply.
    async fn accept_offer(&self, offer: SignalPayload) -> Result<SignalPayload>;

    /// Initiator side: consume a reply.
    async fn accept_answer(&self, answer: SignalPayload) -> Result<()>;

    /// Swaps the outgoing track of `kind` in place; `None` stops sending.
    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Option<Arc<TrackLocalStaticSample>>,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Lets a link report its own progress back to the manager. Reports from a
/// link whose session has since been closed are ignored.
#[derive(Clone)]
pub struct LinkObserver {
    peer: ConnectionId,
    epoch: u64,
    tx: mpsc::UnboundedSender<Internal>,
}

impl LinkObserver {
    pub(crate) fn new(peer: ConnectionId, epoch: u64, tx: mpsc::UnboundedSender<Internal>) -> Self {
        Self { peer, epoch, tx }
    }

    pub fn peer(&self) -> &ConnectionId {
        &self.peer
    }

    /// The media path is up; `media` goes to the renderer.
    pub fn connected(&self, media: RemoteMedia) {
        let _ = self.tx.send(Internal::Connected {
            peer: self.peer.clone(),
            epoch: self.epoch,
            media,
        });
    }

    /// The underlying transport failed or closed.
    pub fn terminated(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Internal::Terminated {
            peer: self.peer.clone(),
            epoch: self.epoch,
            reason: reason.into(),
        });
    }
}
