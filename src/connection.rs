use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::signaling::ConnectionId;

/// Negotiation role of the local side of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Joined later and sends the first payload.
    Initiator,
    /// Was already in the room and answers.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending(Role),
    Negotiating,
    Established,
    Closed,
}

impl SessionState {
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Pending(role) => write!(f, "Pending({})", role),
            SessionState::Negotiating => write!(f, "Negotiating"),
            SessionState::Established => write!(f, "Established"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub peer: ConnectionId,
    pub role: Role,
    pub state: SessionState,
}

/// Publishes the live session set so observers can follow it without
/// touching the manager's own state.
#[derive(Clone)]
pub struct SessionMonitor {
    status: Arc<watch::Sender<Vec<SessionSummary>>>,
    receiver: watch::Receiver<Vec<SessionSummary>>,
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(Vec::new());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn publish(&self, mut sessions: Vec<SessionSummary>) {
        sessions.sort_by(|a, b| a.peer.cmp(&b.peer));
        self.status.send_if_modified(|current| {
            if *current == sessions {
                return false;
            }
            *current = sessions;
            true
        });
    }

    pub fn current(&self) -> Vec<SessionSummary> {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<SessionSummary>> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let monitor = SessionMonitor::new();
        let mut rx = monitor.subscribe();

        let summary = SessionSummary {
            peer: ConnectionId::from("a"),
            role: Role::Initiator,
            state: SessionState::Negotiating,
        };
        monitor.publish(vec![summary.clone()]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), vec![summary.clone()]);

        monitor.publish(vec![summary]);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn state_display() {
        assert_eq!(SessionState::Pending(Role::Responder).to_string(), "Pending(responder)");
        assert!(SessionState::Established.is_established());
    }
}
