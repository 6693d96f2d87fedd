use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::SendError;

use crate::guided_fix::state::{RequestId, StateKind};

/// Out-of-band notices for the UI and voice layers. Session state itself is
/// observed through the session's watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionNotice {
    /// Text the voice layer should read out.
    Narration { text: String },
    /// Independent of whatever the session does next.
    SafetyWarning { text: String },
    StaleResponseDiscarded {
        received: RequestId,
        active: Option<RequestId>,
    },
    SessionEnded { final_state: StateKind },
}

pub struct EventBus {
    tx: broadcast::Sender<SessionNotice>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.tx.subscribe()
    }

    pub fn send(&self, notice: SessionNotice) -> Result<(), SendError<SessionNotice>> {
        self.tx.send(notice).map(|_| ())
    }

    /// Send, ignoring the case where nobody is listening.
    pub fn publish(&self, notice: SessionNotice) {
        if self.send(notice).is_err() {
            tracing::trace!("session notice dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_notices() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SessionNotice::SafetyWarning { text: "Turn off the water".into() });
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionNotice::SafetyWarning { text: "Turn off the water".into() }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(SessionNotice::Narration { text: "hello".into() });
        assert!(bus.send(SessionNotice::Narration { text: "again".into() }).is_err());
    }
}
