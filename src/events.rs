/**
 * Engine notifications
 * Broadcast to subscribers and mirrored into the trace log
 */

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::types::{Identity, Timestamp};

const EVENT_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Registered {
        identity: Identity,
        at: Timestamp,
    },
    Updated {
        identity: Identity,
        at: Timestamp,
    },
    Deactivated {
        identity: Identity,
    },
    VerificationRequested {
        identity: Identity,
        request_id: u64,
        attempt_index: usize,
    },
    VerificationResolved {
        identity: Identity,
        request_id: u64,
        attempt_index: usize,
        verified: bool,
    },
    AuthorizationChanged {
        principal: Identity,
        authorized: bool,
    },
    OwnershipTransferred {
        previous: Identity,
        owner: Identity,
    },
    EmergencyDeactivation {
        deactivated: usize,
    },
}

/// Fan-out for engine events. Sending never fails, even without subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        info!(?event, "engine event");
        let _ = self.sender.send(event);
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

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::new().emit(EngineEvent::EmergencyDeactivation { deactivated: 0 });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::Deactivated {
            identity: Identity::from("alice"),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::Deactivated {
                identity: Identity::from("alice")
            }
        );
    }
}
