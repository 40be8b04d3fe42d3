//! Gateway event system.
//!
//! [`EventDispatcher`] turns delegate callbacks into serializable
//! [`GatewayEvent`]s on a broadcast channel. Hosts that prefer a stream of
//! events over implementing the delegate traits hand a dispatcher to the
//! device and upgrade contexts and subscribe to it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use sensorgate_types::{Reading, SensorKind, UpgradeStatus};

use crate::connection::ConnectionState;
use crate::traits::{DeviceDelegate, UpgradeDelegate};

/// Events emitted by devices and the upgrade orchestrator.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum GatewayEvent {
    /// A device changed connection state.
    StateChanged {
        device_id: String,
        state: ConnectionState,
    },
    /// A sensor produced a reading.
    Reading {
        device_id: String,
        sensor: SensorKind,
        reading: Reading,
    },
    /// Non-fatal device error.
    Error { device_id: String, message: String },
    /// An upgrade job changed state.
    UpgradeState {
        device_id: String,
        state: UpgradeStatus,
        message: Option<String>,
    },
    /// Download or transfer progress.
    UpgradeProgress {
        device_id: String,
        state: UpgradeStatus,
        fraction: f32,
    },
    /// An interrupted transfer can be resumed or abandoned.
    UpgradeResumable {
        device_id: String,
        state: UpgradeStatus,
    },
}

/// Sender for gateway events.
pub type EventSender = broadcast::Sender<GatewayEvent>;

/// Receiver for gateway events.
pub type EventReceiver = broadcast::Receiver<GatewayEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: GatewayEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl DeviceDelegate for EventDispatcher {
    fn state_changed(&self, device_id: &str, state: ConnectionState) {
        self.send(GatewayEvent::StateChanged {
            device_id: device_id.to_string(),
            state,
        });
    }

    fn reading(&self, device_id: &str, sensor: SensorKind, reading: &Reading) {
        self.send(GatewayEvent::Reading {
            device_id: device_id.to_string(),
            sensor,
            reading: *reading,
        });
    }

    fn error(&self, device_id: &str, message: &str) {
        self.send(GatewayEvent::Error {
            device_id: device_id.to_string(),
            message: message.to_string(),
        });
    }
}

impl UpgradeDelegate for EventDispatcher {
    fn upgrade_state_changed(&self, device_id: &str, state: UpgradeStatus, message: Option<&str>) {
        self.send(GatewayEvent::UpgradeState {
            device_id: device_id.to_string(),
            state,
            message: message.map(str::to_string),
        });
    }

    fn upgrade_progress(&self, device_id: &str, state: UpgradeStatus, fraction: f32) {
        self.send(GatewayEvent::UpgradeProgress {
            device_id: device_id.to_string(),
            state,
            fraction,
        });
    }

    fn resumable_upgrade(&self, device_id: &str, state: UpgradeStatus) {
        self.send(GatewayEvent::UpgradeResumable {
            device_id: device_id.to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_forwards_delegate_calls() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();

        DeviceDelegate::state_changed(&dispatcher, "tag-1", ConnectionState::Detecting);
        dispatcher.upgrade_state_changed("node-1", UpgradeStatus::Error, Some("MD5 check failed"));

        match rx.recv().await.unwrap() {
            GatewayEvent::StateChanged { device_id, state } => {
                assert_eq!(device_id, "tag-1");
                assert_eq!(state, ConnectionState::Detecting);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            GatewayEvent::UpgradeState { message, .. } => {
                assert_eq!(message.as_deref(), Some("MD5 check failed"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_send_without_receivers() {
        let dispatcher = EventDispatcher::default();
        dispatcher.send(GatewayEvent::Error {
            device_id: "x".into(),
            message: "ignored".into(),
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = GatewayEvent::UpgradeProgress {
            device_id: "node-1".into(),
            state: UpgradeStatus::Upgrading,
            fraction: 0.5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"upgrade_progress\""));
        assert!(json.contains("\"upgrading\""));
    }
}
