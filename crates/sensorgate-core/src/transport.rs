//! Transport abstraction over the BLE central.
//!
//! The device state machine and the upgrade engine only ever talk to a
//! [`Transport`]. [`crate::btle::BtleTransport`] implements it on top of
//! btleplug; [`crate::mock::MockTransport`] implements it in memory for tests.
//!
//! Peripherals are addressed by an opaque [`PeripheralHandle`]. Incoming
//! notifications and link losses are published on a broadcast channel so every
//! [`crate::DeviceConnection`] can filter the events that belong to its own
//! handle.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Opaque identifier of a peripheral known to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralHandle(pub String);

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Asynchronous callbacks delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportEvent {
    /// A subscribed characteristic changed value.
    CharacteristicUpdate {
        handle: PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The link to a peripheral dropped.
    Disconnected { handle: PeripheralHandle },
}

impl TransportEvent {
    /// Handle of the peripheral the event belongs to.
    pub fn handle(&self) -> &PeripheralHandle {
        match self {
            TransportEvent::CharacteristicUpdate { handle, .. } => handle,
            TransportEvent::Disconnected { handle } => handle,
        }
    }
}

/// Receiver for transport events.
pub type TransportEvents = broadcast::Receiver<TransportEvent>;

/// Operations the gateway needs from a BLE central.
///
/// Every call that waits on the radio takes an explicit timeout; expiry maps
/// to [`crate::Error::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the Bluetooth radio is powered on.
    async fn is_powered(&self) -> bool;

    /// Scan for a peripheral advertising `name`.
    ///
    /// Returns `Ok(None)` when nothing matched before `timeout`.
    async fn scan(&self, name: &str, timeout: Duration) -> Result<Option<PeripheralHandle>>;

    /// Connect and discover primary services.
    async fn connect(&self, handle: &PeripheralHandle, timeout: Duration) -> Result<Vec<Uuid>>;

    /// List the characteristics of a discovered service.
    async fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        timeout: Duration,
    ) -> Result<Vec<Uuid>>;

    /// Write a value to a characteristic.
    ///
    /// `with_response` selects an acknowledged write; unacknowledged writes
    /// return as soon as the value is queued.
    async fn write(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Enable or disable notifications on a characteristic.
    async fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        enabled: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Whether the link to `handle` is currently up.
    async fn is_connected(&self, handle: &PeripheralHandle) -> bool;

    /// Drop the link to `handle`.
    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()>;

    /// Subscribe to notifications and link losses for all peripherals.
    fn subscribe(&self) -> TransportEvents;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_handle() {
        let handle = PeripheralHandle::new("AA:BB");
        let event = TransportEvent::Disconnected {
            handle: handle.clone(),
        };
        assert_eq!(event.handle(), &handle);
        assert_eq!(handle.to_string(), "AA:BB");
    }
}
