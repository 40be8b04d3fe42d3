//! Seams between the gateway core and its host.
//!
//! The core never reaches for globals. Everything it needs from the outside
//! world (the cloud API, durable storage, the host's foreground state, and
//! the consumers of its events) comes in through these traits.

use std::path::PathBuf;

use async_trait::async_trait;

use sensorgate_types::{PendingTransaction, Reading, SensorKind, UpgradeState, UpgradeStatus};

use crate::connection::ConnectionState;
use crate::error::Result;

/// Cloud endpoints used by the upgrade orchestrator.
///
/// Report methods return `true` when the server accepted the report. A
/// `false` return means the report must be retried later.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Download the firmware image of a transaction to a local file.
    ///
    /// `progress` receives the downloaded fraction in `0.0..=1.0`.
    async fn download_file(
        &self,
        transaction_id: &str,
        file_token: &str,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<PathBuf>;

    /// Abort an in-flight download.
    fn cancel_download(&self, file_token: &str);

    /// Acknowledge that the gateway accepted a transaction.
    async fn report_received(&self, transaction_id: &str) -> bool;

    /// Report a successful upgrade.
    async fn report_succeeded(&self, transaction_id: &str) -> bool;

    /// Report a failed upgrade.
    async fn report_failed(&self, transaction_id: &str, message: &str) -> bool;

    /// Whether the cloud is currently reachable.
    fn is_reachable(&self) -> bool;
}

/// Durable storage for upgrade records and undelivered reports.
pub trait UpgradeStore: Send + Sync {
    /// Load the record of a device, if one was ever saved.
    fn load_state(&self, device_id: &str) -> Result<Option<UpgradeState>>;

    /// Insert or replace the record of a device.
    fn save_state(&self, state: &UpgradeState) -> Result<()>;

    /// All saved records.
    fn all_states(&self) -> Result<Vec<UpgradeState>>;

    /// Undelivered reports, oldest first.
    fn pending_transactions(&self) -> Result<Vec<PendingTransaction>>;

    /// Queue an undelivered report. A second push for the same transaction
    /// replaces the first.
    fn push_pending(&self, pending: &PendingTransaction) -> Result<()>;

    /// Drop a delivered report.
    fn remove_pending(&self, transaction_id: &str) -> Result<()>;
}

/// Host application lifecycle.
pub trait AppState: Send + Sync {
    /// Whether the host is in the foreground.
    fn is_foreground(&self) -> bool;
}

/// An [`AppState`] that never leaves the foreground, as for a headless daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysForeground;

impl AppState for AlwaysForeground {
    fn is_foreground(&self) -> bool {
        true
    }
}

/// Receiver of device-level notifications.
///
/// All methods default to doing nothing so consumers only implement what
/// they care about.
pub trait DeviceDelegate: Send + Sync {
    /// The connection state of a device changed.
    fn state_changed(&self, _device_id: &str, _state: ConnectionState) {}

    /// A sensor produced a decoded reading.
    fn reading(&self, _device_id: &str, _sensor: SensorKind, _reading: &Reading) {}

    /// A non-fatal error occurred on a device.
    fn error(&self, _device_id: &str, _message: &str) {}
}

/// Receiver of upgrade-job notifications.
pub trait UpgradeDelegate: Send + Sync {
    /// An upgrade job moved to a new state.
    fn upgrade_state_changed(&self, _device_id: &str, _state: UpgradeStatus, _message: Option<&str>) {}

    /// Download or transfer progress in `0.0..=1.0`.
    fn upgrade_progress(&self, _device_id: &str, _state: UpgradeStatus, _fraction: f32) {}

    /// A transfer was interrupted by a restart and may be resumed.
    fn resumable_upgrade(&self, _device_id: &str, _state: UpgradeStatus) {}
}

/// Delegate that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl DeviceDelegate for NoopDelegate {}
impl UpgradeDelegate for NoopDelegate {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_foreground() {
        assert!(AlwaysForeground.is_foreground());
    }

    #[test]
    fn test_noop_delegate_accepts_calls() {
        let delegate = NoopDelegate;
        delegate.state_changed("dev", ConnectionState::Monitoring);
        delegate.upgrade_progress("dev", UpgradeStatus::Upgrading, 0.5);
    }
}
