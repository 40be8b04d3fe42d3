//! Persisted firmware-upgrade records.
//!
//! These types are shared between the orchestrator in sensorgate-core and the
//! SQLite store, so they carry no behaviour beyond small state queries.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Lifecycle of a firmware upgrade job for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UpgradeStatus {
    /// No job; a new upgrade command may be accepted.
    #[default]
    Idle,
    /// A cloud job was acknowledged but the download has not started.
    Scheduled,
    /// The firmware image is being fetched.
    Downloading,
    /// Checking radio, registration, model and connection before transfer.
    Preparing,
    /// The image is being transferred to the peripheral.
    Upgrading,
    /// Transfer finished; outcome is being reported.
    Success,
    /// Job failed; outcome is being reported.
    Error,
}

impl UpgradeStatus {
    /// Stable name used for persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeStatus::Idle => "idle",
            UpgradeStatus::Scheduled => "scheduled",
            UpgradeStatus::Downloading => "downloading",
            UpgradeStatus::Preparing => "preparing",
            UpgradeStatus::Upgrading => "upgrading",
            UpgradeStatus::Success => "success",
            UpgradeStatus::Error => "error",
        }
    }

    /// States in which a user cancellation is meaningful.
    #[must_use]
    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::Downloading | UpgradeStatus::Preparing | UpgradeStatus::Upgrading
        )
    }

    /// Whether a new upgrade command may replace the current job.
    #[must_use]
    pub fn accepts_new_job(&self) -> bool {
        matches!(self, UpgradeStatus::Idle | UpgradeStatus::Scheduled)
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(UpgradeStatus::Idle),
            "scheduled" => Ok(UpgradeStatus::Scheduled),
            "downloading" => Ok(UpgradeStatus::Downloading),
            "preparing" => Ok(UpgradeStatus::Preparing),
            "upgrading" => Ok(UpgradeStatus::Upgrading),
            "success" => Ok(UpgradeStatus::Success),
            "error" => Ok(UpgradeStatus::Error),
            other => Err(ParseError::UnknownState(other.to_string())),
        }
    }
}

/// Persisted upgrade record; exactly one per device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UpgradeState {
    pub device_id: String,
    pub state: UpgradeStatus,
    /// Local path of the downloaded firmware image.
    pub firmware_file_location: Option<String>,
    /// Hex MD5 digest supplied by the server.
    pub md5_checksum: Option<String>,
    /// Opaque token used to fetch the image.
    pub file_token: Option<String>,
    /// Cloud transaction the job belongs to.
    pub transaction_id: Option<String>,
    pub error_message: Option<String>,
    pub canceled: bool,
    /// Unix timestamp (seconds) when the current job started.
    pub start_time: Option<i64>,
}

impl UpgradeState {
    /// A fresh idle record for a device.
    pub fn idle(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Reset every job field, keeping only the device id.
    pub fn reset(&mut self) {
        *self = Self::idle(std::mem::take(&mut self.device_id));
    }
}

/// Outcome carried by a queued transaction report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransactionOutcome {
    Succeeded,
    Failed,
}

impl TransactionOutcome {
    /// Stable name used for persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionOutcome::Succeeded => "succeeded",
            TransactionOutcome::Failed => "failed",
        }
    }
}

impl FromStr for TransactionOutcome {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(TransactionOutcome::Succeeded),
            "failed" => Ok(TransactionOutcome::Failed),
            other => Err(ParseError::UnknownState(other.to_string())),
        }
    }
}

/// A transaction outcome that could not be delivered to the cloud yet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PendingTransaction {
    pub transaction_id: String,
    /// Device whose upgrade produced the outcome, if any.
    pub device_id: Option<String>,
    pub outcome: TransactionOutcome,
    pub message: Option<String>,
    /// Unix timestamp (seconds) when the report was queued.
    pub queued_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            UpgradeStatus::Idle,
            UpgradeStatus::Scheduled,
            UpgradeStatus::Downloading,
            UpgradeStatus::Preparing,
            UpgradeStatus::Upgrading,
            UpgradeStatus::Success,
            UpgradeStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<UpgradeStatus>().unwrap(), status);
        }
        assert!("flashing".parse::<UpgradeStatus>().is_err());
    }

    #[test]
    fn test_cancelable_states() {
        assert!(UpgradeStatus::Downloading.is_cancelable());
        assert!(UpgradeStatus::Upgrading.is_cancelable());
        assert!(!UpgradeStatus::Idle.is_cancelable());
        assert!(!UpgradeStatus::Success.is_cancelable());
    }

    #[test]
    fn test_reset_keeps_device_id() {
        let mut state = UpgradeState {
            device_id: "node-1".to_string(),
            state: UpgradeStatus::Error,
            error_message: Some("boom".to_string()),
            canceled: true,
            ..Default::default()
        };
        state.reset();
        assert_eq!(state, UpgradeState::idle("node-1"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&UpgradeStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }
}
