//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use sensorgate_types::{DeviceFamily, PendingTransaction, UpgradeState};

/// A peripheral the gateway has connected to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Gateway-assigned device identifier.
    pub id: String,
    /// Advertised name.
    pub name: String,
    pub family: DeviceFamily,
    /// Hardware model, when known.
    pub model: Option<String>,
    /// Last firmware version the device reported.
    pub firmware: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Everything the store holds, for export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    pub devices: Vec<StoredDevice>,
    pub upgrades: Vec<UpgradeState>,
    pub pending: Vec<PendingTransaction>,
}
