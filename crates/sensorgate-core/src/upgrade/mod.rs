//! Over-the-air firmware upgrade.
//!
//! - [`crc`]: the CRC-32 the bootloader checks images against
//! - [`protocol`]: the block transfer over the debug characteristic
//! - [`manager`]: the persisted per-device job that downloads, verifies,
//!   transfers and reports an upgrade

pub mod crc;
pub mod manager;
pub mod protocol;

pub use crc::crc32;
pub use manager::{
    CommandDisposition, UpgradeContext, UpgradeJob, UpgradeManager, UpgradeManagerConfig,
};
pub use protocol::{
    FINISH_ACK, TransferPhase, TransferReport, TransferSession, UPGRADE_COMMAND, UpgradeConfig,
    UpgradeEngine, start_frame,
};
