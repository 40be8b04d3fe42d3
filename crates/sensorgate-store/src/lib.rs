//! Local persistence for the sensorgate gateway.
//!
//! This crate keeps the state that must survive a gateway restart in a
//! SQLite database:
//!
//! - One firmware upgrade record per device
//! - Transaction reports the cloud has not accepted yet, in queue order
//! - Known devices and the firmware they last reported
//!
//! [`SharedStore`] implements the core's `UpgradeStore`, so the upgrade
//! orchestrator persists through it directly.
//!
//! # Example
//!
//! ```no_run
//! use sensorgate_store::Store;
//!
//! let store = Store::open_default()?;
//! for state in store.list_upgrade_states()? {
//!     println!("{}: {}", state.device_id, state.state);
//! }
//! # Ok::<(), sensorgate_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{Snapshot, StoredDevice};
pub use schema::SCHEMA_VERSION;
pub use store::{SharedStore, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/sensorgate/gateway.db`
/// - macOS: `~/Library/Application Support/sensorgate/gateway.db`
/// - Windows: `C:\Users\<user>\AppData\Local\sensorgate\gateway.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("sensorgate")
        .join("gateway.db")
}
