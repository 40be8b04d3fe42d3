//! Main store implementation.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use sensorgate_core::UpgradeStore;
use sensorgate_types::{
    DeviceFamily, PendingTransaction, TransactionOutcome, UpgradeState, UpgradeStatus,
};

use crate::error::{Error, Result};
use crate::models::{Snapshot, StoredDevice};
use crate::schema;

/// SQLite-based store for upgrade records and known devices.
pub struct Store {
    conn: Connection,
}

fn conversion_error<E>(index: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, ty, Box::new(err))
}

fn timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let ts: i64 = row.get(index)?;
    OffsetDateTime::from_unix_timestamp(ts).map_err(|e| conversion_error(index, Type::Integer, e))
}

fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(index)?;
    text.parse::<T>()
        .map_err(|e| conversion_error(index, Type::Text, e))
}

fn family_name(family: DeviceFamily) -> &'static str {
    match family {
        DeviceFamily::SensorTag => "sensortag",
        DeviceFamily::SensorNode => "sensornode",
        _ => unreachable!("unhandled device family {family:?}"),
    }
}

fn parse_family(row: &Row<'_>, index: usize) -> rusqlite::Result<DeviceFamily> {
    let text: String = row.get(index)?;
    match text.as_str() {
        "sensortag" => Ok(DeviceFamily::SensorTag),
        "sensornode" => Ok(DeviceFamily::SensorNode),
        other => Err(conversion_error(
            index,
            Type::Text,
            Error::Corrupt(format!("unknown device family '{other}'")),
        )),
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

const DEVICE_COLUMNS: &str = "id, name, family, model, firmware, first_seen, last_seen";

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        id: row.get(0)?,
        name: row.get(1)?,
        family: parse_family(row, 2)?,
        model: row.get(3)?,
        firmware: row.get(4)?,
        first_seen: timestamp(row, 5)?,
        last_seen: timestamp(row, 6)?,
    })
}

const UPGRADE_COLUMNS: &str = "device_id, state, firmware_file_location, md5_checksum, \
     file_token, transaction_id, error_message, canceled, start_time";

fn upgrade_from_row(row: &Row<'_>) -> rusqlite::Result<UpgradeState> {
    Ok(UpgradeState {
        device_id: row.get(0)?,
        state: parse_column::<UpgradeStatus>(row, 1)?,
        firmware_file_location: row.get(2)?,
        md5_checksum: row.get(3)?,
        file_token: row.get(4)?,
        transaction_id: row.get(5)?,
        error_message: row.get(6)?,
        canceled: row.get(7)?,
        start_time: row.get(8)?,
    })
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingTransaction> {
    Ok(PendingTransaction {
        transaction_id: row.get(0)?,
        device_id: row.get(1)?,
        outcome: parse_column::<TransactionOutcome>(row, 2)?,
        message: row.get(3)?,
        queued_at: row.get(4)?,
    })
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // === Device operations ===

    /// Record that a device was seen, creating it if needed.
    pub fn upsert_device(
        &self,
        device_id: &str,
        name: &str,
        family: DeviceFamily,
        model: Option<&str>,
    ) -> Result<StoredDevice> {
        self.conn.execute(
            "INSERT INTO devices (id, name, family, model, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = ?2,
                family = ?3,
                model = COALESCE(?4, model),
                last_seen = ?5",
            rusqlite::params![device_id, name, family_name(family), model, now()],
        )?;

        self.get_device(device_id)?
            .ok_or_else(|| Error::Corrupt(format!("device {device_id} vanished after upsert")))
    }

    /// Remember the firmware version a device reported.
    ///
    /// Returns `false` if the device is unknown.
    pub fn set_firmware(&self, device_id: &str, firmware: &str) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE devices SET firmware = ?2, last_seen = ?3 WHERE id = ?1",
            rusqlite::params![device_id, firmware, now()],
        )?;
        Ok(updated > 0)
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?");
        let device = self
            .conn
            .query_row(&sql, [device_id], device_from_row)
            .optional()?;
        Ok(device)
    }

    /// List all devices, most recently seen first.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY last_seen DESC, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    // === Upgrade records ===

    /// Load the upgrade record of a device.
    pub fn load_upgrade_state(&self, device_id: &str) -> Result<Option<UpgradeState>> {
        let sql = format!("SELECT {UPGRADE_COLUMNS} FROM upgrade_states WHERE device_id = ?");
        let state = self
            .conn
            .query_row(&sql, [device_id], upgrade_from_row)
            .optional()?;
        Ok(state)
    }

    /// Insert or replace the upgrade record of a device.
    pub fn save_upgrade_state(&self, state: &UpgradeState) -> Result<()> {
        debug!(device = %state.device_id, state = %state.state, "Saving upgrade record");
        self.conn.execute(
            "INSERT INTO upgrade_states (device_id, state, firmware_file_location, md5_checksum,
                file_token, transaction_id, error_message, canceled, start_time, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(device_id) DO UPDATE SET
                state = ?2,
                firmware_file_location = ?3,
                md5_checksum = ?4,
                file_token = ?5,
                transaction_id = ?6,
                error_message = ?7,
                canceled = ?8,
                start_time = ?9,
                updated_at = ?10",
            rusqlite::params![
                state.device_id,
                state.state.as_str(),
                state.firmware_file_location,
                state.md5_checksum,
                state.file_token,
                state.transaction_id,
                state.error_message,
                state.canceled,
                state.start_time,
                now(),
            ],
        )?;
        Ok(())
    }

    /// All upgrade records, ordered by device id.
    pub fn list_upgrade_states(&self) -> Result<Vec<UpgradeState>> {
        let sql = format!("SELECT {UPGRADE_COLUMNS} FROM upgrade_states ORDER BY device_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let states = stmt
            .query_map([], upgrade_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(states)
    }

    // === Offline report queue ===

    /// Queued reports, oldest first.
    pub fn pending_transactions(&self) -> Result<Vec<PendingTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, device_id, outcome, message, queued_at
             FROM pending_transactions ORDER BY seq",
        )?;
        let pending = stmt
            .query_map([], pending_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pending)
    }

    /// Queue a report. A report already queued for the same transaction is
    /// replaced and moves to the back of the queue.
    pub fn push_pending(&self, pending: &PendingTransaction) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_transactions
                (transaction_id, device_id, outcome, message, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                pending.transaction_id,
                pending.device_id,
                pending.outcome.as_str(),
                pending.message,
                pending.queued_at,
            ],
        )?;
        Ok(())
    }

    /// Drop a delivered report. Returns `false` if it was not queued.
    pub fn remove_pending(&self, transaction_id: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM pending_transactions WHERE transaction_id = ?",
            [transaction_id],
        )?;
        Ok(removed > 0)
    }

    // === Export ===

    /// Everything in the store.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            exported_at: OffsetDateTime::now_utc(),
            devices: self.list_devices()?,
            upgrades: self.list_upgrade_states()?,
            pending: self.pending_transactions()?,
        })
    }

    /// Export the store as pretty-printed JSON.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot()?)?)
    }
}

/// A [`Store`] behind a mutex, usable as the upgrade orchestrator's
/// [`UpgradeStore`].
pub struct SharedStore {
    inner: Mutex<Store>,
}

impl SharedStore {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Mutex::new(store),
        }
    }

    /// Lock the store for direct access.
    pub fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UpgradeStore for SharedStore {
    fn load_state(&self, device_id: &str) -> sensorgate_core::Result<Option<UpgradeState>> {
        Ok(self.lock().load_upgrade_state(device_id)?)
    }

    fn save_state(&self, state: &UpgradeState) -> sensorgate_core::Result<()> {
        Ok(self.lock().save_upgrade_state(state)?)
    }

    fn all_states(&self) -> sensorgate_core::Result<Vec<UpgradeState>> {
        Ok(self.lock().list_upgrade_states()?)
    }

    fn pending_transactions(&self) -> sensorgate_core::Result<Vec<PendingTransaction>> {
        Ok(self.lock().pending_transactions()?)
    }

    fn push_pending(&self, pending: &PendingTransaction) -> sensorgate_core::Result<()> {
        Ok(self.lock().push_pending(pending)?)
    }

    fn remove_pending(&self, transaction_id: &str) -> sensorgate_core::Result<()> {
        self.lock().remove_pending(transaction_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(tx: &str, outcome: TransactionOutcome, queued_at: i64) -> PendingTransaction {
        PendingTransaction {
            transaction_id: tx.to_string(),
            device_id: Some("node-1".to_string()),
            outcome,
            message: None,
            queued_at,
        }
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.list_devices().unwrap().is_empty());
        assert!(store.list_upgrade_states().unwrap().is_empty());
        assert!(store.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_device() {
        let store = Store::open_in_memory().unwrap();

        let device = store
            .upsert_device("node-1", "SensorNode 01", DeviceFamily::SensorNode, Some("SN-100"))
            .unwrap();
        assert_eq!(device.family, DeviceFamily::SensorNode);
        assert_eq!(device.model.as_deref(), Some("SN-100"));

        // a missing model keeps the known one
        let device = store
            .upsert_device("node-1", "Kitchen", DeviceFamily::SensorNode, None)
            .unwrap();
        assert_eq!(device.name, "Kitchen");
        assert_eq!(device.model.as_deref(), Some("SN-100"));
        assert_eq!(store.list_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_set_firmware() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.set_firmware("node-1", "sn_nrf52_1.0.0").unwrap());

        store
            .upsert_device("node-1", "Node", DeviceFamily::SensorNode, None)
            .unwrap();
        assert!(store.set_firmware("node-1", "sn_nrf52_1.0.0").unwrap());
        let device = store.get_device("node-1").unwrap().unwrap();
        assert_eq!(device.firmware.as_deref(), Some("sn_nrf52_1.0.0"));
    }

    #[test]
    fn test_upgrade_state_save_and_load() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_upgrade_state("node-1").unwrap().is_none());

        let mut state = UpgradeState::idle("node-1");
        state.state = UpgradeStatus::Upgrading;
        state.transaction_id = Some("tx-1".into());
        state.file_token = Some("tok".into());
        state.md5_checksum = Some("abc".into());
        state.firmware_file_location = Some("/tmp/tok.bin".into());
        state.start_time = Some(1_700_000_000);
        state.canceled = true;
        store.save_upgrade_state(&state).unwrap();
        assert_eq!(store.load_upgrade_state("node-1").unwrap(), Some(state.clone()));

        state.reset();
        store.save_upgrade_state(&state).unwrap();
        assert_eq!(
            store.load_upgrade_state("node-1").unwrap(),
            Some(UpgradeState::idle("node-1"))
        );
        assert_eq!(store.list_upgrade_states().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_queue_order_and_replace() {
        let store = Store::open_in_memory().unwrap();
        store
            .push_pending(&pending("tx-1", TransactionOutcome::Succeeded, 10))
            .unwrap();
        store
            .push_pending(&pending("tx-2", TransactionOutcome::Failed, 20))
            .unwrap();
        store
            .push_pending(&pending("tx-1", TransactionOutcome::Failed, 30))
            .unwrap();

        let queue = store.pending_transactions().unwrap();
        let ids: Vec<&str> = queue.iter().map(|p| p.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["tx-2", "tx-1"]);
        assert_eq!(queue[1].outcome, TransactionOutcome::Failed);

        assert!(store.remove_pending("tx-2").unwrap());
        assert!(!store.remove_pending("tx-2").unwrap());
        assert_eq!(store.pending_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_export_json() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_device("tag-1", "SensorTag", DeviceFamily::SensorTag, None)
            .unwrap();
        store
            .push_pending(&pending("tx-1", TransactionOutcome::Succeeded, 10))
            .unwrap();

        let json = store.export_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["devices"][0]["id"], "tag-1");
        assert_eq!(value["pending"][0]["outcome"], "succeeded");
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO upgrade_states (device_id, state, canceled, updated_at)
                 VALUES ('x', 'exploded', 0, 0)",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.load_upgrade_state("x"),
            Err(Error::Database(_))
        ));
    }
}
