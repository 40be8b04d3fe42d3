//! Database schema.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        info!("Creating database schema v{}", SCHEMA_VERSION);
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Known devices, upgrade records and the offline report queue.
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- Known peripherals and the firmware they last reported
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            family TEXT NOT NULL,
            model TEXT,
            firmware TEXT,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );

        -- One upgrade record per device
        CREATE TABLE IF NOT EXISTS upgrade_states (
            device_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            firmware_file_location TEXT,
            md5_checksum TEXT,
            file_token TEXT,
            transaction_id TEXT,
            error_message TEXT,
            canceled INTEGER NOT NULL DEFAULT 0,
            start_time INTEGER,
            updated_at INTEGER NOT NULL
        );

        -- Reports the cloud has not accepted yet
        CREATE TABLE IF NOT EXISTS pending_transactions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL UNIQUE,
            device_id TEXT,
            outcome TEXT NOT NULL,
            message TEXT,
            queued_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}
