//! SQLite schema for the event store.
//!
//! Two entity sets, identical in shape:
//!
//! - `domain_event_entry` -- the append-only log of domain events
//! - `snapshot_event_entry` -- archived aggregate snapshots
//!
//! ## Columns
//!
//! - `event_identifier` TEXT, globally unique (PK)
//! - `aggregate_identifier` TEXT
//! - `sequence_number` INTEGER, dense ascending per aggregate from 0
//! - `time_stamp` INTEGER, epoch milliseconds of event construction
//! - `payload_type` TEXT, `payload_revision` TEXT NULL
//! - `payload` BLOB, `meta_data` BLOB (TEXT values are accepted too;
//!   SQLite affinity preserves whichever representation was written)
//!
//! UNIQUE(aggregate_identifier, sequence_number) on both tables is the
//! optimistic-concurrency oracle: the second writer of a taken sequence
//! number gets a constraint violation, never a silent overwrite. The
//! `time_stamp` index serves global visitation scans.
//!
//! Table names and the instant-to-column conversion are supplied by
//! [`EntryTables`], so deployments can rename the entity sets without
//! touching any SQL in this crate.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::{Error, Result};

/// Current schema version. Incremented on breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Default name of the domain-event entity set.
pub const DEFAULT_DOMAIN_EVENT_TABLE: &str = "domain_event_entry";

/// Default name of the snapshot entity set.
pub const DEFAULT_SNAPSHOT_TABLE: &str = "snapshot_event_entry";

// =============================================================================
// Entry tables
// =============================================================================

/// Supplies the entity-set names and the instant-to-column conversion used
/// by the schema and every entry-store statement.
#[derive(Debug, Clone)]
pub struct EntryTables {
    domain_events: String,
    snapshots: String,
}

impl EntryTables {
    /// Tables with custom names.
    pub fn named(domain_events: impl Into<String>, snapshots: impl Into<String>) -> Self {
        Self {
            domain_events: domain_events.into(),
            snapshots: snapshots.into(),
        }
    }

    /// Name of the domain-event entity set.
    pub fn domain_event_table(&self) -> &str {
        &self.domain_events
    }

    /// Name of the snapshot entity set.
    pub fn snapshot_table(&self) -> &str {
        &self.snapshots
    }

    /// Converts an instant to the integer representation stored in the
    /// `time_stamp` column.
    pub fn resolve_timestamp(&self, at: &DateTime<Utc>) -> i64 {
        at.timestamp_millis()
    }

    /// Recovers an instant from the stored column value.
    pub fn timestamp_from_column(&self, millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
    }

    fn entry_table_ddl(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
    event_identifier     TEXT NOT NULL PRIMARY KEY,
    aggregate_identifier TEXT NOT NULL,
    sequence_number      INTEGER NOT NULL,
    time_stamp           INTEGER NOT NULL,
    payload_type         TEXT NOT NULL,
    payload_revision     TEXT,
    payload              BLOB NOT NULL,
    meta_data            BLOB NOT NULL,
    UNIQUE (aggregate_identifier, sequence_number)
)"
        )
    }

    fn timestamp_index_ddl(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {0}_time_stamp ON {0} (time_stamp)",
            self.domain_events
        )
    }
}

impl Default for EntryTables {
    fn default() -> Self {
        Self::named(DEFAULT_DOMAIN_EVENT_TABLE, DEFAULT_SNAPSHOT_TABLE)
    }
}

// =============================================================================
// Database wrapper
// =============================================================================

const CREATE_METADATA: &str = "CREATE TABLE IF NOT EXISTS annal_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

/// A SQLite connection with the event-store schema installed.
///
/// Owns its [`Connection`]; dropping the `Database` closes it. Use
/// [`Database::into_connection`] to hand the connection to the store
/// facade -- transactions stay under the caller's control.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if necessary) a database file with the default
    /// table names.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open_with_tables(path, &EntryTables::default())
    }

    /// Opens a database file with custom entity-set names.
    pub fn open_with_tables(
        path: impl AsRef<std::path::Path>,
        tables: &EntryTables,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        let mut db = Self { conn };
        db.initialize(tables)?;
        Ok(db)
    }

    /// Creates an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_tables(&EntryTables::default())
    }

    /// Creates an in-memory database with custom entity-set names.
    pub fn open_in_memory_with_tables(tables: &EntryTables) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(tables)?;
        Ok(db)
    }

    /// Creates tables and indexes (idempotent) and verifies the schema
    /// version.
    fn initialize(&mut self, tables: &EntryTables) -> Result<()> {
        self.conn
            .execute_batch(&tables.entry_table_ddl(tables.domain_event_table()))?;
        self.conn
            .execute_batch(&tables.entry_table_ddl(tables.snapshot_table()))?;
        self.conn.execute_batch(&tables.timestamp_index_ddl())?;
        self.conn.execute_batch(CREATE_METADATA)?;
        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM annal_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO annal_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(v) if v == SCHEMA_VERSION => Ok(()),
            Some(v) => Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, this crate requires {SCHEMA_VERSION}"
            ))),
        }
    }

    /// Consumes the wrapper, yielding the raw connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Borrows the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
