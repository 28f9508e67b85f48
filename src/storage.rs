//! The entry store: row-level persistence behind the facade.
//!
//! [`EventEntryStore`] is the capability set the facade drives: persist an
//! event or snapshot row, stream an aggregate's rows in sequence order,
//! load the newest snapshot, prune old snapshots, and visit the global
//! timeline filtered by criteria. [`SqliteEntryStore`] is the direct-SQL
//! implementation.
//!
//! Every operation takes the caller's `&Connection`; this crate never
//! begins, commits, or rolls back transactions.
//!
//! ## Cursors and resource closure
//!
//! Reads return a [`RowCursor`]: a forward-only iterator that fetches rows
//! in batches, each batch on demand. A batch fetch prepares a statement,
//! drains it, and drops it before returning, so every statement and result
//! set is released deterministically -- whether the cursor is consumed to
//! the end, dropped after one element, or turns out to be empty before
//! iteration even starts.

use std::collections::VecDeque;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::codec::EventRow;
use crate::criteria::{ColumnVocabulary, Criteria};
use crate::error::Result;
use crate::schema::EntryTables;
use crate::types::{Representation, SerializedData, SerializedObject, SerializedType};

// =============================================================================
// Exception resolution
// =============================================================================

/// Decides whether a backend error is a duplicate-key violation on an
/// entry row.
///
/// The facade consults the configured resolver to translate such errors
/// into [`Error::Concurrency`](crate::Error); everything else propagates
/// untranslated.
pub trait PersistenceExceptionResolver: Send + Sync {
    /// Returns true if the error represents a uniqueness violation.
    fn is_duplicate_key_violation(&self, error: &rusqlite::Error) -> bool;
}

/// Default resolver for the SQLite backend.
///
/// Recognizes the PRIMARY KEY and UNIQUE extended result codes, the SQLite
/// analog of the SQL-state `23xxx` integrity family. NOT NULL and CHECK
/// violations are deliberately not treated as duplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDuplicateKeyResolver;

impl PersistenceExceptionResolver for SqliteDuplicateKeyResolver {
    fn is_duplicate_key_violation(&self, error: &rusqlite::Error) -> bool {
        matches!(
            error,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        )
    }
}

// =============================================================================
// Row cursor
// =============================================================================

/// Fetches the next batch of rows, up to the given limit. Implementations
/// carry their own pagination state and must release every statement they
/// open before returning.
pub type BatchFetch<'c> = Box<dyn FnMut(usize) -> Result<Vec<EventRow>> + 'c>;

/// A forward-only, batch-fetching cursor over entry rows.
///
/// Each underfull batch marks the cursor exhausted; a failed fetch yields
/// one `Err` and exhausts it.
pub struct RowCursor<'c> {
    fetch: BatchFetch<'c>,
    buffer: VecDeque<EventRow>,
    batch_size: usize,
    exhausted: bool,
}

impl<'c> RowCursor<'c> {
    /// A cursor driving the given batch fetcher.
    pub fn new(batch_size: usize, fetch: BatchFetch<'c>) -> Self {
        Self {
            fetch,
            buffer: VecDeque::new(),
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }
}

impl Iterator for RowCursor<'_> {
    type Item = Result<EventRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.buffer.pop_front() {
            return Some(Ok(row));
        }
        if self.exhausted {
            return None;
        }
        match (self.fetch)(self.batch_size) {
            Ok(batch) => {
                if batch.len() < self.batch_size {
                    self.exhausted = true;
                }
                self.buffer.extend(batch);
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// Entry store abstraction
// =============================================================================

/// Row-level operations over the two entity sets.
///
/// Implementations are interchangeable behind the facade; the shipped one
/// is [`SqliteEntryStore`]. All operations run on the caller's connection.
pub trait EventEntryStore: Send + Sync {
    /// Inserts one domain row. Uniqueness violations surface as the raw
    /// backend error.
    fn persist_event(&self, conn: &Connection, row: &EventRow) -> Result<()>;

    /// Inserts one snapshot row, with the same violation semantics.
    fn persist_snapshot(&self, conn: &Connection, row: &EventRow) -> Result<()>;

    /// The snapshot row with the highest sequence number for the aggregate,
    /// or `None`.
    fn load_last_snapshot(&self, conn: &Connection, aggregate_id: &str)
        -> Result<Option<EventRow>>;

    /// Deletes all but the newest `keep` snapshots for the aggregate.
    /// Returns the number of rows removed.
    fn prune_snapshots(&self, conn: &Connection, aggregate_id: &str, keep: usize)
        -> Result<usize>;

    /// A cursor over the aggregate's domain rows with
    /// `sequence_number >= first_sequence`, in ascending sequence order,
    /// fetched in batches of `batch_size`.
    fn fetch_aggregate_stream<'c>(
        &self,
        conn: &'c Connection,
        aggregate_id: &str,
        first_sequence: u64,
        batch_size: usize,
    ) -> RowCursor<'c>;

    /// A cursor over all domain rows matching `criteria`, ordered by
    /// timestamp ascending with ties broken by
    /// (aggregate identifier, sequence number) ascending.
    ///
    /// # Errors
    ///
    /// Fails immediately when the criteria cannot be emitted against this
    /// store's column vocabulary.
    fn visit_rows<'c>(
        &self,
        conn: &'c Connection,
        criteria: Option<&Criteria>,
        batch_size: usize,
    ) -> Result<RowCursor<'c>>;

    /// The serialized representation this store prefers for payload and
    /// metadata columns.
    fn representation(&self) -> Representation;

    /// The entity-set names and timestamp conversion this store uses.
    fn tables(&self) -> &EntryTables;
}

// =============================================================================
// SQLite implementation
// =============================================================================

const ENTRY_COLUMNS: &str = "event_identifier, aggregate_identifier, sequence_number, \
                             time_stamp, payload_type, payload_revision, payload, meta_data";

/// Direct-SQL entry store for SQLite.
#[derive(Debug, Clone)]
pub struct SqliteEntryStore {
    tables: EntryTables,
    representation: Representation,
    vocabulary: ColumnVocabulary,
}

impl SqliteEntryStore {
    /// An entry store over the default table names, binary representation.
    pub fn new() -> Self {
        Self {
            tables: EntryTables::default(),
            representation: Representation::Binary,
            vocabulary: ColumnVocabulary::standard(),
        }
    }

    /// Uses custom entity-set names.
    pub fn with_tables(mut self, tables: EntryTables) -> Self {
        self.tables = tables;
        self
    }

    /// Stores payload and metadata columns in the given representation.
    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representation = representation;
        self
    }

    /// Extends the criteria vocabulary with an extra property.
    pub fn with_criteria_property(
        mut self,
        property: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.vocabulary = self.vocabulary.with_property(property, column);
        self
    }

    fn insert(&self, conn: &Connection, table: &str, row: &EventRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        );
        conn.execute(
            &sql,
            params![
                row.event_identifier,
                row.aggregate_identifier,
                row.sequence_number as i64,
                row.time_stamp,
                row.payload.ty.name,
                row.payload.ty.revision,
                data_value(&row.payload.data),
                data_value(&row.meta_data.data),
            ],
        )?;
        Ok(())
    }
}

impl Default for SqliteEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEntryStore for SqliteEntryStore {
    fn persist_event(&self, conn: &Connection, row: &EventRow) -> Result<()> {
        self.insert(conn, self.tables.domain_event_table(), row)
    }

    fn persist_snapshot(&self, conn: &Connection, row: &EventRow) -> Result<()> {
        self.insert(conn, self.tables.snapshot_table(), row)
    }

    fn load_last_snapshot(
        &self,
        conn: &Connection,
        aggregate_id: &str,
    ) -> Result<Option<EventRow>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM {} WHERE aggregate_identifier = ?1 \
             ORDER BY sequence_number DESC LIMIT 1",
            self.tables.snapshot_table()
        );
        let row = conn
            .query_row(&sql, params![aggregate_id], read_row)
            .optional()?;
        Ok(row)
    }

    fn prune_snapshots(
        &self,
        conn: &Connection,
        aggregate_id: &str,
        keep: usize,
    ) -> Result<usize> {
        let table = self.tables.snapshot_table();
        let sql = format!(
            "DELETE FROM {table} WHERE aggregate_identifier = ?1 AND sequence_number NOT IN ( \
                 SELECT sequence_number FROM {table} WHERE aggregate_identifier = ?1 \
                 ORDER BY sequence_number DESC LIMIT ?2)"
        );
        let removed = conn.execute(&sql, params![aggregate_id, keep as i64])?;
        if removed > 0 {
            tracing::debug!(aggregate_id, removed, keep, "pruned archived snapshots");
        }
        Ok(removed)
    }

    fn fetch_aggregate_stream<'c>(
        &self,
        conn: &'c Connection,
        aggregate_id: &str,
        first_sequence: u64,
        batch_size: usize,
    ) -> RowCursor<'c> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM {} WHERE aggregate_identifier = ?1 \
             AND sequence_number >= ?2 ORDER BY sequence_number ASC LIMIT ?3",
            self.tables.domain_event_table()
        );
        let aggregate_id = aggregate_id.to_string();
        let mut next_sequence = first_sequence as i64;

        RowCursor::new(
            batch_size,
            Box::new(move |limit| {
                let mut stmt = conn.prepare(&sql)?;
                let mut batch = Vec::with_capacity(limit);
                let rows = stmt.query_map(
                    params![aggregate_id, next_sequence, limit as i64],
                    read_row,
                )?;
                for row in rows {
                    batch.push(row?);
                }
                if let Some(last) = batch.last() {
                    next_sequence = last.sequence_number as i64 + 1;
                }
                Ok(batch)
            }),
        )
    }

    fn visit_rows<'c>(
        &self,
        conn: &'c Connection,
        criteria: Option<&Criteria>,
        batch_size: usize,
    ) -> Result<RowCursor<'c>> {
        let tables = self.tables.clone();
        let mut base_clauses: Vec<String> = Vec::new();
        let mut base_params: Vec<Value> = Vec::new();
        if let Some(criteria) = criteria {
            let fragment = criteria.to_sql(
                &self.vocabulary,
                &|t| tables.resolve_timestamp(t),
                &mut base_params,
            )?;
            base_clauses.push(format!("({fragment})"));
        }

        let table = self.tables.domain_event_table().to_string();
        // Keyset over the visitation order; (None until the first batch).
        let mut last_key: Option<(i64, String, i64)> = None;

        Ok(RowCursor::new(
            batch_size,
            Box::new(move |limit| {
                let mut clauses = base_clauses.clone();
                let mut params = base_params.clone();
                if let Some((time_stamp, aggregate_id, sequence)) = &last_key {
                    clauses.push(
                        "(time_stamp, aggregate_identifier, sequence_number) > (?, ?, ?)"
                            .to_string(),
                    );
                    params.push(Value::Integer(*time_stamp));
                    params.push(Value::Text(aggregate_id.clone()));
                    params.push(Value::Integer(*sequence));
                }

                let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM {table}");
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                sql.push_str(
                    " ORDER BY time_stamp ASC, aggregate_identifier ASC, sequence_number ASC \
                     LIMIT ?",
                );
                params.push(Value::Integer(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let mut batch = Vec::with_capacity(limit);
                let rows = stmt.query_map(params_from_iter(params), read_row)?;
                for row in rows {
                    batch.push(row?);
                }
                if let Some(last) = batch.last() {
                    last_key = Some((
                        last.time_stamp,
                        last.aggregate_identifier.clone(),
                        last.sequence_number as i64,
                    ));
                }
                Ok(batch)
            }),
        ))
    }

    fn representation(&self) -> Representation {
        self.representation
    }

    fn tables(&self) -> &EntryTables {
        &self.tables
    }
}

fn data_value(data: &SerializedData) -> Value {
    match data {
        SerializedData::Bytes(b) => Value::Blob(b.clone()),
        SerializedData::Text(s) => Value::Text(s.clone()),
    }
}

fn read_data(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<SerializedData> {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx)? {
        ValueRef::Blob(b) => Ok(SerializedData::Bytes(b.to_vec())),
        ValueRef::Text(t) => Ok(SerializedData::Text(
            String::from_utf8_lossy(t).into_owned(),
        )),
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "payload".to_string(),
            other.data_type(),
        )),
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_identifier: row.get(0)?,
        aggregate_identifier: row.get(1)?,
        sequence_number: row.get::<_, i64>(2)? as u64,
        time_stamp: row.get(3)?,
        payload: SerializedObject {
            ty: SerializedType {
                name: row.get(4)?,
                revision: row.get(5)?,
            },
            data: read_data(row, 6)?,
        },
        meta_data: SerializedObject {
            ty: SerializedType::new(crate::serializer::META_DATA_TYPE),
            data: read_data(row, 7)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::CriteriaBuilder;
    use crate::schema::Database;
    use crate::types::SerializedType;

    fn setup() -> (Connection, SqliteEntryStore) {
        let db = Database::open_in_memory().expect("create db");
        (db.into_connection(), SqliteEntryStore::new())
    }

    fn row(aggregate_id: &str, sequence: u64, time_stamp: i64) -> EventRow {
        EventRow {
            event_identifier: format!("{aggregate_id}-{sequence}"),
            aggregate_identifier: aggregate_id.to_string(),
            sequence_number: sequence,
            time_stamp,
            payload: SerializedObject::new(
                SerializedType::new("Stub"),
                SerializedData::Bytes(format!("{{\"n\":{sequence}}}").into_bytes()),
            ),
            meta_data: SerializedObject::new(
                SerializedType::new("MetaData"),
                SerializedData::Bytes(b"{}".to_vec()),
            ),
        }
    }

    #[test]
    fn aggregate_stream_is_batched_and_ordered() {
        let (conn, store) = setup();
        for seq in 0..25 {
            store.persist_event(&conn, &row("agg", seq, 1000 + seq as i64)).unwrap();
        }
        // Unrelated aggregate must not leak into the stream.
        store.persist_event(&conn, &row("other", 0, 1)).unwrap();

        let rows: Vec<EventRow> = store
            .fetch_aggregate_stream(&conn, "agg", 0, 10)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(rows.len(), 25);
        for (i, r) in rows.iter().enumerate() {
            assert_eq!(r.sequence_number, i as u64);
            assert_eq!(r.aggregate_identifier, "agg");
        }
    }

    #[test]
    fn aggregate_stream_honors_first_sequence() {
        let (conn, store) = setup();
        for seq in 0..5 {
            store.persist_event(&conn, &row("agg", seq, 1000)).unwrap();
        }

        let rows: Vec<EventRow> = store
            .fetch_aggregate_stream(&conn, "agg", 3, 100)
            .collect::<Result<_>>()
            .unwrap();
        let sequences: Vec<u64> = rows.iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let (conn, store) = setup();
        let mut cursor = store.fetch_aggregate_stream(&conn, "missing", 0, 100);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn duplicate_sequence_number_is_a_duplicate_key_violation() {
        let (conn, store) = setup();
        store.persist_event(&conn, &row("agg", 0, 1)).unwrap();

        let mut duplicate = row("agg", 0, 2);
        duplicate.event_identifier = "distinct-id".to_string();
        let err = store.persist_event(&conn, &duplicate).unwrap_err();

        let sqlite_err = match &err {
            crate::Error::Sqlite(e) => e,
            other => panic!("expected sqlite error, got {other:?}"),
        };
        assert!(SqliteDuplicateKeyResolver.is_duplicate_key_violation(sqlite_err));
    }

    #[test]
    fn duplicate_event_identifier_is_a_duplicate_key_violation() {
        let (conn, store) = setup();
        store.persist_event(&conn, &row("agg", 0, 1)).unwrap();

        let mut duplicate = row("agg", 1, 2);
        duplicate.event_identifier = "agg-0".to_string();
        let err = store.persist_event(&conn, &duplicate).unwrap_err();

        let sqlite_err = match &err {
            crate::Error::Sqlite(e) => e,
            other => panic!("expected sqlite error, got {other:?}"),
        };
        assert!(SqliteDuplicateKeyResolver.is_duplicate_key_violation(sqlite_err));
    }

    #[test]
    fn resolver_ignores_other_errors() {
        assert!(!SqliteDuplicateKeyResolver
            .is_duplicate_key_violation(&rusqlite::Error::InvalidQuery));
    }

    #[test]
    fn last_snapshot_is_the_highest_sequence() {
        let (conn, store) = setup();
        assert!(store.load_last_snapshot(&conn, "agg").unwrap().is_none());

        store.persist_snapshot(&conn, &row("agg", 3, 1)).unwrap();
        store.persist_snapshot(&conn, &row("agg", 7, 2)).unwrap();
        store.persist_snapshot(&conn, &row("agg", 5, 3)).unwrap();

        let snapshot = store.load_last_snapshot(&conn, "agg").unwrap().unwrap();
        assert_eq!(snapshot.sequence_number, 7);
    }

    #[test]
    fn prune_keeps_the_newest_snapshots() {
        let (conn, store) = setup();
        for seq in [3u64, 4, 9, 12] {
            store.persist_snapshot(&conn, &row("agg", seq, seq as i64)).unwrap();
        }
        store.persist_snapshot(&conn, &row("other", 1, 1)).unwrap();

        let removed = store.prune_snapshots(&conn, "agg", 2).unwrap();
        assert_eq!(removed, 2);

        let remaining: Vec<u64> = {
            let mut stmt = conn
                .prepare(
                    "SELECT sequence_number FROM snapshot_event_entry \
                     WHERE aggregate_identifier = 'agg' ORDER BY sequence_number",
                )
                .unwrap();
            stmt.query_map([], |r| r.get::<_, i64>(0))
                .unwrap()
                .map(|r| r.unwrap() as u64)
                .collect()
        };
        assert_eq!(remaining, vec![9, 12]);

        // Other aggregates are untouched.
        assert!(store.load_last_snapshot(&conn, "other").unwrap().is_some());
    }

    #[test]
    fn visit_orders_by_timestamp_then_aggregate_and_sequence() {
        let (conn, store) = setup();
        store.persist_event(&conn, &row("b", 0, 200)).unwrap();
        store.persist_event(&conn, &row("a", 0, 100)).unwrap();
        store.persist_event(&conn, &row("a", 1, 200)).unwrap();
        store.persist_event(&conn, &row("c", 0, 50)).unwrap();

        let rows: Vec<EventRow> = store
            .visit_rows(&conn, None, 2)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let order: Vec<(i64, String)> = rows
            .iter()
            .map(|r| (r.time_stamp, r.aggregate_identifier.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (50, "c".to_string()),
                (100, "a".to_string()),
                (200, "a".to_string()),
                (200, "b".to_string()),
            ]
        );
    }

    #[test]
    fn visit_applies_criteria() {
        let (conn, store) = setup();
        for (i, ts) in [100i64, 200, 300, 400].iter().enumerate() {
            store.persist_event(&conn, &row("agg", i as u64, *ts)).unwrap();
        }

        let criteria = CriteriaBuilder.property("timeStamp").greater_than(150i64);
        let rows: Vec<EventRow> = store
            .visit_rows(&conn, Some(&criteria), 100)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.time_stamp > 150));
    }

    #[test]
    fn visit_with_unknown_property_fails_at_call_time() {
        let (conn, store) = setup();
        let criteria = CriteriaBuilder.property("colour").equals("red");
        assert!(store.visit_rows(&conn, Some(&criteria), 10).is_err());
    }

    #[test]
    fn text_representation_round_trips_through_the_column() {
        let (conn, store) = setup();
        let mut text_row = row("agg", 0, 1);
        text_row.payload.data = SerializedData::Text("{\"n\":0}".to_string());
        store.persist_event(&conn, &text_row).unwrap();

        let rows: Vec<EventRow> = store
            .fetch_aggregate_stream(&conn, "agg", 0, 10)
            .collect::<Result<_>>()
            .unwrap();
        assert!(matches!(rows[0].payload.data, SerializedData::Text(_)));
    }
}
