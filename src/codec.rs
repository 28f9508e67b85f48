//! Row codec: event messages to and from their persisted form.
//!
//! [`EventRow`] is the single persisted shape used for both entity sets.
//! Encoding copies the identity fields of a [`DomainEvent`], resolves the
//! construction timestamp to the column representation through
//! [`EntryTables::resolve_timestamp`], and carries the two already-serialized
//! objects (payload and metadata) with their declared types. Decoding back
//! into messages happens in the stream assembler, where payload reification
//! stays lazy.

use chrono::{DateTime, Utc};

use crate::schema::EntryTables;
use crate::types::{DomainEvent, SerializedObject};

/// The persisted form of an event or snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    /// Globally unique event identifier.
    pub event_identifier: String,
    /// The aggregate the row belongs to.
    pub aggregate_identifier: String,
    /// Position within the aggregate stream.
    pub sequence_number: u64,
    /// Construction timestamp in the column representation (epoch millis).
    pub time_stamp: i64,
    /// Serialized payload with its declared type and revision.
    pub payload: SerializedObject,
    /// Serialized metadata.
    pub meta_data: SerializedObject,
}

impl EventRow {
    /// Encodes an event message and its two serialized objects into a row.
    pub fn encode(
        event: &DomainEvent,
        payload: SerializedObject,
        meta_data: SerializedObject,
        tables: &EntryTables,
    ) -> Self {
        Self {
            event_identifier: event.event_identifier.clone(),
            aggregate_identifier: event.aggregate_identifier.clone(),
            sequence_number: event.sequence_number,
            time_stamp: tables.resolve_timestamp(&event.timestamp),
            payload,
            meta_data,
        }
    }

    /// The row's timestamp as an instant.
    pub fn timestamp(&self, tables: &EntryTables) -> DateTime<Utc> {
        tables.timestamp_from_column(self.time_stamp)
    }
}
