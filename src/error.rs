//! Error types for annal operations.
//!
//! A single [`Error`] enum covers every failure mode, so callers can match
//! uniformly: retry on [`Error::Concurrency`], treat [`Error::StreamNotFound`]
//! as "aggregate does not exist", and propagate the rest.
//!
//! Translated concurrency failures and untranslated integrity failures are
//! distinguishable by variant, never by message parsing: a configured
//! [`PersistenceExceptionResolver`](crate::storage::PersistenceExceptionResolver)
//! turns duplicate-key violations into [`Error::Concurrency`]; without one the
//! raw backend error escapes as [`Error::Persistence`], which names the
//! entity set it was writing to.

use thiserror::Error;

/// Which entity set an append was writing to when it failed.
///
/// Shows up in error messages so a duplicate snapshot reads differently
/// from a duplicate event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A row in the domain-event entity set.
    Event,
    /// A row in the snapshot entity set.
    Snapshot,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Event => write!(f, "event"),
            EntryKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// All errors that can occur in annal operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Optimistic concurrency conflict: a row with this
    /// (aggregate identifier, sequence number) already exists.
    ///
    /// The standard recovery is to re-load the aggregate and retry the
    /// command against the fresh sequence number.
    #[error(
        "concurrent modification detected: a {entry} for aggregate '{aggregate_id}' \
         at sequence number {sequence_number} is already present"
    )]
    Concurrency {
        /// Whether the colliding row was an event or a snapshot.
        entry: EntryKind,
        /// The aggregate whose stream collided.
        aggregate_id: String,
        /// The sequence number that was already taken.
        sequence_number: u64,
    },

    /// A read was requested for an aggregate with no events and no snapshot.
    #[error("no event stream found for aggregate '{aggregate_id}'")]
    StreamNotFound {
        /// The aggregate that has no persisted rows.
        aggregate_id: String,
    },

    /// A stored payload's declared type could not be resolved during
    /// deserialization.
    ///
    /// Surfaces on stream consumption for aggregate reads; global visits
    /// tolerate it and deliver the message with its payload unresolved.
    #[error("cannot resolve serialized type '{type_name}'")]
    UnknownSerializedType {
        /// The declared payload type name.
        type_name: String,
    },

    /// An integrity violation that no resolver translated, or any other
    /// failure while writing a row.
    ///
    /// The message names the entity set so callers can tell which table
    /// rejected the write.
    #[error("could not persist an {entry} into '{table}'")]
    Persistence {
        /// Whether the failing row was an event or a snapshot.
        entry: EntryKind,
        /// The entity-set (table) name the insert targeted.
        table: String,
        /// The backend error.
        #[source]
        source: rusqlite::Error,
    },

    /// Payload or metadata could not be serialized or deserialized.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A criteria expression could not be turned into an executable form,
    /// e.g. it names a property the entry store does not know.
    #[error("invalid criteria: {0}")]
    Criteria(String),

    /// Any other SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corrupted metadata.
    #[error("schema error: {0}")]
    Schema(String),
}

/// A `Result` type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
