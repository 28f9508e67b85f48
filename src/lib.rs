//! # annal -- an append-only event store for event-sourced aggregates
//!
//! annal persists the immutable, ordered sequence of events an aggregate
//! produces and replays it on demand, on SQLite. It provides three
//! services:
//!
//! - **Append** one or more events for an aggregate, with optimistic
//!   concurrency control backed by a UNIQUE
//!   (aggregate identifier, sequence number) constraint.
//! - **Read** an aggregate's stream in order, optionally starting from its
//!   latest snapshot, as a lazy batched iterator.
//! - **Visit** every event in timestamp order, optionally filtered by
//!   criteria, for administrative replays and projection rebuilds.
//!
//! ```text
//! append ──► serializer ──► row codec ──► entry store ──► SQLite
//!                                             │
//! read  ◄── stream assembler ◄── upcasters ◄──┘  (batched cursor)
//! ```
//!
//! ## Core invariants
//!
//! 1. Per aggregate, sequence numbers of persisted events are dense and
//!    ascending from 0; a duplicate surfaces as a concurrency error.
//! 2. Event identifiers are globally unique.
//! 3. Timestamps are stamped at event construction, never at persistence.
//! 4. Rows are immutable; domain rows are never deleted, snapshot rows
//!    only by pruning.
//!
//! ## Transactions
//!
//! Every operation takes a `&rusqlite::Connection` and runs inside the
//! caller's transaction; the store never begins, commits, or rolls back.
//!
//! ## Example
//!
//! ```no_run
//! use annal::{Database, DomainEvent, EventPayload, EventStore};
//! use serde_json::json;
//!
//! # fn main() -> annal::Result<()> {
//! let conn = Database::open("events.db")?.into_connection();
//! let store = EventStore::new();
//!
//! store.append_events(
//!     &conn,
//!     &[DomainEvent::new(
//!         "order-1",
//!         0,
//!         EventPayload::new("OrderPlaced", json!({ "total": 42 })),
//!     )],
//! )?;
//!
//! for event in store.read_events(&conn, "order-1")? {
//!     let event = event?;
//!     println!("{} @ {}", event.aggregate_identifier, event.sequence_number);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod criteria;
pub mod error;
pub mod schema;
pub mod serializer;
pub mod storage;
pub mod store;
pub mod stream;
pub mod types;
pub mod upcasting;

pub use codec::EventRow;
pub use criteria::{ColumnVocabulary, Criteria, CriteriaBuilder, CriterionValue};
pub use error::{EntryKind, Error, Result};
pub use schema::{Database, EntryTables};
pub use serializer::{JsonSerializer, Serializer};
pub use storage::{
    BatchFetch, EventEntryStore, PersistenceExceptionResolver, RowCursor,
    SqliteDuplicateKeyResolver, SqliteEntryStore,
};
pub use store::{EventStore, EventStoreBuilder, EventVisitor, DEFAULT_BATCH_SIZE};
pub use stream::DomainEventStream;
pub use types::{
    DomainEvent, EventPayload, MetaData, Representation, SerializedData, SerializedObject,
    SerializedType, StoredEvent,
};
pub use upcasting::{
    IdentityUpcasterChain, SimpleUpcasterChain, Upcaster, UpcasterChain, UpcastingContext,
};
