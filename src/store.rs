//! The event-store facade.
//!
//! [`EventStore`] is the public surface: append events and snapshots, read
//! an aggregate's stream, visit the global timeline. It is synchronous and
//! safe to share across threads; every operation runs on the caller's
//! connection inside the caller's transaction.
//!
//! ## Concurrency semantics
//!
//! The store never serializes appends itself. The UNIQUE
//! (aggregate identifier, sequence number) constraint is the oracle: of two
//! racing appends at the same sequence number, at most one succeeds and the
//! other surfaces as [`Error::Concurrency`] once the configured
//! [`PersistenceExceptionResolver`] recognizes the violation. Within one
//! `append_events` call events persist in the order supplied, and the first
//! failure stops the call -- the enclosing transaction is expected to roll
//! back, so partial appends never become visible.
//!
//! Configuration setters exist for setup; mutating them under concurrent
//! load is not supported.

use std::sync::Arc;

use rusqlite::Connection;

use crate::codec::EventRow;
use crate::criteria::{Criteria, CriteriaBuilder};
use crate::error::{EntryKind, Error, Result};
use crate::serializer::{JsonSerializer, Serializer};
use crate::storage::{
    EventEntryStore, PersistenceExceptionResolver, SqliteDuplicateKeyResolver, SqliteEntryStore,
};
use crate::stream::{self, DomainEventStream, UpcastingRowSource};
use crate::types::{DomainEvent, StoredEvent};
use crate::upcasting::{IdentityUpcasterChain, UpcasterChain};

/// Default cursor prefetch size.
pub const DEFAULT_BATCH_SIZE: usize = 100;

// =============================================================================
// Visitor
// =============================================================================

/// Callback invoked once per message during a global scan.
///
/// Payload reification is deferred for visited messages: calling
/// [`StoredEvent::payload`] may fail for unresolvable types, but the scan
/// itself delivers every matching message.
pub trait EventVisitor {
    /// Handles one visited event.
    fn do_with_event(&mut self, event: &StoredEvent);
}

impl<F: FnMut(&StoredEvent)> EventVisitor for F {
    fn do_with_event(&mut self, event: &StoredEvent) {
        self(event)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and builds an [`EventStore`].
pub struct EventStoreBuilder {
    entry_store: Box<dyn EventEntryStore>,
    serializer: Arc<dyn Serializer>,
    upcaster_chain: Arc<dyn UpcasterChain>,
    resolver: Option<Box<dyn PersistenceExceptionResolver>>,
    batch_size: usize,
    max_snapshots_archived: Option<usize>,
}

impl EventStoreBuilder {
    fn new() -> Self {
        Self {
            entry_store: Box::new(SqliteEntryStore::new()),
            serializer: Arc::new(JsonSerializer::new()),
            upcaster_chain: Arc::new(IdentityUpcasterChain),
            resolver: Some(Box::new(SqliteDuplicateKeyResolver)),
            batch_size: DEFAULT_BATCH_SIZE,
            max_snapshots_archived: None,
        }
    }

    /// Uses a custom entry store.
    pub fn entry_store(mut self, entry_store: impl EventEntryStore + 'static) -> Self {
        self.entry_store = Box::new(entry_store);
        self
    }

    /// Uses a shared serializer instance.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Installs an upcaster chain; defaults to the identity chain.
    pub fn upcaster_chain(mut self, chain: impl UpcasterChain + 'static) -> Self {
        self.upcaster_chain = Arc::new(chain);
        self
    }

    /// Replaces the default duplicate-key resolver.
    pub fn persistence_exception_resolver(
        mut self,
        resolver: impl PersistenceExceptionResolver + 'static,
    ) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Disables exception translation: integrity errors pass through
    /// untranslated.
    pub fn without_exception_translation(mut self) -> Self {
        self.resolver = None;
        self
    }

    /// Cursor prefetch size; must be at least 1.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size >= 1, "batch_size must be at least 1");
        self.batch_size = batch_size;
        self
    }

    /// Caps archived snapshots per aggregate; must be at least 1.
    pub fn max_snapshots_archived(mut self, max: usize) -> Self {
        assert!(max >= 1, "max_snapshots_archived must be at least 1");
        self.max_snapshots_archived = Some(max);
        self
    }

    /// Builds the store.
    pub fn build(self) -> EventStore {
        EventStore {
            entry_store: self.entry_store,
            serializer: self.serializer,
            upcaster_chain: self.upcaster_chain,
            resolver: self.resolver,
            batch_size: self.batch_size,
            max_snapshots_archived: self.max_snapshots_archived,
        }
    }
}

// =============================================================================
// Facade
// =============================================================================

/// The event store: append, read, and visit persisted domain events.
pub struct EventStore {
    entry_store: Box<dyn EventEntryStore>,
    serializer: Arc<dyn Serializer>,
    upcaster_chain: Arc<dyn UpcasterChain>,
    resolver: Option<Box<dyn PersistenceExceptionResolver>>,
    batch_size: usize,
    max_snapshots_archived: Option<usize>,
}

impl EventStore {
    /// A store over the default SQLite entry store and JSON serializer.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a store.
    pub fn builder() -> EventStoreBuilder {
        EventStoreBuilder::new()
    }

    // -------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------

    /// Replaces the upcaster chain.
    pub fn set_upcaster_chain(&mut self, chain: impl UpcasterChain + 'static) {
        self.upcaster_chain = Arc::new(chain);
    }

    /// Replaces the exception resolver; `None` disables translation.
    pub fn set_persistence_exception_resolver(
        &mut self,
        resolver: Option<Box<dyn PersistenceExceptionResolver>>,
    ) {
        self.resolver = resolver;
    }

    /// Changes the cursor prefetch size; must be at least 1.
    pub fn set_batch_size(&mut self, batch_size: usize) {
        assert!(batch_size >= 1, "batch_size must be at least 1");
        self.batch_size = batch_size;
    }

    /// Changes the archived-snapshot cap; `None` means unbounded.
    pub fn set_max_snapshots_archived(&mut self, max: Option<usize>) {
        if let Some(max) = max {
            assert!(max >= 1, "max_snapshots_archived must be at least 1");
        }
        self.max_snapshots_archived = max;
    }

    /// A criteria builder scoped to the entry store's column vocabulary.
    pub fn new_criteria_builder(&self) -> CriteriaBuilder {
        CriteriaBuilder
    }

    // -------------------------------------------------------------------
    // Appending
    // -------------------------------------------------------------------

    /// Appends events in the order supplied.
    ///
    /// # Errors
    ///
    /// [`Error::Concurrency`] when a row with the same
    /// (aggregate identifier, sequence number) or event identifier already
    /// exists and the resolver recognizes the violation;
    /// [`Error::Persistence`] for unrecognized or untranslated insert
    /// failures. The first failing event stops the call; the caller's
    /// transaction must roll back to discard earlier rows of the same call.
    pub fn append_events(&self, conn: &Connection, events: &[DomainEvent]) -> Result<()> {
        for event in events {
            let row = self.encode(event)?;
            self.entry_store
                .persist_event(conn, &row)
                .map_err(|e| self.translate(e, EntryKind::Event, event))?;
        }
        Ok(())
    }

    /// Appends one snapshot, then prunes the aggregate's archive down to
    /// `max_snapshots_archived` when a cap is configured.
    ///
    /// # Errors
    ///
    /// [`Error::Concurrency`] (its message mentions "snapshot") when a
    /// snapshot at this sequence number already exists.
    pub fn append_snapshot_event(&self, conn: &Connection, event: &DomainEvent) -> Result<()> {
        let row = self.encode(event)?;
        self.entry_store
            .persist_snapshot(conn, &row)
            .map_err(|e| self.translate(e, EntryKind::Snapshot, event))?;

        if let Some(keep) = self.max_snapshots_archived {
            self.entry_store
                .prune_snapshots(conn, &event.aggregate_identifier, keep)?;
        }
        Ok(())
    }

    fn encode(&self, event: &DomainEvent) -> Result<EventRow> {
        let representation = self.entry_store.representation();
        let payload = self.serializer.serialize(&event.payload, representation)?;
        let meta_data = self
            .serializer
            .serialize_meta_data(&event.meta_data, representation)?;
        Ok(EventRow::encode(
            event,
            payload,
            meta_data,
            self.entry_store.tables(),
        ))
    }

    fn translate(&self, error: Error, entry: EntryKind, event: &DomainEvent) -> Error {
        let sqlite_error = match error {
            Error::Sqlite(e) => e,
            other => return other,
        };
        if let Some(resolver) = &self.resolver {
            if resolver.is_duplicate_key_violation(&sqlite_error) {
                return Error::Concurrency {
                    entry,
                    aggregate_id: event.aggregate_identifier.clone(),
                    sequence_number: event.sequence_number,
                };
            }
        }
        let table = match entry {
            EntryKind::Event => self.entry_store.tables().domain_event_table(),
            EntryKind::Snapshot => self.entry_store.tables().snapshot_table(),
        };
        Error::Persistence {
            entry,
            table: table.to_string(),
            source: sqlite_error,
        }
    }

    // -------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------

    /// Reads the aggregate's full stream: the latest snapshot when one is
    /// usable, followed by all events past it.
    ///
    /// A snapshot that fails to deserialize is treated as absent and the
    /// full stream from sequence 0 is returned instead; the fallback is
    /// logged, never surfaced.
    ///
    /// # Errors
    ///
    /// [`Error::StreamNotFound`] when the aggregate has no events and no
    /// snapshot.
    pub fn read_events<'c>(
        &self,
        conn: &'c Connection,
        aggregate_id: &str,
    ) -> Result<DomainEventStream<'c>> {
        let snapshot = match self.entry_store.load_last_snapshot(conn, aggregate_id)? {
            Some(row) => {
                match stream::snapshot_event(&row, &self.serializer, self.entry_store.tables()) {
                    Ok(event) => Some(event),
                    Err(error) => {
                        tracing::warn!(
                            aggregate_id,
                            %error,
                            "snapshot could not be deserialized; replaying the full stream"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let first_sequence = snapshot.as_ref().map_or(0, |s| s.sequence_number + 1);
        self.assemble(conn, aggregate_id, snapshot, first_sequence, None)
    }

    /// Reads events with `sequence_number >= first_sequence`, ignoring
    /// snapshots entirely.
    pub fn read_events_from<'c>(
        &self,
        conn: &'c Connection,
        aggregate_id: &str,
        first_sequence: u64,
    ) -> Result<DomainEventStream<'c>> {
        self.assemble(conn, aggregate_id, None, first_sequence, None)
    }

    /// Reads events with `sequence_number` in
    /// `[first_sequence, last_sequence]` inclusive, ignoring snapshots.
    pub fn read_events_between<'c>(
        &self,
        conn: &'c Connection,
        aggregate_id: &str,
        first_sequence: u64,
        last_sequence: u64,
    ) -> Result<DomainEventStream<'c>> {
        self.assemble(
            conn,
            aggregate_id,
            None,
            first_sequence,
            Some(last_sequence),
        )
    }

    fn assemble<'c>(
        &self,
        conn: &'c Connection,
        aggregate_id: &str,
        snapshot: Option<StoredEvent>,
        first_sequence: u64,
        last_sequence: Option<u64>,
    ) -> Result<DomainEventStream<'c>> {
        let cursor =
            self.entry_store
                .fetch_aggregate_stream(conn, aggregate_id, first_sequence, self.batch_size);
        let source = UpcastingRowSource::new(
            cursor,
            Arc::clone(&self.serializer),
            Arc::clone(&self.upcaster_chain),
            self.entry_store.tables().clone(),
        );
        let mut stream = DomainEventStream::new(snapshot, source, last_sequence);
        if stream.peek().is_none() {
            return Err(Error::StreamNotFound {
                aggregate_id: aggregate_id.to_string(),
            });
        }
        Ok(stream)
    }

    // -------------------------------------------------------------------
    // Visiting
    // -------------------------------------------------------------------

    /// Visits every domain event in timestamp order.
    ///
    /// The visitor runs once per produced message: a row fanned out into N
    /// messages by the upcaster chain yields N calls. Messages with
    /// unresolvable payload types are delivered with their payload
    /// deferred; they never fail the scan.
    pub fn visit_events(&self, conn: &Connection, visitor: &mut dyn EventVisitor) -> Result<()> {
        self.visit(conn, None, visitor)
    }

    /// Visits the domain events matching `criteria`, in timestamp order.
    pub fn visit_events_matching(
        &self,
        conn: &Connection,
        criteria: &Criteria,
        visitor: &mut dyn EventVisitor,
    ) -> Result<()> {
        self.visit(conn, Some(criteria), visitor)
    }

    fn visit(
        &self,
        conn: &Connection,
        criteria: Option<&Criteria>,
        visitor: &mut dyn EventVisitor,
    ) -> Result<()> {
        let cursor = self
            .entry_store
            .visit_rows(conn, criteria, self.batch_size)?;
        let source = UpcastingRowSource::new(
            cursor,
            Arc::clone(&self.serializer),
            Arc::clone(&self.upcaster_chain),
            self.entry_store.tables().clone(),
        );
        for event in source {
            visitor.do_with_event(&event?);
        }
        Ok(())
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}
