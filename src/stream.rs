//! Stream assembly: turning entry-row cursors into message sequences.
//!
//! [`UpcastingRowSource`] pulls rows from a [`RowCursor`] and expands each
//! one through the upcaster chain as it is consumed, so a stored row can
//! become zero, one, or several [`StoredEvent`]s. Payloads stay in
//! serialized form at this stage.
//!
//! [`DomainEventStream`] is what `read_events` returns: an optional
//! snapshot head followed by the upcast row source, bounded by an optional
//! last sequence number. It is forward-only, single-pass, finite, and not
//! restartable. Its `next()` forces payload resolution, which is where an
//! unresolvable payload type surfaces for aggregate replays; global visits
//! iterate the row source directly and leave payloads deferred.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec::EventRow;
use crate::error::Result;
use crate::schema::EntryTables;
use crate::serializer::Serializer;
use crate::storage::RowCursor;
use crate::types::{PayloadState, StoredEvent};
use crate::upcasting::{UpcasterChain, UpcastingContext};

/// Deserializes a snapshot row eagerly into a message.
///
/// Snapshots bypass the upcaster chain; any failure here makes the caller
/// fall back to a full replay.
pub(crate) fn snapshot_event(
    row: &EventRow,
    serializer: &Arc<dyn Serializer>,
    tables: &EntryTables,
) -> Result<StoredEvent> {
    let meta_data = serializer.deserialize_meta_data(&row.meta_data)?;
    let payload = serializer.deserialize(&row.payload)?;
    Ok(StoredEvent {
        event_identifier: row.event_identifier.clone(),
        aggregate_identifier: row.aggregate_identifier.clone(),
        sequence_number: row.sequence_number,
        timestamp: row.timestamp(tables),
        payload: PayloadState::Resolved(payload),
        meta_data,
    })
}

/// Lazily expands entry rows into stored events through the upcaster chain.
///
/// Every output of a fan-out inherits the source row's identity fields and
/// metadata; only payload and payload type may differ. A row whose fan-out
/// is empty simply disappears from the sequence.
pub(crate) struct UpcastingRowSource<'c> {
    cursor: RowCursor<'c>,
    serializer: Arc<dyn Serializer>,
    chain: Arc<dyn UpcasterChain>,
    tables: EntryTables,
    pending: VecDeque<StoredEvent>,
}

impl<'c> UpcastingRowSource<'c> {
    pub(crate) fn new(
        cursor: RowCursor<'c>,
        serializer: Arc<dyn Serializer>,
        chain: Arc<dyn UpcasterChain>,
        tables: EntryTables,
    ) -> Self {
        Self {
            cursor,
            serializer,
            chain,
            tables,
            pending: VecDeque::new(),
        }
    }

    fn expand(&self, row: EventRow) -> Result<Vec<StoredEvent>> {
        let meta_data = self.serializer.deserialize_meta_data(&row.meta_data)?;
        let timestamp = row.timestamp(&self.tables);
        let context = UpcastingContext {
            event_identifier: &row.event_identifier,
            aggregate_identifier: &row.aggregate_identifier,
            sequence_number: row.sequence_number,
            timestamp,
            meta_data: &meta_data,
        };
        let outputs = self.chain.upcast(row.payload.clone(), &context);

        Ok(outputs
            .into_iter()
            .map(|serialized| StoredEvent {
                event_identifier: row.event_identifier.clone(),
                aggregate_identifier: row.aggregate_identifier.clone(),
                sequence_number: row.sequence_number,
                timestamp,
                payload: PayloadState::Deferred {
                    serialized,
                    serializer: Arc::clone(&self.serializer),
                },
                meta_data: meta_data.clone(),
            })
            .collect())
    }
}

impl Iterator for UpcastingRowSource<'_> {
    type Item = Result<StoredEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            match self.cursor.next()? {
                Ok(row) => match self.expand(row) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// The lazy event sequence returned by `read_events`.
///
/// Yields the snapshot first when one heads the stream, then domain events
/// in ascending sequence order. Forward-only and single-pass; not
/// shareable across threads.
pub struct DomainEventStream<'c> {
    snapshot: Option<StoredEvent>,
    source: UpcastingRowSource<'c>,
    last_sequence: Option<u64>,
    peeked: Option<Result<StoredEvent>>,
    done: bool,
}

impl<'c> std::fmt::Debug for DomainEventStream<'c> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainEventStream").finish_non_exhaustive()
    }
}

impl<'c> DomainEventStream<'c> {
    pub(crate) fn new(
        snapshot: Option<StoredEvent>,
        source: UpcastingRowSource<'c>,
        last_sequence: Option<u64>,
    ) -> Self {
        Self {
            snapshot,
            source,
            last_sequence,
            peeked: None,
            done: false,
        }
    }

    fn advance(&mut self) -> Option<Result<StoredEvent>> {
        if self.done {
            return None;
        }
        if let Some(snapshot) = self.snapshot.take() {
            return Some(Ok(snapshot));
        }
        match self.source.next() {
            Some(Ok(mut event)) => {
                if self
                    .last_sequence
                    .is_some_and(|last| event.sequence_number > last)
                {
                    self.done = true;
                    return None;
                }
                // Aggregate replays resolve payloads on consumption, so an
                // unresolvable type fails the iteration here.
                if let Err(e) = event.resolve_payload() {
                    return Some(Err(e));
                }
                Some(Ok(event))
            }
            Some(Err(e)) => Some(Err(e)),
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Prefetches the next element without consuming it.
    pub fn peek(&mut self) -> Option<&Result<StoredEvent>> {
        if self.peeked.is_none() {
            self.peeked = self.advance();
        }
        self.peeked.as_ref()
    }
}

impl Iterator for DomainEventStream<'_> {
    type Item = Result<StoredEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.peeked.take() {
            Some(item) => Some(item),
            None => self.advance(),
        }
    }
}
