//! Domain types for the event store.
//!
//! The message types come in an input/output pair:
//!
//! - [`DomainEvent`] is what callers append. Its timestamp is stamped from
//!   the process [`clock`](crate::clock) at construction and its identifier
//!   is a fresh UUID.
//! - [`StoredEvent`] is what reads and visits yield. Its payload may still
//!   be in serialized form; [`StoredEvent::payload`] forces deserialization
//!   and is the point where an unresolvable payload type surfaces.
//!
//! ## Invariants
//!
//! - `sequence_number` is dense and ascending per aggregate, starting at 0.
//! - `event_identifier` is globally unique.
//! - Timestamps are immutable once a message is constructed.
//! - [`MetaData`] attached to a message is never mutated; the
//!   `with_meta_data` / `and_meta_data` methods return new messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock;
use crate::error::Result;
use crate::serializer::Serializer;

// =============================================================================
// Serialized representation
// =============================================================================

/// The wire shape an entry store prefers for payload and metadata columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Representation {
    /// Store serialized objects as BLOBs.
    #[default]
    Binary,
    /// Store serialized objects as TEXT.
    Text,
}

/// A logical payload type: name plus optional revision string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedType {
    /// The logical type name, e.g. `"OrderPlaced"`.
    pub name: String,
    /// The revision of that type, if any.
    pub revision: Option<String>,
}

impl SerializedType {
    /// Creates a type without a revision.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: None,
        }
    }

    /// Creates a type with a revision.
    pub fn with_revision(name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: Some(revision.into()),
        }
    }
}

/// Serialized bytes or text, matching the column affinity they are stored
/// with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializedData {
    /// Binary representation.
    Bytes(Vec<u8>),
    /// Textual representation.
    Text(String),
}

impl SerializedData {
    /// Returns the underlying bytes regardless of representation.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SerializedData::Bytes(b) => b,
            SerializedData::Text(s) => s.as_bytes(),
        }
    }
}

/// A serialized payload or metadata object together with its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedObject {
    /// Declared type and revision of the serialized content.
    pub ty: SerializedType,
    /// The serialized content.
    pub data: SerializedData,
}

impl SerializedObject {
    /// Creates a serialized object.
    pub fn new(ty: SerializedType, data: SerializedData) -> Self {
        Self { ty, data }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Immutable string-keyed metadata attached to an event.
///
/// Keys are unique; values are opaque JSON. Attached metadata never changes;
/// deriving a message with different metadata produces a new message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaData(BTreeMap<String, Value>);

impl MetaData {
    /// The empty metadata.
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Builds metadata from key/value pairs.
    pub fn from_entries<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Looks up a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns a copy with the given entries merged in; entries being added
    /// win on key collision.
    pub fn merged_with(&self, other: &MetaData) -> MetaData {
        let mut merged = self.0.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone());
        }
        MetaData(merged)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// The logical payload of an event: a type name, an optional revision, and
/// an opaque JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPayload {
    /// Logical type name used for deserialization routing.
    pub type_name: String,
    /// Revision of the payload type.
    pub revision: Option<String>,
    /// The payload body.
    pub data: Value,
}

impl EventPayload {
    /// Creates a payload without a revision.
    pub fn new(type_name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            type_name: type_name.into(),
            revision: None,
            data: data.into(),
        }
    }

    /// Creates a payload with a revision.
    pub fn with_revision(
        type_name: impl Into<String>,
        revision: impl Into<String>,
        data: impl Into<Value>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            revision: Some(revision.into()),
            data: data.into(),
        }
    }

    /// The declared type of this payload.
    pub fn serialized_type(&self) -> SerializedType {
        SerializedType {
            name: self.type_name.clone(),
            revision: self.revision.clone(),
        }
    }
}

// =============================================================================
// Input message
// =============================================================================

/// An event to be appended: the input form.
///
/// The identifier is generated at construction and the timestamp is taken
/// from the process clock at that moment; both are immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    /// Globally unique event identifier.
    pub event_identifier: String,
    /// The aggregate this event belongs to.
    pub aggregate_identifier: String,
    /// Position of this event within the aggregate stream, starting at 0.
    pub sequence_number: u64,
    /// Instant the event was constructed.
    pub timestamp: DateTime<Utc>,
    /// The event payload.
    pub payload: EventPayload,
    /// Metadata attached to the event.
    pub meta_data: MetaData,
}

impl DomainEvent {
    /// Creates an event with empty metadata, stamped with the current
    /// process-clock instant and a fresh identifier.
    pub fn new(
        aggregate_identifier: impl Into<String>,
        sequence_number: u64,
        payload: EventPayload,
    ) -> Self {
        Self::with_meta(aggregate_identifier, sequence_number, payload, MetaData::empty())
    }

    /// Creates an event with metadata attached.
    pub fn with_meta(
        aggregate_identifier: impl Into<String>,
        sequence_number: u64,
        payload: EventPayload,
        meta_data: MetaData,
    ) -> Self {
        Self {
            event_identifier: Uuid::new_v4().to_string(),
            aggregate_identifier: aggregate_identifier.into(),
            sequence_number,
            timestamp: clock::now(),
            payload,
            meta_data,
        }
    }

    /// Returns a copy of this event with its metadata replaced.
    ///
    /// Identity fields and timestamp are preserved.
    pub fn with_meta_data(&self, meta_data: MetaData) -> Self {
        Self {
            meta_data,
            ..self.clone()
        }
    }

    /// Returns a copy of this event with the given entries merged into its
    /// metadata; added entries win on key collision.
    pub fn and_meta_data(&self, additional: MetaData) -> Self {
        Self {
            meta_data: self.meta_data.merged_with(&additional),
            ..self.clone()
        }
    }
}

// =============================================================================
// Output message
// =============================================================================

/// Payload of a [`StoredEvent`]: either already deserialized, or still in
/// serialized form awaiting reification.
pub(crate) enum PayloadState {
    Resolved(EventPayload),
    Deferred {
        serialized: SerializedObject,
        serializer: Arc<dyn Serializer>,
    },
}

impl Clone for PayloadState {
    fn clone(&self) -> Self {
        match self {
            PayloadState::Resolved(p) => PayloadState::Resolved(p.clone()),
            PayloadState::Deferred {
                serialized,
                serializer,
            } => PayloadState::Deferred {
                serialized: serialized.clone(),
                serializer: Arc::clone(serializer),
            },
        }
    }
}

/// A persisted event as yielded by reads and visits: the output form.
///
/// Identity fields are always available. The payload may still be in
/// serialized form; [`StoredEvent::payload`] forces deserialization, which
/// fails with [`Error::UnknownSerializedType`](crate::Error) when the
/// declared type is not resolvable. [`StoredEvent::payload_type`] never
/// forces.
#[derive(Clone)]
pub struct StoredEvent {
    /// Globally unique event identifier.
    pub event_identifier: String,
    /// The aggregate this event belongs to.
    pub aggregate_identifier: String,
    /// Position within the aggregate stream.
    pub sequence_number: u64,
    /// Instant the event was originally constructed.
    pub timestamp: DateTime<Utc>,
    pub(crate) payload: PayloadState,
    /// Metadata recorded with the event.
    pub meta_data: MetaData,
}

impl StoredEvent {
    /// The declared type of the payload, available without deserializing.
    pub fn payload_type(&self) -> SerializedType {
        match &self.payload {
            PayloadState::Resolved(p) => p.serialized_type(),
            PayloadState::Deferred { serialized, .. } => serialized.ty.clone(),
        }
    }

    /// The payload, deserializing it if it has not been reified yet.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSerializedType`](crate::Error) when the declared
    /// type cannot be resolved, or a serialization error when the stored
    /// bytes are not valid for it.
    pub fn payload(&self) -> Result<EventPayload> {
        match &self.payload {
            PayloadState::Resolved(p) => Ok(p.clone()),
            PayloadState::Deferred {
                serialized,
                serializer,
            } => serializer.deserialize(serialized),
        }
    }

    /// Forces payload deserialization in place, caching the result.
    pub(crate) fn resolve_payload(&mut self) -> Result<()> {
        if let PayloadState::Deferred {
            serialized,
            serializer,
        } = &self.payload
        {
            let payload = serializer.deserialize(serialized)?;
            self.payload = PayloadState::Resolved(payload);
        }
        Ok(())
    }

    /// Returns a copy of this event with its metadata replaced.
    pub fn with_meta_data(&self, meta_data: MetaData) -> Self {
        Self {
            meta_data,
            ..self.clone()
        }
    }

    /// Returns a copy with the given entries merged into its metadata;
    /// added entries win on key collision.
    pub fn and_meta_data(&self, additional: MetaData) -> Self {
        Self {
            meta_data: self.meta_data.merged_with(&additional),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for StoredEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredEvent")
            .field("event_identifier", &self.event_identifier)
            .field("aggregate_identifier", &self.aggregate_identifier)
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("payload_type", &self.payload_type())
            .field("meta_data", &self.meta_data)
            .finish()
    }
}
