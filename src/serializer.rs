//! Payload and metadata serialization.
//!
//! The store never interprets payload bodies; it hands them to a
//! [`Serializer`] on the way in and out. The shipped implementation is
//! [`JsonSerializer`], which keeps a registry of known payload type names.
//! Deserializing a type that is not in the registry fails with
//! [`Error::UnknownSerializedType`](crate::Error) -- that is how rows written
//! by a newer (or foreign) process surface when the current process cannot
//! reify them.
//!
//! Metadata bypasses the registry: it is a plain JSON map with a fixed type
//! tag.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{
    EventPayload, MetaData, Representation, SerializedData, SerializedObject, SerializedType,
};

/// Type tag under which metadata maps are stored.
pub const META_DATA_TYPE: &str = "MetaData";

/// Serializes payloads and metadata to the entry store's preferred
/// representation and back.
pub trait Serializer: Send + Sync {
    /// Serializes a payload.
    fn serialize(&self, payload: &EventPayload, repr: Representation) -> Result<SerializedObject>;

    /// Deserializes a payload, resolving its declared type.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSerializedType`] when the declared type cannot be
    /// resolved.
    fn deserialize(&self, object: &SerializedObject) -> Result<EventPayload>;

    /// Serializes a metadata map.
    fn serialize_meta_data(
        &self,
        meta_data: &MetaData,
        repr: Representation,
    ) -> Result<SerializedObject>;

    /// Deserializes a metadata map.
    fn deserialize_meta_data(&self, object: &SerializedObject) -> Result<MetaData>;
}

/// JSON serializer backed by `serde_json`.
///
/// Payload types are tracked in an interior registry. Serializing a payload
/// registers its type, so anything appended in-process can be read back;
/// types written by other processes must be registered up front with
/// [`JsonSerializer::register`].
#[derive(Debug, Default)]
pub struct JsonSerializer {
    known_types: RwLock<HashMap<String, Option<String>>>,
}

impl JsonSerializer {
    /// Creates a serializer with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a payload type name without a revision.
    pub fn register(&self, type_name: impl Into<String>) {
        self.known_types
            .write()
            .expect("type registry poisoned")
            .insert(type_name.into(), None);
    }

    /// Registers a payload type name at a revision.
    pub fn register_with_revision(
        &self,
        type_name: impl Into<String>,
        revision: impl Into<String>,
    ) {
        self.known_types
            .write()
            .expect("type registry poisoned")
            .insert(type_name.into(), Some(revision.into()));
    }

    /// Returns true if the type name is resolvable.
    pub fn can_resolve(&self, type_name: &str) -> bool {
        self.known_types
            .read()
            .expect("type registry poisoned")
            .contains_key(type_name)
    }

    fn encode(value: &Value, repr: Representation) -> Result<SerializedData> {
        Ok(match repr {
            Representation::Binary => SerializedData::Bytes(serde_json::to_vec(value)?),
            Representation::Text => SerializedData::Text(serde_json::to_string(value)?),
        })
    }

    fn decode(data: &SerializedData) -> Result<Value> {
        Ok(serde_json::from_slice(data.as_bytes())?)
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, payload: &EventPayload, repr: Representation) -> Result<SerializedObject> {
        self.known_types
            .write()
            .expect("type registry poisoned")
            .entry(payload.type_name.clone())
            .or_insert_with(|| payload.revision.clone());

        Ok(SerializedObject::new(
            payload.serialized_type(),
            Self::encode(&payload.data, repr)?,
        ))
    }

    fn deserialize(&self, object: &SerializedObject) -> Result<EventPayload> {
        if !self.can_resolve(&object.ty.name) {
            return Err(Error::UnknownSerializedType {
                type_name: object.ty.name.clone(),
            });
        }
        Ok(EventPayload {
            type_name: object.ty.name.clone(),
            revision: object.ty.revision.clone(),
            data: Self::decode(&object.data)?,
        })
    }

    fn serialize_meta_data(
        &self,
        meta_data: &MetaData,
        repr: Representation,
    ) -> Result<SerializedObject> {
        let value = serde_json::to_value(meta_data)?;
        Ok(SerializedObject::new(
            SerializedType::new(META_DATA_TYPE),
            Self::encode(&value, repr)?,
        ))
    }

    fn deserialize_meta_data(&self, object: &SerializedObject) -> Result<MetaData> {
        Ok(serde_json::from_slice(object.data.as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_registers_the_payload_type() {
        let serializer = JsonSerializer::new();
        let payload = EventPayload::new("OrderPlaced", json!({"total": 12}));

        assert!(!serializer.can_resolve("OrderPlaced"));
        let object = serializer.serialize(&payload, Representation::Binary).unwrap();
        assert!(serializer.can_resolve("OrderPlaced"));

        let back = serializer.deserialize(&object).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn unknown_type_fails_deserialization() {
        let serializer = JsonSerializer::new();
        let object = SerializedObject::new(
            SerializedType::new("unknown"),
            SerializedData::Bytes(b"{}".to_vec()),
        );

        let err = serializer.deserialize(&object).unwrap_err();
        assert!(matches!(err, Error::UnknownSerializedType { type_name } if type_name == "unknown"));
    }

    #[test]
    fn text_representation_round_trips() {
        let serializer = JsonSerializer::new();
        let payload = EventPayload::with_revision("Stub", "2", json!(["a", "b"]));
        let object = serializer.serialize(&payload, Representation::Text).unwrap();

        assert!(matches!(object.data, SerializedData::Text(_)));
        assert_eq!(object.ty.revision.as_deref(), Some("2"));
        assert_eq!(serializer.deserialize(&object).unwrap(), payload);
    }

    #[test]
    fn meta_data_round_trips_without_registry() {
        let serializer = JsonSerializer::new();
        let meta = MetaData::from_entries([("key", json!("Value"))]);
        let object = serializer
            .serialize_meta_data(&meta, Representation::Binary)
            .unwrap();

        assert_eq!(object.ty.name, META_DATA_TYPE);
        assert_eq!(serializer.deserialize_meta_data(&object).unwrap(), meta);
    }
}
