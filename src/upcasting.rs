//! Upcasting: revision bumps applied to serialized payloads at read time.
//!
//! An upcaster rewrites a stored payload into zero or more payloads at the
//! current revision, before deserialization. Fan-in and fan-out are both
//! allowed: a single stored row may become several messages, or disappear
//! entirely. Chains run lazily -- only when a row is actually consumed from
//! a cursor -- and every output inherits the source row's identity fields
//! (event identifier, aggregate identifier, sequence number, timestamp,
//! metadata).

use chrono::{DateTime, Utc};

use crate::types::{MetaData, SerializedObject, SerializedType};

/// Identity fields of the row being upcast, made available to upcasters.
///
/// Outputs of an upcaster share these with the source row; only payload and
/// payload type may diverge.
#[derive(Debug)]
pub struct UpcastingContext<'a> {
    /// Identifier of the source event.
    pub event_identifier: &'a str,
    /// Aggregate the source event belongs to.
    pub aggregate_identifier: &'a str,
    /// Sequence number of the source event.
    pub sequence_number: u64,
    /// Original construction timestamp of the source event.
    pub timestamp: DateTime<Utc>,
    /// Metadata recorded with the source event.
    pub meta_data: &'a MetaData,
}

/// A single upcasting step.
pub trait Upcaster: Send + Sync {
    /// Returns true if this upcaster wants to rewrite payloads of the given
    /// type and revision.
    fn can_upcast(&self, ty: &SerializedType) -> bool;

    /// Rewrites one serialized payload into zero or more serialized
    /// payloads. Returning an empty vec filters the event out.
    fn upcast(
        &self,
        object: SerializedObject,
        context: &UpcastingContext<'_>,
    ) -> Vec<SerializedObject>;
}

/// A pipeline of upcasters applied to each stored payload.
pub trait UpcasterChain: Send + Sync {
    /// Runs the chain on one serialized payload, producing the payloads of
    /// the messages to deliver in their place.
    fn upcast(
        &self,
        object: SerializedObject,
        context: &UpcastingContext<'_>,
    ) -> Vec<SerializedObject>;
}

/// The default chain: every payload passes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityUpcasterChain;

impl UpcasterChain for IdentityUpcasterChain {
    fn upcast(
        &self,
        object: SerializedObject,
        _context: &UpcastingContext<'_>,
    ) -> Vec<SerializedObject> {
        vec![object]
    }
}

/// An ordered chain of upcasters.
///
/// Each payload is threaded through the upcasters in registration order;
/// the fan-out of one step feeds the next, so a later upcaster sees the
/// outputs of an earlier one. Payloads no upcaster accepts pass through
/// unchanged.
#[derive(Default)]
pub struct SimpleUpcasterChain {
    upcasters: Vec<Box<dyn Upcaster>>,
}

impl SimpleUpcasterChain {
    /// Creates an empty chain, equivalent to [`IdentityUpcasterChain`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an upcaster to the end of the chain.
    pub fn push(mut self, upcaster: impl Upcaster + 'static) -> Self {
        self.upcasters.push(Box::new(upcaster));
        self
    }
}

impl UpcasterChain for SimpleUpcasterChain {
    fn upcast(
        &self,
        object: SerializedObject,
        context: &UpcastingContext<'_>,
    ) -> Vec<SerializedObject> {
        let mut current = vec![object];
        for upcaster in &self.upcasters {
            let mut next = Vec::with_capacity(current.len());
            for object in current {
                if upcaster.can_upcast(&object.ty) {
                    next.extend(upcaster.upcast(object, context));
                } else {
                    next.push(object);
                }
            }
            current = next;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SerializedData;

    fn object(name: &str, body: &str) -> SerializedObject {
        SerializedObject::new(
            SerializedType::new(name),
            SerializedData::Text(body.to_string()),
        )
    }

    fn context<'a>(meta: &'a MetaData) -> UpcastingContext<'a> {
        UpcastingContext {
            event_identifier: "event-1",
            aggregate_identifier: "agg-1",
            sequence_number: 3,
            timestamp: crate::clock::now(),
            meta_data: meta,
        }
    }

    /// Duplicates payloads of one type, renaming the second copy.
    struct Doubling {
        accepts: &'static str,
    }

    impl Upcaster for Doubling {
        fn can_upcast(&self, ty: &SerializedType) -> bool {
            ty.name == self.accepts
        }

        fn upcast(
            &self,
            object: SerializedObject,
            _context: &UpcastingContext<'_>,
        ) -> Vec<SerializedObject> {
            let renamed = SerializedObject::new(
                SerializedType::with_revision(format!("{}V2", object.ty.name), "2"),
                object.data.clone(),
            );
            vec![object, renamed]
        }
    }

    /// Filters out payloads of one type.
    struct Dropping {
        drops: &'static str,
    }

    impl Upcaster for Dropping {
        fn can_upcast(&self, ty: &SerializedType) -> bool {
            ty.name == self.drops
        }

        fn upcast(
            &self,
            _object: SerializedObject,
            _context: &UpcastingContext<'_>,
        ) -> Vec<SerializedObject> {
            Vec::new()
        }
    }

    #[test]
    fn identity_chain_passes_through() {
        let meta = MetaData::empty();
        let outputs = IdentityUpcasterChain.upcast(object("Stub", "{}"), &context(&meta));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].ty.name, "Stub");
    }

    #[test]
    fn non_matching_payloads_pass_unchanged() {
        let chain = SimpleUpcasterChain::new().push(Doubling { accepts: "Other" });
        let meta = MetaData::empty();
        let outputs = chain.upcast(object("Stub", "{}"), &context(&meta));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].ty.name, "Stub");
    }

    #[test]
    fn fan_out_feeds_later_upcasters() {
        let chain = SimpleUpcasterChain::new()
            .push(Doubling { accepts: "Stub" })
            .push(Dropping { drops: "StubV2" });
        let meta = MetaData::empty();
        let outputs = chain.upcast(object("Stub", "{}"), &context(&meta));
        // Doubled into [Stub, StubV2], then StubV2 dropped.
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].ty.name, "Stub");
    }

    #[test]
    fn empty_fan_out_filters_the_event() {
        let chain = SimpleUpcasterChain::new().push(Dropping { drops: "Stub" });
        let meta = MetaData::empty();
        let outputs = chain.upcast(object("Stub", "{}"), &context(&meta));
        assert!(outputs.is_empty());
    }
}
