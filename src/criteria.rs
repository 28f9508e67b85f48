//! Criteria: composable predicates over event-row columns.
//!
//! A [`Criteria`] tree is built through [`CriteriaBuilder`] from property
//! leaves and `and`/`or` combinators, then handed to
//! [`EventStore::visit_events_matching`](crate::store::EventStore). Building
//! is side-effect-free; nothing touches the database until the entry store
//! emits the tree as a parameterised WHERE fragment.
//!
//! Property names are resolved against the entry store's
//! [`ColumnVocabulary`] at emission time; the standard vocabulary covers
//! `"timeStamp"`, `"type"` and `"aggregateIdentifier"`. Instant values are
//! converted to the rows' epoch-millisecond representation during emission.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use crate::error::{Error, Result};

// =============================================================================
// Vocabulary
// =============================================================================

/// Maps criteria property names to the columns an entry store executes
/// them against.
#[derive(Debug, Clone)]
pub struct ColumnVocabulary {
    columns: HashMap<String, String>,
}

impl ColumnVocabulary {
    /// The standard vocabulary: `timeStamp`, `type`, `aggregateIdentifier`.
    pub fn standard() -> Self {
        let mut columns = HashMap::new();
        columns.insert("timeStamp".to_string(), "time_stamp".to_string());
        columns.insert("type".to_string(), "payload_type".to_string());
        columns.insert(
            "aggregateIdentifier".to_string(),
            "aggregate_identifier".to_string(),
        );
        Self { columns }
    }

    /// Adds a property mapping; entry stores with extra columns extend the
    /// vocabulary this way.
    pub fn with_property(
        mut self,
        property: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.columns.insert(property.into(), column.into());
        self
    }

    fn column(&self, property: &str) -> Result<&str> {
        self.columns
            .get(property)
            .map(String::as_str)
            .ok_or_else(|| Error::Criteria(format!("unknown property '{property}'")))
    }
}

impl Default for ColumnVocabulary {
    fn default() -> Self {
        Self::standard()
    }
}

// =============================================================================
// Values and comparisons
// =============================================================================

/// A value a property is compared against.
#[derive(Debug, Clone, PartialEq)]
pub enum CriterionValue {
    /// A text value.
    Text(String),
    /// An integer value.
    Integer(i64),
    /// An instant; converted to epoch milliseconds at emission.
    Instant(DateTime<Utc>),
}

impl From<&str> for CriterionValue {
    fn from(s: &str) -> Self {
        CriterionValue::Text(s.to_string())
    }
}

impl From<String> for CriterionValue {
    fn from(s: String) -> Self {
        CriterionValue::Text(s)
    }
}

impl From<i64> for CriterionValue {
    fn from(v: i64) -> Self {
        CriterionValue::Integer(v)
    }
}

impl From<u64> for CriterionValue {
    fn from(v: u64) -> Self {
        CriterionValue::Integer(v as i64)
    }
}

impl From<DateTime<Utc>> for CriterionValue {
    fn from(t: DateTime<Utc>) -> Self {
        CriterionValue::Instant(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equals,
    NotEquals,
    LessThan,
    LessThanEquals,
    GreaterThan,
    GreaterThanEquals,
}

impl Comparison {
    fn operator(self) -> &'static str {
        match self {
            Comparison::Equals => "=",
            Comparison::NotEquals => "<>",
            Comparison::LessThan => "<",
            Comparison::LessThanEquals => "<=",
            Comparison::GreaterThan => ">",
            Comparison::GreaterThanEquals => ">=",
        }
    }
}

// =============================================================================
// Criteria tree
// =============================================================================

/// A composable predicate over event-row columns.
///
/// Opaque: build through [`CriteriaBuilder`], combine with
/// [`Criteria::and`] and [`Criteria::or`].
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria(Node);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Compare {
        property: String,
        comparison: Comparison,
        value: CriterionValue,
    },
    In {
        property: String,
        values: Vec<CriterionValue>,
    },
    IsNull {
        property: String,
    },
    IsNotNull {
        property: String,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Criteria {
    /// Both criteria must match.
    pub fn and(self, other: Criteria) -> Criteria {
        Criteria(Node::And(Box::new(self.0), Box::new(other.0)))
    }

    /// Either criterion must match.
    pub fn or(self, other: Criteria) -> Criteria {
        Criteria(Node::Or(Box::new(self.0), Box::new(other.0)))
    }

    /// Emits this tree as a parameterised SQL fragment, appending bind
    /// values to `params`. Instants are resolved to the representation the
    /// rows use via `resolve_instant`.
    pub(crate) fn to_sql(
        &self,
        vocabulary: &ColumnVocabulary,
        resolve_instant: &dyn Fn(&DateTime<Utc>) -> i64,
        params: &mut Vec<Value>,
    ) -> Result<String> {
        self.0.to_sql(vocabulary, resolve_instant, params)
    }
}

impl Node {
    fn to_sql(
        &self,
        vocabulary: &ColumnVocabulary,
        resolve_instant: &dyn Fn(&DateTime<Utc>) -> i64,
        params: &mut Vec<Value>,
    ) -> Result<String> {
        match self {
            Node::Compare {
                property,
                comparison,
                value,
            } => {
                let column = vocabulary.column(property)?;
                params.push(bind(value, resolve_instant));
                Ok(format!("{column} {} ?", comparison.operator()))
            }
            Node::In { property, values } => {
                let column = vocabulary.column(property)?;
                if values.is_empty() {
                    // IN over the empty collection matches nothing.
                    return Ok("1 = 0".to_string());
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                for value in values {
                    params.push(bind(value, resolve_instant));
                }
                Ok(format!("{column} IN ({placeholders})"))
            }
            Node::IsNull { property } => {
                let column = vocabulary.column(property)?;
                Ok(format!("{column} IS NULL"))
            }
            Node::IsNotNull { property } => {
                let column = vocabulary.column(property)?;
                Ok(format!("{column} IS NOT NULL"))
            }
            Node::And(left, right) => {
                let l = left.to_sql(vocabulary, resolve_instant, params)?;
                let r = right.to_sql(vocabulary, resolve_instant, params)?;
                Ok(format!("({l}) AND ({r})"))
            }
            Node::Or(left, right) => {
                let l = left.to_sql(vocabulary, resolve_instant, params)?;
                let r = right.to_sql(vocabulary, resolve_instant, params)?;
                Ok(format!("({l}) OR ({r})"))
            }
        }
    }
}

fn bind(value: &CriterionValue, resolve_instant: &dyn Fn(&DateTime<Utc>) -> i64) -> Value {
    match value {
        CriterionValue::Text(s) => Value::Text(s.clone()),
        CriterionValue::Integer(v) => Value::Integer(*v),
        CriterionValue::Instant(t) => Value::Integer(resolve_instant(t)),
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Entry point for building [`Criteria`], obtained from
/// [`EventStore::new_criteria_builder`](crate::store::EventStore::new_criteria_builder).
#[derive(Debug, Clone, Copy, Default)]
pub struct CriteriaBuilder;

impl CriteriaBuilder {
    /// Starts a criterion on the named property.
    pub fn property(&self, name: impl Into<String>) -> Property {
        Property { name: name.into() }
    }
}

/// A property leaf awaiting a comparator.
#[derive(Debug, Clone)]
pub struct Property {
    name: String,
}

impl Property {
    fn compare(self, comparison: Comparison, value: impl Into<CriterionValue>) -> Criteria {
        Criteria(Node::Compare {
            property: self.name,
            comparison,
            value: value.into(),
        })
    }

    /// The property equals the value.
    pub fn equals(self, value: impl Into<CriterionValue>) -> Criteria {
        self.compare(Comparison::Equals, value)
    }

    /// The property does not equal the value.
    pub fn not_equals(self, value: impl Into<CriterionValue>) -> Criteria {
        self.compare(Comparison::NotEquals, value)
    }

    /// The property is strictly less than the value.
    pub fn less_than(self, value: impl Into<CriterionValue>) -> Criteria {
        self.compare(Comparison::LessThan, value)
    }

    /// The property is less than or equal to the value.
    pub fn less_than_equals(self, value: impl Into<CriterionValue>) -> Criteria {
        self.compare(Comparison::LessThanEquals, value)
    }

    /// The property is strictly greater than the value.
    pub fn greater_than(self, value: impl Into<CriterionValue>) -> Criteria {
        self.compare(Comparison::GreaterThan, value)
    }

    /// The property is greater than or equal to the value.
    pub fn greater_than_equals(self, value: impl Into<CriterionValue>) -> Criteria {
        self.compare(Comparison::GreaterThanEquals, value)
    }

    /// The property is one of the given values.
    pub fn is_in<V, I>(self, values: I) -> Criteria
    where
        V: Into<CriterionValue>,
        I: IntoIterator<Item = V>,
    {
        Criteria(Node::In {
            property: self.name,
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    /// The property is NULL.
    pub fn is_null(self) -> Criteria {
        Criteria(Node::IsNull {
            property: self.name,
        })
    }

    /// The property is not NULL.
    pub fn is_not_null(self) -> Criteria {
        Criteria(Node::IsNotNull {
            property: self.name,
        })
    }
}
