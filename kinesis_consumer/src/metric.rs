//! The agent's metric model and the parser contract that produces it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
    String(String),
    Boolean(bool),
}

/// A single measurement: name, tag set, field set and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Error)]
#[error("failed to parse record payload: {0}")]
pub struct ParseError(pub String);

/// Turns a decoded record payload into metrics.
///
/// Concrete data formats live outside this crate; the consumer only needs the contract.
pub trait Parser: std::fmt::Debug + Send + Sync + 'static {
    fn parse(&self, payload: &[u8]) -> Result<Vec<Metric>, ParseError>;
}
