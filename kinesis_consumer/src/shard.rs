//! Shards and their resharding lineage.

use std::{fmt::Display, sync::Arc};

use crate::sequence::SequenceNumber;

/// Identifier of a shard, unique within a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(Arc<str>);

impl ShardId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ShardId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sequence numbers a shard covers; `end` is set once the shard is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceNumberRange {
    pub start: SequenceNumber,
    pub end: Option<SequenceNumber>,
}

/// A shard as reported by `ListShards`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: ShardId,
    /// The shard this one was split from, or the first of two merged shards.
    pub parent: Option<ShardId>,
    /// The second shard of a merge.
    pub adjacent_parent: Option<ShardId>,
    pub sequence_number_range: SequenceNumberRange,
}

impl Shard {
    /// An open shard with no lineage.
    pub fn new(id: impl Into<ShardId>, start: impl Into<SequenceNumber>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            adjacent_parent: None,
            sequence_number_range: SequenceNumberRange {
                start: start.into(),
                end: None,
            },
        }
    }

    pub fn with_parent(mut self, parent: impl Into<ShardId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_adjacent_parent(mut self, parent: impl Into<ShardId>) -> Self {
        self.adjacent_parent = Some(parent.into());
        self
    }

    pub fn with_end(mut self, end: impl Into<SequenceNumber>) -> Self {
        self.sequence_number_range.end = Some(end.into());
        self
    }

    /// Closed shards accept no new records.
    pub fn is_closed(&self) -> bool {
        self.sequence_number_range.end.is_some()
    }

    pub fn end(&self) -> Option<&SequenceNumber> {
        self.sequence_number_range.end.as_ref()
    }

    /// Parent and adjacent parent, whichever are present.
    pub fn parents(&self) -> impl Iterator<Item = &ShardId> {
        self.parent.iter().chain(self.adjacent_parent.iter())
    }
}

/// A child reported by `GetRecords` when its parent closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildShard {
    pub id: ShardId,
    /// Every shard that must be fully consumed before this one may start.
    pub parents: Vec<ShardId>,
}

impl ChildShard {
    pub fn new(id: impl Into<ShardId>, parents: impl IntoIterator<Item = ShardId>) -> Self {
        Self {
            id: id.into(),
            parents: parents.into_iter().collect(),
        }
    }
}

/// Where a shard is in its consumption lifecycle.
///
/// `Discovered -> Active -> FullyConsumed`; a fully consumed shard is never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Discovered,
    Active,
    FullyConsumed,
}
