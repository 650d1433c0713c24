//! The stream service as seen by the consumer.
//!
//! Implementations wrap a concrete SDK; the consumer only relies on the three calls below and
//! on the error classification in [`StreamClientError`].

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    sequence::SequenceNumber,
    shard::{ChildShard, Shard, ShardId},
};

#[derive(Debug, Error)]
pub enum StreamClientError {
    /// The shard's read throughput is exhausted; the same call may be retried later.
    #[error("provisioned throughput exceeded: {0}")]
    ProvisionedThroughputExceeded(String),

    /// The iterator is older than the service allows; a new one must be acquired.
    #[error("shard iterator expired: {0}")]
    ExpiredIterator(String),

    #[error("stream client error: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StreamClientError {
    pub fn other(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(e.into())
    }
}

pub type Result<T, E = StreamClientError> = std::result::Result<T, E>;

/// Where a new iterator points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    TrimHorizon,
    Latest,
    AfterSequenceNumber(SequenceNumber),
}

impl From<agent_clap_blocks::kinesis::ShardIteratorType> for IteratorPosition {
    fn from(value: agent_clap_blocks::kinesis::ShardIteratorType) -> Self {
        use agent_clap_blocks::kinesis::ShardIteratorType;
        match value {
            ShardIteratorType::TrimHorizon => Self::TrimHorizon,
            ShardIteratorType::Latest => Self::Latest,
        }
    }
}

/// Opaque, time-limited cursor into a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIterator(String);

impl ShardIterator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ShardIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub data: Bytes,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(sequence_number: SequenceNumber, data: impl Into<Bytes>) -> Self {
        Self {
            sequence_number,
            partition_key: String::new(),
            data: data.into(),
            approximate_arrival: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListShardsOutput {
    pub shards: Vec<Shard>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetRecordsOutput {
    pub records: Vec<Record>,
    /// `None` once the shard is closed and every record has been returned.
    pub next_iterator: Option<ShardIterator>,
    /// Populated when the shard has closed.
    pub child_shards: Vec<ChildShard>,
    pub millis_behind_latest: Option<i64>,
}

#[async_trait]
pub trait StreamClient: Debug + Send + Sync + 'static {
    /// One page of the stream's shards; pass the previous page's token to continue.
    async fn list_shards(
        &self,
        stream_name: &str,
        next_token: Option<&str>,
    ) -> Result<ListShardsOutput>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ShardIterator>;

    async fn get_records(
        &self,
        iterator: &ShardIterator,
        limit: Option<u32>,
    ) -> Result<GetRecordsOutput>;
}

/// Every shard of the stream, following pagination to the end.
pub async fn list_all_shards(client: &dyn StreamClient, stream_name: &str) -> Result<Vec<Shard>> {
    let mut shards = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let page = client
            .list_shards(stream_name, next_token.as_deref())
            .await?;
        shards.extend(page.shards);
        match page.next_token {
            Some(token) => next_token = Some(token),
            None => return Ok(shards),
        }
    }
}
