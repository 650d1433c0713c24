//! The poll loop for a single shard.
//!
//! A [`ShardConsumer`] fetches batches from one shard and hands each record to the
//! [`RecordHandler`] strictly in fetch order. Throughput rejections and expired iterators are
//! absorbed here; the loop ends when the shard closes (returning its children), when it is
//! cancelled, or on any other fetch or handler error.

use std::{sync::Arc, time::Duration};

use agent_clap_blocks::kinesis::{KinesisConsumerConfig, ShardIteratorType};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{GetRecordsOutput, IteratorPosition, ShardIterator, StreamClient, StreamClientError},
    handler::{RecordHandler, RecordHandlerError},
    sequence::SequenceNumber,
    shard::{ChildShard, ShardId},
};

#[derive(Debug, Error)]
pub enum ShardConsumerError {
    #[error("failed to get iterator for shard {shard_id}: {source}")]
    GetShardIterator {
        shard_id: ShardId,
        #[source]
        source: StreamClientError,
    },

    #[error("failed to get records from shard {shard_id}: {source}")]
    GetRecords {
        shard_id: ShardId,
        #[source]
        source: StreamClientError,
    },

    #[error("record handler failed for shard {shard_id} at {sequence_number}: {source}")]
    Handler {
        shard_id: ShardId,
        sequence_number: SequenceNumber,
        #[source]
        source: RecordHandlerError,
    },
}

/// Settings shared by every shard consumer of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Start position for shards without a known sequence number.
    pub iterator_type: ShardIteratorType,
    pub poll_interval: Duration,
    pub throughput_retry_delay: Duration,
    pub max_records: Option<u32>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            iterator_type: ShardIteratorType::TrimHorizon,
            poll_interval: Duration::from_millis(250),
            throughput_retry_delay: Duration::from_secs(1),
            max_records: None,
        }
    }
}

impl From<&KinesisConsumerConfig> for ConsumerOptions {
    fn from(config: &KinesisConsumerConfig) -> Self {
        Self {
            iterator_type: config.shard_iterator_type,
            poll_interval: config.poll_interval,
            throughput_retry_delay: config.throughput_retry_delay,
            max_records: Some(config.max_records),
        }
    }
}

/// How a consumer stopped without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The shard has no more records; these children may now be startable.
    Closed(Vec<ChildShard>),
    Cancelled,
}

#[derive(Debug)]
pub struct ShardConsumer {
    client: Arc<dyn StreamClient>,
    handler: Arc<dyn RecordHandler>,
    stream_name: Arc<str>,
    shard_id: ShardId,
    options: ConsumerOptions,
    starting_sequence_number: Option<SequenceNumber>,
    last_sequence_number: Option<SequenceNumber>,
    iterator: Option<ShardIterator>,
}

impl ShardConsumer {
    /// Consumer for `shard_id` that resumes after `starting_sequence_number`, or at
    /// `options.iterator_type` when it is `None`.
    pub fn new(
        client: Arc<dyn StreamClient>,
        handler: Arc<dyn RecordHandler>,
        stream_name: impl Into<Arc<str>>,
        shard_id: ShardId,
        starting_sequence_number: Option<SequenceNumber>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            client,
            handler,
            stream_name: stream_name.into(),
            shard_id,
            options,
            starting_sequence_number,
            last_sequence_number: None,
            iterator: None,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Sequence number of the last record handed to the handler.
    pub fn last_sequence_number(&self) -> Option<&SequenceNumber> {
        self.last_sequence_number.as_ref()
    }

    fn resume_position(&self) -> IteratorPosition {
        match self
            .last_sequence_number
            .as_ref()
            .or(self.starting_sequence_number.as_ref())
        {
            Some(sequence_number) => IteratorPosition::AfterSequenceNumber(sequence_number.clone()),
            None => self.options.iterator_type.into(),
        }
    }

    async fn get_iterator(&self) -> Result<ShardIterator, ShardConsumerError> {
        let position = self.resume_position();
        debug!(shard_id = %self.shard_id, ?position, "acquiring shard iterator");
        self.client
            .get_shard_iterator(&self.stream_name, &self.shard_id, &position)
            .await
            .map_err(|source| ShardConsumerError::GetShardIterator {
                shard_id: self.shard_id.clone(),
                source,
            })
    }

    /// Acquire the starting iterator ahead of [`consume`](ShardConsumer::consume).
    ///
    /// Lets the caller see iterator failures before handing the consumer to a task.
    pub async fn acquire_iterator(&mut self) -> Result<(), ShardConsumerError> {
        self.iterator = Some(self.get_iterator().await?);
        Ok(())
    }

    /// Run the poll loop until the shard closes, `cancel` fires, or an error occurs.
    pub async fn consume(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<ConsumeOutcome, ShardConsumerError> {
        let mut iterator = match self.iterator.take() {
            Some(iterator) => iterator,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ConsumeOutcome::Cancelled),
                iterator = self.get_iterator() => iterator?,
            },
        };

        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ConsumeOutcome::Cancelled),
                res = self.client.get_records(&iterator, self.options.max_records) => res,
            };

            match res {
                Ok(GetRecordsOutput {
                    records,
                    next_iterator,
                    child_shards,
                    millis_behind_latest,
                }) => {
                    debug!(
                        shard_id = %self.shard_id,
                        n_records = records.len(),
                        ?millis_behind_latest,
                        "fetched records"
                    );
                    for record in records {
                        if cancel.is_cancelled() {
                            return Ok(ConsumeOutcome::Cancelled);
                        }
                        let sequence_number = record.sequence_number.clone();
                        match self
                            .handler
                            .handle_record(cancel, &self.shard_id, record)
                            .await
                        {
                            Ok(()) => {}
                            Err(RecordHandlerError::Cancelled) => {
                                return Ok(ConsumeOutcome::Cancelled);
                            }
                            Err(source) => {
                                return Err(ShardConsumerError::Handler {
                                    shard_id: self.shard_id.clone(),
                                    sequence_number,
                                    source,
                                });
                            }
                        }
                        self.last_sequence_number = Some(sequence_number);
                    }

                    match next_iterator {
                        Some(next) => iterator = next,
                        None => {
                            info!(
                                shard_id = %self.shard_id,
                                n_children = child_shards.len(),
                                "shard closed"
                            );
                            return Ok(ConsumeOutcome::Closed(child_shards));
                        }
                    }
                }
                Err(StreamClientError::ProvisionedThroughputExceeded(message)) => {
                    warn!(
                        shard_id = %self.shard_id,
                        %message,
                        retry_in = ?self.options.throughput_retry_delay,
                        "throughput exceeded"
                    );
                    if sleep_or_cancel(cancel, self.options.throughput_retry_delay).await {
                        return Ok(ConsumeOutcome::Cancelled);
                    }
                    continue;
                }
                Err(StreamClientError::ExpiredIterator(message)) => {
                    info!(shard_id = %self.shard_id, %message, "iterator expired, reacquiring");
                    iterator = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(ConsumeOutcome::Cancelled),
                        iterator = self.get_iterator() => iterator?,
                    };
                    continue;
                }
                Err(source) => {
                    return Err(ShardConsumerError::GetRecords {
                        shard_id: self.shard_id.clone(),
                        source,
                    });
                }
            }

            if sleep_or_cancel(cancel, self.options.poll_interval).await {
                return Ok(ConsumeOutcome::Cancelled);
            }
        }
    }
}

/// Sleep for `duration`; `true` if `cancel` fired first.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
