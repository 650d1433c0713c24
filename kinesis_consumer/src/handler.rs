//! Per-record hand-off from a shard consumer to the rest of the agent.

use std::{fmt::Debug, sync::Arc};

use agent_clap_blocks::kinesis::ContentEncoding;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    client::Record,
    decode::decode,
    delivery::{DeliveryCoordinator, DeliveryError, MetricGroup},
    metric::Parser,
    shard::ShardId,
};

#[derive(Debug, Error)]
pub enum RecordHandlerError {
    /// Shutdown was requested while the record was being handled.
    #[error("record handling cancelled")]
    Cancelled,

    #[error("record handler failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Receives every record of a shard, in order, from that shard's consumer.
#[async_trait]
pub trait RecordHandler: Debug + Send + Sync + 'static {
    async fn handle_record(
        &self,
        cancel: &CancellationToken,
        shard_id: &ShardId,
        record: Record,
    ) -> Result<(), RecordHandlerError>;
}

/// Decodes, parses and dispatches each record as one tracked metric group.
///
/// Records that cannot be decoded or parsed are logged and skipped.
#[derive(Debug)]
pub struct MetricRecordHandler {
    parser: Arc<dyn Parser>,
    content_encoding: ContentEncoding,
    coordinator: Arc<DeliveryCoordinator>,
}

impl MetricRecordHandler {
    pub fn new(
        parser: Arc<dyn Parser>,
        content_encoding: ContentEncoding,
        coordinator: Arc<DeliveryCoordinator>,
    ) -> Self {
        Self {
            parser,
            content_encoding,
            coordinator,
        }
    }
}

#[async_trait]
impl RecordHandler for MetricRecordHandler {
    async fn handle_record(
        &self,
        cancel: &CancellationToken,
        shard_id: &ShardId,
        record: Record,
    ) -> Result<(), RecordHandlerError> {
        let payload = match decode(self.content_encoding, &record.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    error = %e,
                    %shard_id,
                    sequence_number = %record.sequence_number,
                    "skipping record that failed to decode"
                );
                return Ok(());
            }
        };
        let metrics = match self.parser.parse(&payload) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(
                    error = %e,
                    %shard_id,
                    sequence_number = %record.sequence_number,
                    "skipping record that failed to parse"
                );
                return Ok(());
            }
        };

        let group = MetricGroup::new(shard_id.clone(), record.sequence_number, metrics);
        match self.coordinator.dispatch(cancel, group).await {
            Ok(_) => Ok(()),
            Err(DeliveryError::Cancelled) => Err(RecordHandlerError::Cancelled),
            Err(e) => Err(RecordHandlerError::Failed(Box::new(e))),
        }
    }
}
