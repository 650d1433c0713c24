//! The Kinesis consumer as an agent service input.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use agent_clap_blocks::kinesis::KinesisConsumerConfig;
use agent_shutdown::ShutdownManager;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    accumulator::Accumulator,
    checkpoint::{CheckpointBackend, CheckpointError, CheckpointStore, NoopCheckpointBackend},
    client::StreamClient,
    consumer::ConsumerOptions,
    delivery::DeliveryCoordinator,
    handler::MetricRecordHandler,
    input::ServiceInput,
    metric::Parser,
    orchestrator::{Orchestrator, OrchestratorOptions},
    registry::ShardRegistry,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("stream name must not be empty")]
    EmptyStreamName,

    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,

    #[error("max records per fetch must be at least one")]
    InvalidMaxRecords,

    #[error("a parser is required to turn records into metrics")]
    MissingParser,

    #[error("checkpoint app name and table name must be set together")]
    IncompleteCheckpointConfig,

    #[error("checkpointing is configured but no checkpoint backend was provided")]
    MissingCheckpointBackend,

    #[error("the input has already been started")]
    AlreadyStarted,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Consumes every shard of one stream and feeds the parsed metrics to the agent.
///
/// All work happens in background tasks spawned by [`start`](ServiceInput::start); shard
/// progress is checkpointed once the agent confirms delivery.
#[derive(Debug)]
pub struct KinesisConsumer {
    config: KinesisConsumerConfig,
    client: Arc<dyn StreamClient>,
    parser: Arc<dyn Parser>,
    checkpoints: Arc<CheckpointStore>,
    registry: Arc<ShardRegistry>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl KinesisConsumer {
    /// Validate `config` and assemble the input; nothing runs until it is started.
    ///
    /// `checkpoint_backend` is required when both checkpoint table settings are present and
    /// ignored otherwise.
    pub fn new(
        config: KinesisConsumerConfig,
        client: Arc<dyn StreamClient>,
        checkpoint_backend: Option<Arc<dyn CheckpointBackend>>,
        parser: Option<Arc<dyn Parser>>,
    ) -> Result<Self, Error> {
        if config.stream_name.is_empty() {
            return Err(Error::EmptyStreamName);
        }
        if config.poll_interval.is_zero() {
            return Err(Error::InvalidPollInterval);
        }
        if config.max_records == 0 {
            return Err(Error::InvalidMaxRecords);
        }
        let parser = parser.ok_or(Error::MissingParser)?;

        let (app_name, backend): (String, Arc<dyn CheckpointBackend>) = match (
            config.checkpoint_app_name.as_ref(),
            config.checkpoint_table_name.as_ref(),
        ) {
            (Some(app_name), Some(table_name)) => {
                let backend = checkpoint_backend.ok_or(Error::MissingCheckpointBackend)?;
                debug!(%app_name, %table_name, "checkpointing enabled");
                (app_name.clone(), backend)
            }
            (None, None) => {
                debug!("checkpointing disabled");
                (String::new(), Arc::new(NoopCheckpointBackend))
            }
            _ => return Err(Error::IncompleteCheckpointConfig),
        };
        let checkpoints = Arc::new(CheckpointStore::new(
            backend,
            app_name,
            config.checkpoint_flush_interval,
        ));

        Ok(Self {
            config,
            client,
            parser,
            checkpoints,
            registry: Arc::new(ShardRegistry::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &KinesisConsumerConfig {
        &self.config
    }

    /// Which shards are active, consumed or failed.
    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Stop the input, flushing its checkpoints, when `manager` shuts the agent down.
    pub fn stop_on_shutdown(self: &Arc<Self>, manager: &ShutdownManager) {
        let this = Arc::clone(self);
        manager.on_shutdown(
            format!("kinesis_consumer:{}", self.config.stream_name),
            move || async move { this.stop().await },
        );
    }

    fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            consumer: ConsumerOptions::from(&self.config),
            shard_update_interval: self.config.shard_update_interval,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ServiceInput for KinesisConsumer {
    type Error = Error;

    async fn start(&self, accumulator: Arc<dyn Accumulator>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let stream_name: Arc<str> = Arc::from(self.config.stream_name.as_str());
        let max_undelivered = self.config.effective_max_undelivered_messages();
        info!(
            stream = %stream_name,
            max_undelivered,
            content_encoding = ?self.config.content_encoding,
            "starting kinesis consumer"
        );

        let coordinator = Arc::new(DeliveryCoordinator::new(
            Arc::clone(&stream_name),
            accumulator.with_tracking(max_undelivered),
            Arc::clone(&self.checkpoints),
            max_undelivered,
        ));
        let handler = Arc::new(MetricRecordHandler::new(
            Arc::clone(&self.parser),
            self.config.content_encoding,
            Arc::clone(&coordinator),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&self.client),
            handler,
            Arc::clone(&stream_name),
            Arc::clone(&self.registry),
            Arc::clone(&self.checkpoints),
            self.orchestrator_options(),
        ));

        self.tasks.spawn(orchestrator.start(self.cancel.clone()));

        let checkpoints = Arc::clone(&self.checkpoints);
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            if let Err(e) = checkpoints.run(cancel).await {
                error!(error = %e, "checkpoint flush loop failed");
            }
        });

        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            if let Err(e) = coordinator.drain(cancel).await {
                error!(error = %e, "delivery drain failed");
            }
        });

        Ok(())
    }

    async fn gather(&self, _accumulator: &dyn Accumulator) -> Result<(), Error> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        if !self.started.load(Ordering::SeqCst) {
            debug!("kinesis consumer was never started");
            return Ok(());
        }
        info!(stream = %self.config.stream_name, "stopping kinesis consumer");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        if let Err(e) = self.checkpoints.stop().await {
            warn!(
                error = %e,
                remaining_dirty = self.checkpoints.dirty_count(),
                "checkpoints not fully persisted"
            );
            return Err(e.into());
        }
        info!(stream = %self.config.stream_name, "kinesis consumer stopped");
        Ok(())
    }
}
