//! Shard discovery and consumer lifecycle.
//!
//! The [`Orchestrator`] lists the stream's shards, decides which may be consumed, and launches a
//! [`ShardConsumer`] task for each. A shard may start only once every parent (regular and
//! adjacent) is fully consumed. When a consumer reaches the end of its shard, the children it
//! reports are checked and every child whose parents are all done is queued as startable. A
//! single scheduler loop in [`Orchestrator::start`] drains that queue alongside the periodic
//! discovery ticks, so all launches go through one place.

use std::{sync::Arc, time::Duration};

use hashbrown::HashSet;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

use crate::{
    checkpoint::{CheckpointError, CheckpointStore},
    client::{StreamClient, StreamClientError, list_all_shards},
    consumer::{ConsumeOutcome, ConsumerOptions, ShardConsumer, ShardConsumerError},
    handler::RecordHandler,
    registry::{ShardClaim, ShardRegistry},
    sequence::SequenceNumber,
    shard::{ChildShard, ShardId, ShardState},
};

const DEFAULT_STARTABLE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to list shards of stream {stream_name}: {source}")]
    ListShards {
        stream_name: String,
        #[source]
        source: StreamClientError,
    },

    #[error("failed to read checkpoint for shard {shard_id}: {source}")]
    Checkpoint {
        shard_id: ShardId,
        #[source]
        source: CheckpointError,
    },

    #[error(transparent)]
    Launch(#[from] ShardConsumerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub consumer: ConsumerOptions,
    /// Re-list shards this often; `None` lists them once at startup.
    pub shard_update_interval: Option<Duration>,
    /// Capacity of the queue of shards made startable by a parent closing.
    pub startable_queue_capacity: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            consumer: ConsumerOptions::default(),
            shard_update_interval: None,
            startable_queue_capacity: DEFAULT_STARTABLE_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    client: Arc<dyn StreamClient>,
    handler: Arc<dyn RecordHandler>,
    stream_name: Arc<str>,
    registry: Arc<ShardRegistry>,
    checkpoints: Arc<CheckpointStore>,
    options: OrchestratorOptions,
    tasks: TaskTracker,
    startable_tx: mpsc::Sender<ShardId>,
    startable_rx: Mutex<Option<mpsc::Receiver<ShardId>>>,
    /// Shards seen by the most recent listing.
    listed: Mutex<HashSet<ShardId>>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn StreamClient>,
        handler: Arc<dyn RecordHandler>,
        stream_name: impl Into<Arc<str>>,
        registry: Arc<ShardRegistry>,
        checkpoints: Arc<CheckpointStore>,
        options: OrchestratorOptions,
    ) -> Self {
        let (startable_tx, startable_rx) = mpsc::channel(options.startable_queue_capacity.max(1));
        Self {
            client,
            handler,
            stream_name: stream_name.into(),
            registry,
            checkpoints,
            options,
            tasks: TaskTracker::new(),
            startable_tx,
            startable_rx: Mutex::new(Some(startable_rx)),
            listed: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Discover shards and keep launching consumers until `cancel` fires, then wait for every
    /// shard task to finish.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut startable) = self.startable_rx.lock().take() else {
            error!(stream = %self.stream_name, "orchestrator already started");
            return;
        };
        info!(
            stream = %self.stream_name,
            shard_update_interval = ?self.options.shard_update_interval,
            "starting shard orchestrator"
        );

        if let Err(e) = self.refresh(&cancel).await {
            error!(error = %e, "initial shard discovery failed");
        }

        let mut ticker = self.options.shard_update_interval.map(|period| {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(shard_id) = startable.recv() => self.start_child(&cancel, shard_id).await,
                _ = next_tick(&mut ticker) => {
                    if let Err(e) = self.refresh(&cancel).await {
                        error!(error = %e, "shard discovery failed");
                    }
                }
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!(stream = %self.stream_name, "shard orchestrator stopped");
    }

    /// One discovery pass: list every shard and launch consumers for those that are ready.
    ///
    /// Failures for individual shards do not stop the pass; the first one is returned after all
    /// shards have been considered.
    pub async fn refresh(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        let shards = list_all_shards(self.client.as_ref(), &self.stream_name)
            .await
            .map_err(|source| OrchestratorError::ListShards {
                stream_name: self.stream_name.to_string(),
                source,
            })?;
        let listed: HashSet<ShardId> = shards.iter().map(|shard| shard.id.clone()).collect();
        debug!(stream = %self.stream_name, n_shards = shards.len(), "listed shards");
        *self.listed.lock() = listed.clone();

        let mut first_error = None;

        // settle which shards are already done before looking at lineage
        let mut candidates = Vec::new();
        for shard in shards {
            if self.registry.state(&shard.id) != ShardState::Discovered
                || self.registry.is_failed(&shard.id)
            {
                continue;
            }
            let checkpoint = match self.checkpoints.get(&self.stream_name, &shard.id).await {
                Ok(checkpoint) => checkpoint,
                Err(source) => {
                    error!(error = %source, shard_id = %shard.id, "failed to read checkpoint");
                    first_error.get_or_insert(OrchestratorError::Checkpoint {
                        shard_id: shard.id.clone(),
                        source,
                    });
                    continue;
                }
            };
            if let (Some(end), Some(checkpoint)) = (shard.end(), checkpoint.as_ref()) {
                if end == checkpoint {
                    debug!(shard_id = %shard.id, "closed shard already checkpointed to its end");
                    self.registry.mark_consumed(&shard.id);
                    continue;
                }
            }
            candidates.push((shard, checkpoint));
        }

        for (shard, checkpoint) in candidates {
            let waiting = self.waiting_parents(&listed, shard.parents());
            if !waiting.is_empty() {
                debug!(shard_id = %shard.id, ?waiting, "deferring shard until parents are consumed");
                continue;
            }
            if let Err(e) = self.launch(cancel, &shard.id, checkpoint).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Claim `shard_id` and spawn its consumer; `Ok(false)` if someone else holds it.
    async fn launch(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        shard_id: &ShardId,
        starting_sequence_number: Option<SequenceNumber>,
    ) -> Result<bool, OrchestratorError> {
        let Some(claim) = self.registry.try_claim(shard_id) else {
            debug!(%shard_id, "shard already claimed");
            return Ok(false);
        };

        let mut consumer = ShardConsumer::new(
            Arc::clone(&self.client),
            Arc::clone(&self.handler),
            Arc::clone(&self.stream_name),
            shard_id.clone(),
            starting_sequence_number.clone(),
            self.options.consumer,
        );
        if let Err(e) = consumer.acquire_iterator().await {
            error!(error = %e, %shard_id, "failed to get shard iterator");
            return Err(e.into());
        }

        info!(
            %shard_id,
            starting_sequence_number = ?starting_sequence_number.map(|s| s.to_string()),
            "launching shard consumer"
        );
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        self.tasks.spawn(async move {
            this.run_consumer(consumer, claim, cancel).await;
        });
        Ok(true)
    }

    async fn run_consumer(
        &self,
        consumer: ShardConsumer,
        claim: ShardClaim,
        cancel: CancellationToken,
    ) {
        match consumer.consume(&cancel).await {
            Ok(ConsumeOutcome::Closed(children)) => {
                info!(shard_id = %claim.shard_id(), "shard fully consumed");
                claim.complete();
                self.enqueue_startable(&cancel, children).await;
            }
            Ok(ConsumeOutcome::Cancelled) => {
                debug!(shard_id = %claim.shard_id(), "shard consumer cancelled");
            }
            Err(e) => {
                error!(error = %e, shard_id = %claim.shard_id(), "shard consumer failed");
                claim.fail();
            }
        }
    }

    /// Parents of a shard that still have to be consumed.
    ///
    /// A parent missing from `listed` has aged out of the stream and counts as consumed.
    fn waiting_parents<'a>(
        &self,
        listed: &HashSet<ShardId>,
        parents: impl IntoIterator<Item = &'a ShardId>,
    ) -> Vec<&'a ShardId> {
        parents
            .into_iter()
            .filter(|parent| listed.contains(*parent) && !self.registry.is_consumed(parent))
            .collect()
    }

    async fn enqueue_startable(&self, cancel: &CancellationToken, children: Vec<ChildShard>) {
        for child in children {
            let waiting = {
                let listed = self.listed.lock();
                self.waiting_parents(&listed, &child.parents).len()
            };
            if waiting > 0 {
                debug!(
                    shard_id = %child.id,
                    parents = ?child.parents,
                    waiting,
                    "child shard still waiting on a parent"
                );
                continue;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = self.startable_tx.send(child.id) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn start_child(self: &Arc<Self>, cancel: &CancellationToken, shard_id: ShardId) {
        if self.registry.state(&shard_id) != ShardState::Discovered {
            return;
        }
        let checkpoint = match self.checkpoints.get(&self.stream_name, &shard_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(error = %e, %shard_id, "failed to read checkpoint for child shard");
                return;
            }
        };
        if let Err(e) = self.launch(cancel, &shard_id, checkpoint).await {
            error!(error = %e, %shard_id, "failed to launch child shard");
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
