//! Per-shard progress, cached in memory and written to a backing table in the background.
//!
//! [`CheckpointStore::set`] only touches the cache and marks the entry dirty. A background loop
//! started with [`CheckpointStore::run`] writes dirty entries every flush interval, and
//! [`CheckpointStore::stop`] performs one last bounded flush on the way out. Entries are written
//! independently: a failed write leaves that entry dirty for the next tick without holding back
//! any other shard.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{sequence::SequenceNumber, shard::ShardId};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("final checkpoint flush did not finish within {0:?}")]
    FlushTimeout(Duration),

    #[error("checkpoint flush loop is already running")]
    AlreadyRunning,
}

impl CheckpointError {
    pub fn backend(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(e.into())
    }
}

pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

/// Durable table of checkpoints, keyed by namespace and shard id.
///
/// Reads must be strongly consistent: a value written by a previous run has to be visible to
/// the next one.
#[async_trait]
pub trait CheckpointBackend: Debug + Send + Sync + 'static {
    /// `Ok(None)` when nothing has been stored for the shard.
    async fn get_item(&self, namespace: &str, shard_id: &ShardId)
    -> Result<Option<SequenceNumber>>;

    async fn put_item(
        &self,
        namespace: &str,
        shard_id: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> Result<()>;
}

/// Backend used when checkpointing is not configured: nothing is stored, nothing is found.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCheckpointBackend;

#[async_trait]
impl CheckpointBackend for NoopCheckpointBackend {
    async fn get_item(
        &self,
        _namespace: &str,
        _shard_id: &ShardId,
    ) -> Result<Option<SequenceNumber>> {
        Ok(None)
    }

    async fn put_item(
        &self,
        _namespace: &str,
        _shard_id: &ShardId,
        _sequence_number: &SequenceNumber,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CheckpointKey {
    stream_name: Arc<str>,
    shard_id: ShardId,
}

/// Cached progress for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub sequence_number: SequenceNumber,
    /// Set while the cached value has not been written to the backend.
    pub dirty: bool,
    pub last_write: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    app_name: Arc<str>,
    flush_interval: Duration,
    cache: Mutex<HashMap<CheckpointKey, Checkpoint>>,
    /// Serializes background and final flushes.
    flush_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
    halt: CancellationToken,
}

impl CheckpointStore {
    pub fn new(
        backend: Arc<dyn CheckpointBackend>,
        app_name: impl Into<Arc<str>>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            backend,
            app_name: app_name.into(),
            flush_interval,
            cache: Default::default(),
            flush_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            halt: CancellationToken::new(),
        }
    }

    /// Table namespace for a stream: `{app_name}-{stream_name}`.
    pub fn namespace(&self, stream_name: &str) -> String {
        format!("{}-{}", self.app_name, stream_name)
    }

    /// Record `sequence_number` as the shard's progress without waiting for the backend.
    ///
    /// A value lower than the one already cached is ignored.
    pub fn set(&self, stream_name: &str, shard_id: &ShardId, sequence_number: SequenceNumber) {
        let key = CheckpointKey {
            stream_name: Arc::from(stream_name),
            shard_id: shard_id.clone(),
        };
        let mut cache = self.cache.lock();
        match cache.get_mut(&key) {
            Some(entry) if entry.sequence_number > sequence_number => {
                debug!(
                    %shard_id,
                    current = %entry.sequence_number,
                    ignored = %sequence_number,
                    "ignoring checkpoint lower than the cached one"
                );
            }
            Some(entry) => {
                if entry.sequence_number != sequence_number {
                    entry.sequence_number = sequence_number;
                    entry.dirty = true;
                }
            }
            None => {
                cache.insert(
                    key,
                    Checkpoint {
                        sequence_number,
                        dirty: true,
                        last_write: None,
                    },
                );
            }
        }
    }

    /// Last known progress for the shard.
    ///
    /// Served from the cache when possible, otherwise read from the backend and cached.
    /// `Ok(None)` means the shard has never been checkpointed.
    pub async fn get(
        &self,
        stream_name: &str,
        shard_id: &ShardId,
    ) -> Result<Option<SequenceNumber>> {
        let key = CheckpointKey {
            stream_name: Arc::from(stream_name),
            shard_id: shard_id.clone(),
        };
        if let Some(entry) = self.cache.lock().get(&key) {
            return Ok(Some(entry.sequence_number.clone()));
        }

        let namespace = self.namespace(stream_name);
        let Some(stored) = self.backend.get_item(&namespace, shard_id).await? else {
            return Ok(None);
        };

        // a concurrent `set` may have cached a newer value while the read was in flight
        let mut cache = self.cache.lock();
        let entry = cache.entry(key).or_insert(Checkpoint {
            sequence_number: stored,
            dirty: false,
            last_write: None,
        });
        Ok(Some(entry.sequence_number.clone()))
    }

    /// Snapshot of the cached entry for a shard.
    pub fn checkpoint(&self, stream_name: &str, shard_id: &ShardId) -> Option<Checkpoint> {
        let key = CheckpointKey {
            stream_name: Arc::from(stream_name),
            shard_id: shard_id.clone(),
        };
        self.cache.lock().get(&key).cloned()
    }

    pub fn dirty_count(&self) -> usize {
        self.cache.lock().values().filter(|c| c.dirty).count()
    }

    /// Write every dirty entry to the backend, returning how many writes succeeded.
    pub async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;

        let dirty: Vec<(CheckpointKey, SequenceNumber)> = self
            .cache
            .lock()
            .iter()
            .filter(|(_, checkpoint)| checkpoint.dirty)
            .map(|(key, checkpoint)| (key.clone(), checkpoint.sequence_number.clone()))
            .collect();
        if dirty.is_empty() {
            return 0;
        }

        let writes = dirty.into_iter().map(|(key, sequence_number)| async move {
            let namespace = self.namespace(&key.stream_name);
            let res = self
                .backend
                .put_item(&namespace, &key.shard_id, &sequence_number)
                .await;
            (key, sequence_number, res)
        });

        let mut written = 0;
        for (key, sequence_number, res) in futures::future::join_all(writes).await {
            match res {
                Ok(()) => {
                    written += 1;
                    let mut cache = self.cache.lock();
                    if let Some(entry) = cache.get_mut(&key) {
                        // stays dirty if it advanced while the write was in flight
                        if entry.sequence_number == sequence_number {
                            entry.dirty = false;
                        }
                        entry.last_write = Some(Utc::now());
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        stream = %key.stream_name,
                        shard_id = %key.shard_id,
                        %sequence_number,
                        "failed to write checkpoint, will retry on next flush"
                    );
                }
            }
        }
        written
    }

    /// Flush dirty entries every flush interval until `cancel` fires or [`stop`] is called.
    ///
    /// [`stop`]: CheckpointStore::stop
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CheckpointError::AlreadyRunning);
        }
        info!(
            app_name = %self.app_name,
            flush_interval = ?self.flush_interval,
            "starting checkpoint flush loop"
        );

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.halt.cancelled() => break,
                _ = ticker.tick() => {
                    let written = self.flush().await;
                    if written > 0 {
                        debug!(written, "flushed checkpoints");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("checkpoint flush loop stopped");
        Ok(())
    }

    /// Final flush, bounded by the flush interval, then halt the background loop.
    pub async fn stop(&self) -> Result<()> {
        let res = tokio::time::timeout(self.flush_interval, self.flush()).await;
        self.halt.cancel();
        match res {
            Ok(written) => {
                info!(
                    written,
                    remaining_dirty = self.dirty_count(),
                    "final checkpoint flush done"
                );
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout = ?self.flush_interval,
                    "final checkpoint flush timed out"
                );
                Err(CheckpointError::FlushTimeout(self.flush_interval))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCheckpointBackend;

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::from(n)
    }

    fn store(backend: &Arc<MemoryCheckpointBackend>) -> CheckpointStore {
        CheckpointStore::new(
            Arc::clone(backend) as _,
            "agent",
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn set_is_cached_until_flush() {
        let backend = Arc::new(MemoryCheckpointBackend::default());
        let store = store(&backend);
        let shard = ShardId::from("shard-0");

        store.set("metrics", &shard, seq(5));
        assert_eq!(store.get("metrics", &shard).await.unwrap(), Some(seq(5)));
        assert_eq!(backend.get("agent-metrics", &shard), None);
        assert_eq!(store.dirty_count(), 1);

        assert_eq!(store.flush().await, 1);
        assert_eq!(backend.get("agent-metrics", &shard), Some(seq(5)));
        let checkpoint = store.checkpoint("metrics", &shard).unwrap();
        assert!(!checkpoint.dirty);
        assert!(checkpoint.last_write.is_some());

        // nothing dirty, nothing written
        assert_eq!(store.flush().await, 0);
        assert_eq!(backend.put_count(), 1);
    }

    #[tokio::test]
    async fn get_miss_reads_backend_once() {
        let backend = Arc::new(MemoryCheckpointBackend::default());
        let shard = ShardId::from("shard-0");
        backend.insert("agent-metrics", &shard, seq(42));
        let store = store(&backend);

        assert_eq!(store.get("metrics", &shard).await.unwrap(), Some(seq(42)));
        assert_eq!(store.get("metrics", &shard).await.unwrap(), Some(seq(42)));
        assert_eq!(backend.get_count(), 1);
        // loaded values are clean
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test]
    async fn get_not_found_is_not_an_error() {
        let backend = Arc::new(MemoryCheckpointBackend::default());
        let store = store(&backend);
        assert_eq!(
            store.get("metrics", &ShardId::from("nope")).await.unwrap(),
            None
        );
        assert!(store.checkpoint("metrics", &ShardId::from("nope")).is_none());
    }

    #[tokio::test]
    async fn never_moves_backwards() {
        let backend = Arc::new(MemoryCheckpointBackend::default());
        let store = store(&backend);
        let shard = ShardId::from("shard-0");

        store.set("metrics", &shard, seq(100));
        store.set("metrics", &shard, seq(99));
        assert_eq!(store.get("metrics", &shard).await.unwrap(), Some(seq(100)));
    }

    #[tokio::test]
    async fn failed_write_stays_dirty_without_blocking_others() {
        let backend = Arc::new(MemoryCheckpointBackend::default());
        let store = store(&backend);
        let good = ShardId::from("shard-good");
        let bad = ShardId::from("shard-bad");
        backend.fail_puts_for(&bad, 1);

        store.set("metrics", &good, seq(1));
        store.set("metrics", &bad, seq(2));

        assert_eq!(store.flush().await, 1);
        assert_eq!(backend.get("agent-metrics", &good), Some(seq(1)));
        assert_eq!(backend.get("agent-metrics", &bad), None);
        assert!(store.checkpoint("metrics", &bad).unwrap().dirty);

        // retried on the next flush
        assert_eq!(store.flush().await, 1);
        assert_eq!(backend.get("agent-metrics", &bad), Some(seq(2)));
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_flushes_and_stop_flushes_rest() {
        let backend = Arc::new(MemoryCheckpointBackend::default());
        let store = Arc::new(store(&backend));
        let shard = ShardId::from("shard-0");
        let cancel = CancellationToken::new();

        let loop_store = Arc::clone(&store);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { loop_store.run(loop_cancel).await });

        store.set("metrics", &shard, seq(1));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(backend.get("agent-metrics", &shard), Some(seq(1)));

        // a second loop is refused while the first is running
        assert!(matches!(
            store.run(cancel.clone()).await,
            Err(CheckpointError::AlreadyRunning)
        ));

        store.set("metrics", &shard, seq(2));
        store.stop().await.unwrap();
        assert_eq!(backend.get("agent-metrics", &shard), Some(seq(2)));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_reports_timeout() {
        let backend = Arc::new(MemoryCheckpointBackend::default());
        backend.set_put_delay(Duration::from_secs(60));
        let store = store(&backend);
        store.set("metrics", &ShardId::from("shard-0"), seq(1));

        assert!(matches!(
            store.stop().await,
            Err(CheckpointError::FlushTimeout(_))
        ));
    }

    #[tokio::test]
    async fn noop_backend_stores_nothing() {
        let store = CheckpointStore::new(
            Arc::new(NoopCheckpointBackend),
            "agent",
            Duration::from_secs(1),
        );
        let shard = ShardId::from("shard-0");
        store.set("metrics", &shard, seq(3));
        assert_eq!(store.flush().await, 1);

        let fresh = CheckpointStore::new(
            Arc::new(NoopCheckpointBackend),
            "agent",
            Duration::from_secs(1),
        );
        assert_eq!(fresh.get("metrics", &shard).await.unwrap(), None);
    }
}
