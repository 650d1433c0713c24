//! Bounds in-flight metric groups and turns delivery confirmations into checkpoints.
//!
//! Every dispatched group takes one slot of a gate whose capacity is the configured maximum of
//! undelivered messages. The slot is returned when the accumulator reports the group's fate.
//! Only successful deliveries advance the shard's checkpoint, and only forwards: a confirmation
//! for a sequence number below what this coordinator already checkpointed for the shard is
//! dropped.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    accumulator::{DeliveryInfo, TrackingAccumulator, TrackingHandle, TrackingId},
    checkpoint::CheckpointStore,
    metric::Metric,
    sequence::SequenceNumber,
    shard::ShardId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("dispatch cancelled while waiting for an undelivered slot")]
    Cancelled,

    #[error("delivery confirmations are already being drained")]
    AlreadyDraining,
}

/// Metrics produced from one or more records of a single shard.
#[derive(Debug, Clone)]
pub struct MetricGroup {
    pub shard_id: ShardId,
    /// Highest sequence number among the records the metrics came from.
    pub sequence_number: SequenceNumber,
    pub metrics: Vec<Metric>,
}

impl MetricGroup {
    pub fn new(shard_id: ShardId, sequence_number: SequenceNumber, metrics: Vec<Metric>) -> Self {
        Self {
            shard_id,
            sequence_number,
            metrics,
        }
    }
}

/// Where a dispatched group came from, kept until its delivery is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDispatch {
    pub shard_id: ShardId,
    pub sequence_number: SequenceNumber,
}

#[derive(Debug)]
pub struct DeliveryCoordinator {
    stream_name: Arc<str>,
    accumulator: Arc<dyn TrackingAccumulator>,
    delivered: Mutex<Option<mpsc::Receiver<DeliveryInfo>>>,
    gate: Semaphore,
    max_undelivered: usize,
    pending: Mutex<HashMap<TrackingId, PendingDispatch>>,
    /// Highest sequence number checkpointed per shard by this coordinator.
    checkpointed: Mutex<HashMap<ShardId, SequenceNumber>>,
    checkpoints: Arc<CheckpointStore>,
}

impl DeliveryCoordinator {
    pub fn new(
        stream_name: impl Into<Arc<str>>,
        tracking: TrackingHandle,
        checkpoints: Arc<CheckpointStore>,
        max_undelivered: usize,
    ) -> Self {
        let TrackingHandle {
            accumulator,
            delivered,
        } = tracking;
        Self {
            stream_name: stream_name.into(),
            accumulator,
            delivered: Mutex::new(Some(delivered)),
            gate: Semaphore::new(max_undelivered),
            max_undelivered,
            pending: Default::default(),
            checkpointed: Default::default(),
            checkpoints,
        }
    }

    pub fn max_undelivered(&self) -> usize {
        self.max_undelivered
    }

    /// Groups dispatched whose delivery has not been confirmed yet.
    pub fn undelivered(&self) -> usize {
        self.pending.lock().len()
    }

    /// Hand `group` to the accumulator once a slot is free.
    ///
    /// Waits while `max_undelivered` groups are in flight. Returns [`DeliveryError::Cancelled`]
    /// if `cancel` fires first, in which case nothing was dispatched.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        group: MetricGroup,
    ) -> Result<TrackingId, DeliveryError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            permit = self.gate.acquire() => permit,
        };
        // the gate is never closed
        let Ok(permit) = permit else {
            return Err(DeliveryError::Cancelled);
        };
        // returned by `handle_delivery`
        permit.forget();

        let MetricGroup {
            shard_id,
            sequence_number,
            metrics,
        } = group;

        // held across the add so a fast confirmation cannot miss the pending entry
        let mut pending = self.pending.lock();
        let id = self.accumulator.add_tracking_metric_group(metrics);
        pending.insert(
            id,
            PendingDispatch {
                shard_id,
                sequence_number,
            },
        );
        Ok(id)
    }

    /// Consume delivery confirmations until `cancel` fires.
    ///
    /// Confirmations already queued when `cancel` fires are still applied, so the final
    /// checkpoint flush includes them.
    pub async fn drain(&self, cancel: CancellationToken) -> Result<(), DeliveryError> {
        let Some(mut delivered) = self.delivered.lock().take() else {
            return Err(DeliveryError::AlreadyDraining);
        };
        info!(
            stream = %self.stream_name,
            max_undelivered = self.max_undelivered,
            "draining delivery confirmations"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let mut late = 0_usize;
                    while let Ok(info) = delivered.try_recv() {
                        self.handle_delivery(info);
                        late += 1;
                    }
                    debug!(late, "applied confirmations queued at cancellation");
                    break;
                }
                info = delivered.recv() => match info {
                    Some(info) => self.handle_delivery(info),
                    None => {
                        debug!("delivery channel closed");
                        break;
                    }
                },
            }
        }

        *self.delivered.lock() = Some(delivered);
        Ok(())
    }

    fn handle_delivery(&self, info: DeliveryInfo) {
        let Some(PendingDispatch {
            shard_id,
            sequence_number,
        }) = self.pending.lock().remove(&info.id)
        else {
            debug!(tracking_id = info.id.get(), "confirmation for unknown tracking id");
            return;
        };
        self.gate.add_permits(1);

        if !info.delivered {
            warn!(
                %shard_id,
                %sequence_number,
                "metric group was not delivered, checkpoint not advanced"
            );
            return;
        }

        {
            let mut checkpointed = self.checkpointed.lock();
            if let Some(highest) = checkpointed.get(&shard_id) {
                if *highest > sequence_number {
                    debug!(
                        %shard_id,
                        %highest,
                        %sequence_number,
                        "confirmation behind checkpoint, ignoring"
                    );
                    return;
                }
            }
            checkpointed.insert(shard_id.clone(), sequence_number.clone());
        }
        self.checkpoints
            .set(&self.stream_name, &shard_id, sequence_number);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        accumulator::Accumulator,
        memory::{MemoryAccumulator, MemoryCheckpointBackend},
    };

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::from(n)
    }

    fn group(shard: &str, n: u64) -> MetricGroup {
        MetricGroup::new(ShardId::from(shard), seq(n), vec![])
    }

    fn setup(
        accumulator: &MemoryAccumulator,
        max_undelivered: usize,
    ) -> (Arc<DeliveryCoordinator>, Arc<CheckpointStore>) {
        let checkpoints = Arc::new(CheckpointStore::new(
            Arc::new(MemoryCheckpointBackend::default()),
            "agent",
            Duration::from_secs(1),
        ));
        let coordinator = Arc::new(DeliveryCoordinator::new(
            "metrics",
            accumulator.with_tracking(max_undelivered),
            Arc::clone(&checkpoints),
            max_undelivered,
        ));
        (coordinator, checkpoints)
    }

    fn spawn_drain(
        coordinator: &Arc<DeliveryCoordinator>,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), DeliveryError>> {
        let coordinator = Arc::clone(coordinator);
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.drain(cancel).await })
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_bounds_undelivered_groups() {
        let accumulator = MemoryAccumulator::manual();
        let (coordinator, _) = setup(&accumulator, 2);
        let cancel = CancellationToken::new();
        let drain = spawn_drain(&coordinator, &cancel);

        let first = coordinator.dispatch(&cancel, group("a", 1)).await.unwrap();
        coordinator.dispatch(&cancel, group("a", 2)).await.unwrap();
        assert_eq!(coordinator.undelivered(), 2);

        // the third has to wait for a slot
        let blocked = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.dispatch(&cancel, group("a", 3)),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(coordinator.undelivered(), 2);

        assert!(accumulator.confirm(first, true));
        coordinator.dispatch(&cancel, group("a", 3)).await.unwrap();
        assert_eq!(coordinator.undelivered(), 2);

        cancel.cancel();
        drain.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_keeps_checkpoint() {
        let accumulator = MemoryAccumulator::manual();
        let (coordinator, checkpoints) = setup(&accumulator, 10);
        let cancel = CancellationToken::new();
        let drain = spawn_drain(&coordinator, &cancel);
        let shard = ShardId::from("a");

        let ok = coordinator.dispatch(&cancel, group("a", 1)).await.unwrap();
        accumulator.confirm(ok, true);
        wait_for(|| coordinator.undelivered() == 0).await;
        assert_eq!(checkpoints.get("metrics", &shard).await.unwrap(), Some(seq(1)));

        let failed = coordinator.dispatch(&cancel, group("a", 2)).await.unwrap();
        accumulator.confirm(failed, false);
        wait_for(|| coordinator.undelivered() == 0).await;

        // slot released, checkpoint untouched
        assert_eq!(checkpoints.get("metrics", &shard).await.unwrap(), Some(seq(1)));

        cancel.cancel();
        drain.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_confirmations_do_not_regress() {
        let accumulator = MemoryAccumulator::manual();
        let (coordinator, checkpoints) = setup(&accumulator, 10);
        let cancel = CancellationToken::new();
        let drain = spawn_drain(&coordinator, &cancel);

        let low = coordinator.dispatch(&cancel, group("a", 5)).await.unwrap();
        let high = coordinator.dispatch(&cancel, group("a", 9)).await.unwrap();
        let other = coordinator.dispatch(&cancel, group("b", 1)).await.unwrap();

        accumulator.confirm(high, true);
        accumulator.confirm(low, true);
        accumulator.confirm(other, true);
        wait_for(|| coordinator.undelivered() == 0).await;

        assert_eq!(
            checkpoints.get("metrics", &ShardId::from("a")).await.unwrap(),
            Some(seq(9))
        );
        // shards are tracked independently
        assert_eq!(
            checkpoints.get("metrics", &ShardId::from("b")).await.unwrap(),
            Some(seq(1))
        );

        cancel.cancel();
        drain.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn queued_confirmations_applied_on_cancel() {
        let accumulator = MemoryAccumulator::manual();
        let (coordinator, checkpoints) = setup(&accumulator, 10);
        let cancel = CancellationToken::new();

        let first = coordinator.dispatch(&cancel, group("a", 1)).await.unwrap();
        let second = coordinator.dispatch(&cancel, group("a", 2)).await.unwrap();
        accumulator.confirm(first, true);
        accumulator.confirm(second, true);

        // cancelled before draining ever ran
        cancel.cancel();
        coordinator.drain(cancel.clone()).await.unwrap();

        assert_eq!(coordinator.undelivered(), 0);
        assert_eq!(
            checkpoints.get("metrics", &ShardId::from("a")).await.unwrap(),
            Some(seq(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_dispatch_dispatches_nothing() {
        let accumulator = MemoryAccumulator::manual();
        let (coordinator, _) = setup(&accumulator, 1);
        let cancel = CancellationToken::new();

        coordinator.dispatch(&cancel, group("a", 1)).await.unwrap();
        cancel.cancel();
        assert!(matches!(
            coordinator.dispatch(&cancel, group("a", 2)).await,
            Err(DeliveryError::Cancelled)
        ));
        assert_eq!(accumulator.groups().len(), 1);
    }

    #[tokio::test]
    async fn only_one_drain() {
        let accumulator = MemoryAccumulator::manual();
        let (coordinator, _) = setup(&accumulator, 1);
        let cancel = CancellationToken::new();
        let drain = spawn_drain(&coordinator, &cancel);
        tokio::task::yield_now().await;

        // the spawned drain has taken the receiver
        assert!(matches!(
            coordinator.drain(cancel.clone()).await,
            Err(DeliveryError::AlreadyDraining)
        ));

        cancel.cancel();
        drain.await.unwrap().unwrap();

        // the receiver is handed back once draining stops
        let restarted = CancellationToken::new();
        restarted.cancel();
        coordinator.drain(restarted).await.unwrap();
    }
}
