//! Which shards are being consumed, which are done, and which have failed.
//!
//! A shard can only be consumed while holding its [`ShardClaim`]. Claims are handed out
//! atomically, at most one per shard, and are released when dropped, so a consumer task that
//! ends for any reason frees its shard.

use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::shard::{ShardId, ShardState};

#[derive(Debug, Default)]
struct RegistryState {
    /// Claimed shards.
    active: HashSet<ShardId>,
    consumed: HashSet<ShardId>,
    /// Shards whose consumer failed; not claimable again in this process.
    failed: HashSet<ShardId>,
}

#[derive(Debug, Default)]
pub struct ShardRegistry {
    state: Mutex<RegistryState>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `shard_id` for consumption.
    ///
    /// `None` if the shard is already claimed, fully consumed, or has failed.
    pub fn try_claim(self: &Arc<Self>, shard_id: &ShardId) -> Option<ShardClaim> {
        let mut state = self.state.lock();
        if state.active.contains(shard_id)
            || state.consumed.contains(shard_id)
            || state.failed.contains(shard_id)
        {
            return None;
        }
        state.active.insert(shard_id.clone());
        Some(ShardClaim {
            registry: Arc::clone(self),
            shard_id: shard_id.clone(),
            released: false,
        })
    }

    /// Record that a shard needs no consumer, e.g. its checkpoint already reached its end.
    pub fn mark_consumed(&self, shard_id: &ShardId) {
        self.state.lock().consumed.insert(shard_id.clone());
    }

    pub fn is_consumed(&self, shard_id: &ShardId) -> bool {
        self.state.lock().consumed.contains(shard_id)
    }

    pub fn is_failed(&self, shard_id: &ShardId) -> bool {
        self.state.lock().failed.contains(shard_id)
    }

    /// Whether every shard in `shard_ids` is fully consumed; `true` when there are none.
    pub fn all_consumed<'a>(&self, shard_ids: impl IntoIterator<Item = &'a ShardId>) -> bool {
        let state = self.state.lock();
        shard_ids
            .into_iter()
            .all(|shard_id| state.consumed.contains(shard_id))
    }

    pub fn state(&self, shard_id: &ShardId) -> ShardState {
        let state = self.state.lock();
        if state.consumed.contains(shard_id) {
            ShardState::FullyConsumed
        } else if state.active.contains(shard_id) {
            ShardState::Active
        } else {
            ShardState::Discovered
        }
    }

    /// Currently claimed shards, sorted.
    pub fn active_shards(&self) -> Vec<ShardId> {
        let mut active: Vec<_> = self.state.lock().active.iter().cloned().collect();
        active.sort();
        active
    }

    fn release(&self, shard_id: &ShardId, outcome: Release) {
        let mut state = self.state.lock();
        state.active.remove(shard_id);
        match outcome {
            Release::Consumed => {
                state.consumed.insert(shard_id.clone());
            }
            Release::Failed => {
                state.failed.insert(shard_id.clone());
            }
            Release::Abandoned => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Release {
    Consumed,
    Failed,
    Abandoned,
}

/// Exclusive right to consume one shard, released on drop.
#[derive(Debug)]
pub struct ShardClaim {
    registry: Arc<ShardRegistry>,
    shard_id: ShardId,
    released: bool,
}

impl ShardClaim {
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Mark the shard fully consumed and release it.
    pub fn complete(mut self) {
        self.registry.release(&self.shard_id, Release::Consumed);
        self.released = true;
    }

    /// Fence the shard off for the rest of the process and release it.
    pub fn fail(mut self) {
        self.registry.release(&self.shard_id, Release::Failed);
        self.released = true;
    }
}

impl Drop for ShardClaim {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release(&self.shard_id, Release::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_claim_per_shard() {
        let registry = Arc::new(ShardRegistry::new());
        let shard = ShardId::from("shard-0");

        let claim = registry.try_claim(&shard).unwrap();
        assert!(registry.try_claim(&shard).is_none());
        assert_eq!(registry.state(&shard), ShardState::Active);

        drop(claim);
        assert_eq!(registry.state(&shard), ShardState::Discovered);
        assert!(registry.try_claim(&shard).is_some());
    }

    #[test]
    fn completed_shards_are_never_reclaimed() {
        let registry = Arc::new(ShardRegistry::new());
        let shard = ShardId::from("shard-0");

        registry.try_claim(&shard).unwrap().complete();
        assert_eq!(registry.state(&shard), ShardState::FullyConsumed);
        assert!(registry.try_claim(&shard).is_none());
        assert!(registry.active_shards().is_empty());
    }

    #[test]
    fn failed_shards_are_fenced() {
        let registry = Arc::new(ShardRegistry::new());
        let shard = ShardId::from("shard-0");

        registry.try_claim(&shard).unwrap().fail();
        assert!(registry.is_failed(&shard));
        assert!(!registry.is_consumed(&shard));
        assert!(registry.try_claim(&shard).is_none());
    }

    #[test]
    fn all_consumed_requires_every_parent() {
        let registry = Arc::new(ShardRegistry::new());
        let a = ShardId::from("a");
        let b = ShardId::from("b");
        registry.mark_consumed(&a);

        assert!(registry.all_consumed([&a]));
        assert!(!registry.all_consumed([&a, &b]));
        assert!(registry.all_consumed(std::iter::empty()));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let registry = Arc::new(ShardRegistry::new());
        let shard = ShardId::from("shard-0");

        let claims: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.try_claim(&shard)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(claims.iter().filter(|c| c.is_some()).count(), 1);
        assert_eq!(registry.active_shards(), vec![shard.clone()]);
    }
}
