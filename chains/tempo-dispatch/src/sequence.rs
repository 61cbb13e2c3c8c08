//! Sequence Allocator - per-(owner, lane) nonce cache with remote fallback
//!
//! Each `(owner, lane)` key owns its own async mutex, so allocation for one
//! key never waits on another. The key lock is held across the remote read on
//! a cache miss: concurrent callers for a fresh key queue behind the first one
//! and then draw from the seeded value, which keeps the issued values a
//! contiguous range starting at the remote counter.
//!
//! # Strategies
//!
//! - **Sequential** (lane 0): the protocol nonce. Each value depends on the
//!   previous one being accepted, so callers hold the owner's lease while
//!   submitting.
//! - **Parallel** (lanes >= 1): independent streams. A lane must be authorized
//!   on chain (see [`SequenceAllocator::authorize_lane`]) before the first
//!   allocation.
//!
//! # Resync
//!
//! The cache is optimistic. Any submission failure must call
//! [`SequenceAllocator::invalidate`] so the next allocation re-reads the
//! remote counter instead of reusing a value the chain may have rejected.

use crate::config::SequenceConfig;
use crate::error::DispatchError;
use crate::rpc::{RemoteRpc, Signer, authorize_lane_operation};
use crate::types::{Finality, Lane, Owner, PROTOCOL_LANE};
use core_logic::{RetryConfig, with_retry_if};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    Sequential,
    Parallel,
}

impl AllocationStrategy {
    pub fn for_lane(lane: Lane) -> Self {
        if lane == PROTOCOL_LANE {
            AllocationStrategy::Sequential
        } else {
            AllocationStrategy::Parallel
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub authorizations: u64,
    pub cached_keys: usize,
}

type Slot = Arc<Mutex<Option<u64>>>;

pub struct SequenceAllocator {
    slots: RwLock<HashMap<(Owner, Lane), Slot>>,
    authorized: RwLock<HashSet<(Owner, Lane)>>,
    /// Serializes authorizations per owner; each one spends a lane-0 value.
    authorizing: Mutex<HashMap<Owner, Arc<Mutex<()>>>>,
    config: SequenceConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    authorizations: AtomicU64,
}

impl SequenceAllocator {
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            authorized: RwLock::new(HashSet::new()),
            authorizing: Mutex::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            authorizations: AtomicU64::new(0),
        }
    }

    async fn slot(&self, owner: Owner, lane: Lane) -> Slot {
        if let Some(slot) = self.slots.read().await.get(&(owner, lane)) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry((owner, lane))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Returns the next unused sequence and advances the cache.
    pub async fn next_sequence(
        &self,
        rpc: &dyn RemoteRpc,
        owner: Owner,
        lane: Lane,
    ) -> Result<u64, DispatchError> {
        let slot = self.slot(owner, lane).await;
        let mut cached = slot.lock().await;

        let next = match *cached {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if AllocationStrategy::for_lane(lane) == AllocationStrategy::Parallel {
                    self.ensure_authorized(rpc, owner, lane).await?;
                }
                let remote = self.read_remote(rpc, owner, lane).await?;
                debug!(%owner, lane, remote, "Seeded sequence cache");
                remote
            }
        };

        let following = next.checked_add(1).ok_or_else(|| {
            DispatchError::TaskLogic(format!("sequence overflow for {} lane {}", owner, lane))
        })?;
        *cached = Some(following);
        Ok(next)
    }

    /// Next value without consuming it. Seeds the cache on a miss.
    pub async fn peek_sequence(
        &self,
        rpc: &dyn RemoteRpc,
        owner: Owner,
        lane: Lane,
    ) -> Result<u64, DispatchError> {
        let slot = self.slot(owner, lane).await;
        let mut cached = slot.lock().await;

        if let Some(value) = *cached {
            return Ok(value);
        }
        let remote = self.read_remote(rpc, owner, lane).await?;
        *cached = Some(remote);
        Ok(remote)
    }

    /// Forces the next allocation for the key to re-read the remote counter.
    pub async fn invalidate(&self, owner: Owner, lane: Lane) {
        let slot = self.slots.read().await.get(&(owner, lane)).cloned();
        if let Some(slot) = slot {
            *slot.lock().await = None;
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(%owner, lane, "Sequence cache invalidated");
        }
    }

    /// Invalidates every lane cached for `owner`.
    pub async fn invalidate_owner(&self, owner: Owner) {
        let slots: Vec<(Lane, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|((o, _), _)| *o == owner)
            .map(|((_, lane), slot)| (*lane, slot.clone()))
            .collect();

        for (lane, slot) in slots {
            *slot.lock().await = None;
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(%owner, lane, "Sequence cache invalidated");
        }
    }

    /// Re-reads the remote counter and only ever moves the cache forward.
    pub async fn reconcile(
        &self,
        rpc: &dyn RemoteRpc,
        owner: Owner,
        lane: Lane,
    ) -> Result<u64, DispatchError> {
        let remote = self.read_remote(rpc, owner, lane).await?;
        let slot = self.slot(owner, lane).await;
        let mut cached = slot.lock().await;

        let value = match *cached {
            Some(local) if local >= remote => local,
            Some(local) => {
                warn!(%owner, lane, local, remote, "Cache behind chain, moving forward");
                remote
            }
            None => remote,
        };
        *cached = Some(value);
        Ok(value)
    }

    pub async fn is_authorized(&self, owner: Owner, lane: Lane) -> bool {
        lane == PROTOCOL_LANE || self.authorized.read().await.contains(&(owner, lane))
    }

    /// Makes `lane` usable for the signer's owner.
    ///
    /// Idempotent: lanes already known to be authorized, locally or on chain,
    /// return without submitting anything.
    pub async fn authorize_lane(
        &self,
        rpc: &dyn RemoteRpc,
        signer: &dyn Signer,
        lane: Lane,
    ) -> Result<(), DispatchError> {
        let owner = signer.address();
        if self.is_authorized(owner, lane).await {
            return Ok(());
        }

        let gate = self
            .authorizing
            .lock()
            .await
            .entry(owner)
            .or_default()
            .clone();
        let _serial = gate.lock().await;

        // Another worker may have finished while we queued
        if self.is_authorized(owner, lane).await {
            return Ok(());
        }

        let failed = |reason: String| DispatchError::LaneAuthorizationFailed {
            owner,
            lane,
            reason,
        };

        let count = rpc
            .authorized_lanes(owner)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if count >= lane {
            self.mark_authorized(owner, lane).await;
            return Ok(());
        }

        let operation = authorize_lane_operation(lane);
        let sequence = self
            .next_sequence(rpc, owner, PROTOCOL_LANE)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let signed = signer
            .sign(&operation, PROTOCOL_LANE, sequence)
            .map_err(|e| failed(e.to_string()))?;

        let tx_hash = match rpc.submit(&signed).await {
            Ok(hash) => hash,
            Err(e) => {
                self.invalidate(owner, PROTOCOL_LANE).await;
                return Err(failed(e.to_string()));
            }
        };

        let poll_every = Duration::from_millis(self.config.authorization_poll_ms);
        for _ in 0..self.config.authorization_max_polls {
            match rpc.poll(tx_hash).await {
                Ok(Some(Finality::Success)) => {
                    self.mark_authorized(owner, lane).await;
                    self.authorizations.fetch_add(1, Ordering::Relaxed);
                    info!(%owner, lane, %tx_hash, "Lane authorized");
                    return Ok(());
                }
                Ok(Some(Finality::Reverted)) => {
                    return Err(failed(format!("authorization {} reverted", tx_hash)));
                }
                Ok(None) => {}
                Err(e) => debug!(%owner, lane, "Authorization poll failed: {}", e),
            }
            tokio::time::sleep(poll_every).await;
        }

        Err(failed(format!(
            "authorization {} not acknowledged after {} polls",
            tx_hash, self.config.authorization_max_polls
        )))
    }

    pub fn stats(&self) -> SequenceStats {
        SequenceStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            authorizations: self.authorizations.load(Ordering::Relaxed),
            cached_keys: self.slots.try_read().map(|s| s.len()).unwrap_or(0),
        }
    }

    async fn mark_authorized(&self, owner: Owner, lane: Lane) {
        self.authorized.write().await.insert((owner, lane));
    }

    async fn ensure_authorized(
        &self,
        rpc: &dyn RemoteRpc,
        owner: Owner,
        lane: Lane,
    ) -> Result<(), DispatchError> {
        if self.is_authorized(owner, lane).await {
            return Ok(());
        }
        // Lanes authorized by an earlier run are still valid on chain
        let count = rpc.authorized_lanes(owner).await?;
        if count >= lane {
            self.mark_authorized(owner, lane).await;
            return Ok(());
        }
        Err(DispatchError::LaneAuthorizationFailed {
            owner,
            lane,
            reason: "lane not authorized".to_string(),
        })
    }

    async fn read_remote(
        &self,
        rpc: &dyn RemoteRpc,
        owner: Owner,
        lane: Lane,
    ) -> Result<u64, DispatchError> {
        let retry = RetryConfig::new(self.config.read_retries, self.config.read_retry_delay_ms);

        with_retry_if(
            &retry,
            "read_sequence",
            || async move { rpc.sequence(owner, lane).await.map_err(anyhow::Error::new) },
            |e| {
                e.downcast_ref::<DispatchError>()
                    .is_some_and(DispatchError::is_endpoint_fault)
            },
        )
        .await
        .map_err(|e| {
            e.chain()
                .find_map(|cause| cause.downcast_ref::<DispatchError>())
                .cloned()
                .unwrap_or_else(|| DispatchError::TaskLogic(format!("{:#}", e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimSigner, SimulatedChain};
    use alloy_primitives::Address;
    use std::collections::BTreeSet;

    fn allocator() -> SequenceAllocator {
        SequenceAllocator::new(SequenceConfig {
            authorization_poll_ms: 1,
            read_retry_delay_ms: 1,
            ..SequenceConfig::default()
        })
    }

    #[tokio::test]
    async fn concurrent_callers_get_contiguous_range() {
        let chain = Arc::new(SimulatedChain::new());
        let owner = Address::repeat_byte(1);
        chain.bump_sequence(owner, PROTOCOL_LANE, 7);
        let allocator = Arc::new(allocator());

        let mut handles = Vec::new();
        for _ in 0..64 {
            let chain = chain.clone();
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .next_sequence(chain.as_ref(), owner, PROTOCOL_LANE)
                    .await
                    .unwrap()
            }));
        }

        let mut values = BTreeSet::new();
        for handle in handles {
            assert!(values.insert(handle.await.unwrap()), "duplicate sequence");
        }
        assert_eq!(values, (7..71).collect::<BTreeSet<u64>>());
        // Only the first caller read the chain
        assert_eq!(chain.sequence_reads(), 1);
        assert_eq!(allocator.stats().misses, 1);
    }

    #[tokio::test]
    async fn invalidate_resyncs_from_chain() {
        let chain = SimulatedChain::new();
        let owner = Address::repeat_byte(2);
        let allocator = allocator();

        assert_eq!(allocator.next_sequence(&chain, owner, 0).await.unwrap(), 0);
        assert_eq!(allocator.next_sequence(&chain, owner, 0).await.unwrap(), 1);

        // Someone else used the owner outside this process
        chain.bump_sequence(owner, 0, 10);
        allocator.invalidate(owner, 0).await;

        assert_eq!(allocator.next_sequence(&chain, owner, 0).await.unwrap(), 10);
        assert_eq!(allocator.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let chain = SimulatedChain::new();
        let owner = Address::repeat_byte(3);
        let allocator = allocator();

        assert_eq!(allocator.peek_sequence(&chain, owner, 0).await.unwrap(), 0);
        assert_eq!(allocator.peek_sequence(&chain, owner, 0).await.unwrap(), 0);
        assert_eq!(allocator.next_sequence(&chain, owner, 0).await.unwrap(), 0);
        assert_eq!(allocator.peek_sequence(&chain, owner, 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unauthorized_lane_is_refused() {
        let chain = SimulatedChain::new();
        let owner = Address::repeat_byte(4);
        let allocator = allocator();

        let err = allocator.next_sequence(&chain, owner, 3).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::LaneAuthorizationFailed { lane: 3, .. }
        ));
    }

    #[tokio::test]
    async fn authorize_lane_is_idempotent() {
        let chain = SimulatedChain::new();
        let signer = SimSigner::from_index(0);
        let owner = signer.address();
        let allocator = allocator();

        allocator.authorize_lane(&chain, &signer, 1).await.unwrap();
        assert_eq!(chain.submissions().len(), 1);
        assert!(allocator.is_authorized(owner, 1).await);

        allocator.authorize_lane(&chain, &signer, 1).await.unwrap();
        assert_eq!(chain.submissions().len(), 1, "second call must not submit");
        assert_eq!(allocator.stats().authorizations, 1);

        // The authorization spent lane-0 sequence 0
        assert_eq!(allocator.next_sequence(&chain, owner, 0).await.unwrap(), 1);
        assert_eq!(allocator.next_sequence(&chain, owner, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lanes_authorized_on_chain_are_picked_up() {
        let chain = SimulatedChain::new();
        let signer = SimSigner::from_index(1);
        let owner = signer.address();
        chain.authorize_externally(owner, 2);
        let allocator = allocator();

        allocator.authorize_lane(&chain, &signer, 2).await.unwrap();
        assert!(chain.submissions().is_empty());
        assert_eq!(allocator.next_sequence(&chain, owner, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_only_moves_forward() {
        let chain = SimulatedChain::new();
        let owner = Address::repeat_byte(5);
        let allocator = allocator();

        for _ in 0..5 {
            allocator.next_sequence(&chain, owner, 0).await.unwrap();
        }
        // Chain has seen nothing yet, local cache is ahead
        assert_eq!(allocator.reconcile(&chain, owner, 0).await.unwrap(), 5);

        chain.bump_sequence(owner, 0, 9);
        assert_eq!(allocator.reconcile(&chain, owner, 0).await.unwrap(), 9);
        assert_eq!(allocator.next_sequence(&chain, owner, 0).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn transient_read_errors_are_retried() {
        let chain = SimulatedChain::new();
        let owner = Address::repeat_byte(6);
        chain.fail_next_reads(2);
        let allocator = allocator();

        assert_eq!(allocator.next_sequence(&chain, owner, 0).await.unwrap(), 0);
        assert_eq!(chain.sequence_reads(), 3);
    }

    #[tokio::test]
    async fn invalidate_owner_clears_all_lanes() {
        let chain = SimulatedChain::new();
        let signer = SimSigner::from_index(2);
        let owner = signer.address();
        let allocator = allocator();

        allocator.authorize_lane(&chain, &signer, 1).await.unwrap();
        allocator.next_sequence(&chain, owner, 1).await.unwrap();
        allocator.next_sequence(&chain, owner, 0).await.unwrap();

        allocator.invalidate_owner(owner).await;
        assert_eq!(allocator.stats().invalidations, 2);
    }
}
