//! In-memory chain used by the `dispatch-sim` binary and by tests.
//!
//! Behaves like a node for the four calls the engine needs: per-(owner, lane)
//! counters that must be hit exactly, lane authorization through the keychain
//! call, receipts, and a few fault knobs (latency, transport outage, failing
//! submissions, external sequence bumps).

use crate::error::DispatchError;
use crate::rpc::{Endpoint, RemoteRpc, Signer, TransportFactory, decode_authorize_lane};
use crate::types::{
    EndpointId, Finality, Lane, Operation, Owner, PROTOCOL_LANE, SignedOperation, TxHash,
};
use alloy_primitives::{Address, keccak256};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type FailurePredicate = Box<dyn Fn(&SignedOperation) -> Option<String> + Send + Sync>;

/// One accepted submission, in acceptance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub owner: Owner,
    pub lane: Lane,
    pub sequence: u64,
    pub tx_hash: TxHash,
    pub endpoint: Option<EndpointId>,
}

#[derive(Default)]
struct ChainState {
    sequences: HashMap<(Owner, Lane), u64>,
    authorized: HashMap<Owner, BTreeSet<Lane>>,
    receipts: HashMap<TxHash, Finality>,
    log: Vec<SubmissionRecord>,
}

impl ChainState {
    /// Lanes `1..=n` that are all authorized.
    fn authorized_prefix(&self, owner: Owner) -> u64 {
        let Some(lanes) = self.authorized.get(&owner) else {
            return 0;
        };
        let mut count = 0;
        while lanes.contains(&(count + 1)) {
            count += 1;
        }
        count
    }
}

pub struct SimulatedChain {
    state: Mutex<ChainState>,
    latency: Duration,
    fail_when: Option<FailurePredicate>,
    outage: AtomicBool,
    down_endpoints: Mutex<HashSet<EndpointId>>,
    failing_reads: AtomicU64,
    reads: AtomicU64,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            latency: Duration::ZERO,
            fail_when: None,
            outage: AtomicBool::new(false),
            down_endpoints: Mutex::new(HashSet::new()),
            failing_reads: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Delay applied to every submission.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Rejects submissions the predicate returns a reason for. The sequence
    /// is not consumed, as with a node-side validation error.
    pub fn with_failures<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SignedOperation) -> Option<String> + Send + Sync + 'static,
    {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every call fails with a transport error while set.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Calls routed through `endpoint` fail with a transport error while set.
    pub fn set_endpoint_down(&self, endpoint: EndpointId, down: bool) {
        let mut set = self.down_endpoints.lock().unwrap_or_else(|p| p.into_inner());
        if down {
            set.insert(endpoint);
        } else {
            set.remove(&endpoint);
        }
    }

    fn endpoint_down(&self, endpoint: EndpointId) -> bool {
        self.down_endpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&endpoint)
    }

    /// The next `n` sequence reads fail with a transport error.
    pub fn fail_next_reads(&self, n: u64) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Advances a counter as if the owner were used by another process.
    pub fn bump_sequence(&self, owner: Owner, lane: Lane, by: u64) {
        *self.state().sequences.entry((owner, lane)).or_insert(0) += by;
    }

    /// Authorizes lanes `1..=count` without a submission.
    pub fn authorize_externally(&self, owner: Owner, count: u64) {
        self.state()
            .authorized
            .entry(owner)
            .or_default()
            .extend(1..=count);
    }

    pub fn current_sequence(&self, owner: Owner, lane: Lane) -> u64 {
        self.state()
            .sequences
            .get(&(owner, lane))
            .copied()
            .unwrap_or(0)
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state().log.clone()
    }

    pub fn sequence_reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn check_outage(&self, endpoint: Option<EndpointId>) -> Result<(), DispatchError> {
        let down = self.outage.load(Ordering::SeqCst)
            || endpoint.is_some_and(|id| self.endpoint_down(id));
        if down {
            return Err(DispatchError::Transport {
                endpoint: endpoint.map(|id| id.to_string()).unwrap_or_default(),
                reason: "connection closed before message completed".to_string(),
            });
        }
        Ok(())
    }

    async fn read_sequence(
        &self,
        owner: Owner,
        lane: Lane,
        endpoint: Option<EndpointId>,
    ) -> Result<u64, DispatchError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_outage(endpoint)?;
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DispatchError::Transport {
                endpoint: endpoint.map(|id| id.to_string()).unwrap_or_default(),
                reason: "connection reset by peer".to_string(),
            });
        }
        Ok(self.current_sequence(owner, lane))
    }

    async fn submit_via(
        &self,
        operation: &SignedOperation,
        endpoint: Option<EndpointId>,
    ) -> Result<TxHash, DispatchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.check_outage(endpoint)?;

        if let Some(reason) = self.fail_when.as_ref().and_then(|f| f(operation)) {
            return Err(DispatchError::TaskLogic(reason));
        }

        let mut state = self.state();
        let owner = operation.owner;
        let lane = operation.lane;

        if lane != PROTOCOL_LANE
            && !state
                .authorized
                .get(&owner)
                .is_some_and(|lanes| lanes.contains(&lane))
        {
            return Err(DispatchError::TaskLogic(format!(
                "nonce key {} not authorized",
                lane
            )));
        }

        let expected = state.sequences.get(&(owner, lane)).copied().unwrap_or(0);
        if operation.sequence != expected {
            let reason = if operation.sequence < expected {
                format!("nonce too low: next nonce {}, tx nonce {}", expected, operation.sequence)
            } else {
                format!("nonce too high: next nonce {}, tx nonce {}", expected, operation.sequence)
            };
            return Err(DispatchError::SequenceRejected {
                owner,
                lane,
                reason,
            });
        }
        state.sequences.insert((owner, lane), expected + 1);

        if let Some(new_lane) = decode_authorize_lane(&operation.operation) {
            state.authorized.entry(owner).or_default().insert(new_lane);
        }

        let tx_hash = keccak256(&operation.raw);
        state.receipts.insert(tx_hash, Finality::Success);
        state.log.push(SubmissionRecord {
            owner,
            lane,
            sequence: operation.sequence,
            tx_hash,
            endpoint,
        });
        Ok(tx_hash)
    }

    fn poll_via(
        &self,
        tx_hash: TxHash,
        endpoint: Option<EndpointId>,
    ) -> Result<Option<Finality>, DispatchError> {
        self.check_outage(endpoint)?;
        Ok(self.state().receipts.get(&tx_hash).copied())
    }

    fn lanes_via(&self, owner: Owner, endpoint: Option<EndpointId>) -> Result<u64, DispatchError> {
        self.check_outage(endpoint)?;
        Ok(self.state().authorized_prefix(owner))
    }
}

#[async_trait]
impl RemoteRpc for SimulatedChain {
    async fn sequence(&self, owner: Owner, lane: Lane) -> Result<u64, DispatchError> {
        self.read_sequence(owner, lane, None).await
    }

    async fn authorized_lanes(&self, owner: Owner) -> Result<u64, DispatchError> {
        self.lanes_via(owner, None)
    }

    async fn submit(&self, operation: &SignedOperation) -> Result<TxHash, DispatchError> {
        self.submit_via(operation, None).await
    }

    async fn poll(&self, tx_hash: TxHash) -> Result<Option<Finality>, DispatchError> {
        self.poll_via(tx_hash, None)
    }
}

/// The shared chain as seen through one endpoint.
struct SimRoute {
    chain: Arc<SimulatedChain>,
    endpoint: EndpointId,
}

#[async_trait]
impl RemoteRpc for SimRoute {
    async fn sequence(&self, owner: Owner, lane: Lane) -> Result<u64, DispatchError> {
        self.chain
            .read_sequence(owner, lane, Some(self.endpoint))
            .await
    }

    async fn authorized_lanes(&self, owner: Owner) -> Result<u64, DispatchError> {
        self.chain.lanes_via(owner, Some(self.endpoint))
    }

    async fn submit(&self, operation: &SignedOperation) -> Result<TxHash, DispatchError> {
        self.chain.submit_via(operation, Some(self.endpoint)).await
    }

    async fn poll(&self, tx_hash: TxHash) -> Result<Option<Finality>, DispatchError> {
        self.chain.poll_via(tx_hash, Some(self.endpoint))
    }
}

/// Routes every endpoint to the same [`SimulatedChain`].
pub struct SimTransportFactory {
    chain: Arc<SimulatedChain>,
    connects: AtomicU64,
}

impl SimTransportFactory {
    pub fn new(chain: Arc<SimulatedChain>) -> Self {
        Self {
            chain,
            connects: AtomicU64::new(0),
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl TransportFactory for SimTransportFactory {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteRpc>, DispatchError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimRoute {
            chain: self.chain.clone(),
            endpoint: endpoint.id,
        }))
    }
}

/// Deterministic signer for simulated owners.
#[derive(Debug, Clone)]
pub struct SimSigner {
    address: Address,
}

impl SimSigner {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn from_index(index: usize) -> Self {
        let seed = keccak256(format!("sim-owner-{}", index));
        Self {
            address: Address::from_word(seed),
        }
    }
}

impl Signer for SimSigner {
    fn address(&self) -> Owner {
        self.address
    }

    fn sign(
        &self,
        operation: &Operation,
        lane: Lane,
        sequence: u64,
    ) -> Result<SignedOperation, DispatchError> {
        let mut raw = Vec::with_capacity(56 + operation.input.len() + 32);
        raw.extend_from_slice(self.address.as_slice());
        raw.extend_from_slice(&lane.to_be_bytes());
        raw.extend_from_slice(&sequence.to_be_bytes());
        raw.extend_from_slice(operation.to.as_slice());
        raw.extend_from_slice(&operation.value.to_be_bytes::<32>());
        raw.extend_from_slice(&operation.input);

        Ok(SignedOperation {
            owner: self.address,
            lane,
            sequence,
            operation: operation.clone(),
            raw: raw.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::authorize_lane_operation;
    use alloy_primitives::U256;

    #[tokio::test]
    async fn sequences_must_match_exactly() {
        let chain = SimulatedChain::new();
        let signer = SimSigner::from_index(0);
        let op = Operation::transfer(Address::ZERO, U256::from(1));

        let first = signer.sign(&op, 0, 0).unwrap();
        chain.submit(&first).await.unwrap();

        let replay = chain.submit(&first).await.unwrap_err();
        assert!(matches!(replay, DispatchError::SequenceRejected { .. }));
        assert!(replay.to_string().contains("nonce too low"));

        let gap = signer.sign(&op, 0, 5).unwrap();
        assert!(chain.submit(&gap).await.is_err());
        assert_eq!(chain.current_sequence(signer.address(), 0), 1);
    }

    #[tokio::test]
    async fn keychain_call_authorizes_lane() {
        let chain = SimulatedChain::new();
        let signer = SimSigner::from_index(1);
        let owner = signer.address();

        let unauthorized = signer
            .sign(&Operation::transfer(Address::ZERO, U256::ZERO), 1, 0)
            .unwrap();
        assert!(chain.submit(&unauthorized).await.is_err());

        let auth = signer.sign(&authorize_lane_operation(1), 0, 0).unwrap();
        let tx = chain.submit(&auth).await.unwrap();
        assert_eq!(chain.poll(tx).await.unwrap(), Some(Finality::Success));
        assert_eq!(chain.authorized_lanes(owner).await.unwrap(), 1);
        assert!(chain.submit(&unauthorized).await.is_ok());
    }

    #[tokio::test]
    async fn routes_fail_independently() {
        let chain = Arc::new(SimulatedChain::new());
        let factory = SimTransportFactory::new(chain.clone());
        let endpoint = |id| Endpoint {
            id: EndpointId(id),
            name: format!("sim-{}", id),
            rpc_url: "http://sim".into(),
            proxy: None,
        };
        let a = factory.connect(&endpoint(0)).unwrap();
        let b = factory.connect(&endpoint(1)).unwrap();

        chain.set_endpoint_down(EndpointId(0), true);
        assert!(matches!(
            a.sequence(Address::ZERO, 0).await,
            Err(DispatchError::Transport { .. })
        ));
        assert_eq!(b.sequence(Address::ZERO, 0).await.unwrap(), 0);
    }

    #[test]
    fn signer_addresses_are_stable_and_distinct() {
        assert_eq!(
            SimSigner::from_index(3).address(),
            SimSigner::from_index(3).address()
        );
        assert_ne!(
            SimSigner::from_index(3).address(),
            SimSigner::from_index(4).address()
        );
    }
}
