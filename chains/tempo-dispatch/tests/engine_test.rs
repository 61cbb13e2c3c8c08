//! End-to-end scenarios over the simulated chain.

use alloy_primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use core_logic::MetricsCollector;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempo_dispatch::{
    DispatchError, Endpoint, EndpointHealthTracker, EndpointId, EndpointStatus, ErrorClass,
    FailureKind, HealthConfig, Operation, Outcome, PROTOCOL_LANE, ParallelConfig,
    ParallelDispatcher, PoolConfig, ResourcePool, SchedulerSettings, SequenceAllocator,
    SequenceConfig, Signer, SimSigner, SimTransportFactory, SimulatedChain, TaskContext,
    TaskScheduler, TempoTask,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Harness {
    chain: Arc<SimulatedChain>,
    health: Arc<EndpointHealthTracker>,
    pool: Arc<ResourcePool>,
    dispatcher: Arc<ParallelDispatcher>,
    metrics: Arc<MetricsCollector>,
}

fn harness(chain: SimulatedChain, owners: usize, endpoints: usize, pool: PoolConfig) -> Harness {
    let chain = Arc::new(chain);
    let endpoints = (0..endpoints)
        .map(|i| Endpoint {
            id: EndpointId(i),
            name: format!("route-{}", i),
            rpc_url: "sim://local".to_string(),
            proxy: None,
        })
        .collect();
    let health = Arc::new(EndpointHealthTracker::new(endpoints, HealthConfig::default()).unwrap());
    let signers: Vec<Arc<dyn Signer>> = (0..owners)
        .map(|i| Arc::new(SimSigner::from_index(i)) as Arc<dyn Signer>)
        .collect();
    let pool = ResourcePool::new(
        signers,
        health.clone(),
        Arc::new(SimTransportFactory::new(chain.clone())),
        pool,
    )
    .unwrap();
    let sequences = Arc::new(SequenceAllocator::new(SequenceConfig::default()));
    let dispatcher = Arc::new(ParallelDispatcher::new(sequences, ParallelConfig::default()));

    Harness {
        chain,
        health,
        pool,
        dispatcher,
        metrics: Arc::new(MetricsCollector::default()),
    }
}

fn settings(workers: usize) -> SchedulerSettings {
    SchedulerSettings {
        worker_count: workers,
        interval_min: Duration::from_millis(10),
        interval_max: Duration::from_millis(30),
        task_timeout: Duration::from_secs(5),
        backoff_min: Duration::from_millis(50),
        backoff_max: Duration::from_millis(400),
        admission_capacity: 16,
    }
}

fn scheduler(h: &Harness, workers: usize, task: Arc<dyn TempoTask>) -> Arc<TaskScheduler> {
    Arc::new(
        TaskScheduler::new(
            settings(workers),
            vec![task],
            &HashMap::new(),
            h.pool.clone(),
            h.dispatcher.clone(),
            h.metrics.clone(),
        )
        .unwrap(),
    )
}

/// One lane-0 transfer per run.
struct LaneZeroTransfer;

#[async_trait]
impl TempoTask for LaneZeroTransfer {
    fn name(&self) -> &'static str {
        "lane_zero_transfer"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Outcome> {
        Ok(ctx
            .submit(Operation::transfer(Address::repeat_byte(0x22), U256::from(1)))
            .await?)
    }
}

#[tokio::test(start_paused = true)]
async fn lane_zero_sequences_stay_ordered_per_owner() {
    let h = harness(
        SimulatedChain::new().with_latency(Duration::from_millis(5)),
        4,
        1,
        PoolConfig::default(),
    );
    let scheduler = scheduler(&h, 2, Arc::new(LaneZeroTransfer));

    let token = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(token.clone()));
    tokio::time::sleep(Duration::from_secs(3)).await;
    token.cancel();
    let report = run.await.unwrap();

    assert_eq!(report.failed, 0);
    let submissions = h.chain.submissions();
    for owner in h.pool.owners() {
        let sequences: Vec<u64> = submissions
            .iter()
            .filter(|s| s.owner == owner && s.lane == PROTOCOL_LANE)
            .map(|s| s.sequence)
            .collect();
        assert!(sequences.len() >= 10, "owner {} only got {}", owner, sequences.len());
        let expected: Vec<u64> = (0..sequences.len() as u64).collect();
        assert_eq!(sequences, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn one_failing_lane_does_not_hold_back_the_others() {
    let latency = Duration::from_millis(100);
    let h = harness(
        SimulatedChain::new()
            .with_latency(latency)
            .with_failures(|op| (op.lane == 3).then(|| "execution reverted".to_string())),
        1,
        1,
        PoolConfig::default(),
    );
    let lease = h.pool.lease(None).await.unwrap();
    h.chain.authorize_externally(lease.owner, 5);

    let operations = (0..5)
        .map(|i| Operation::transfer(Address::repeat_byte(0x30 + i), U256::from(1)))
        .collect();
    let started = Instant::now();
    let results = h.dispatcher.dispatch(lease.client(), operations, None).await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 5);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
    assert!(matches!(results[2], Err(DispatchError::TaskLogic(_))));
    // Concurrent: about one latency, not five
    assert!(elapsed < latency * 2, "took {:?}", elapsed);

    let mut lanes: Vec<u64> = h.chain.submissions().iter().map(|s| s.lane).collect();
    lanes.sort_unstable();
    assert_eq!(lanes, vec![1, 2, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn scheduler_backs_off_while_every_endpoint_is_banned() {
    let h = harness(SimulatedChain::new(), 2, 2, PoolConfig::default());
    h.health.record_failure(EndpointId(0), FailureKind::Hard);
    h.health.record_failure(EndpointId(1), FailureKind::Hard);
    let scheduler = scheduler(&h, 2, Arc::new(LaneZeroTransfer));

    let token = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(token.clone()));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.chain.submissions().is_empty());
    let unavailable = h.metrics.snapshot().errors["endpoint_unavailable"];
    assert!(unavailable >= 4, "only {} backoffs", unavailable);

    h.health.restore(EndpointId(1));
    assert_eq!(h.health.status(EndpointId(1)), Some(EndpointStatus::Healthy));
    // Longest backoff plus one idle interval
    tokio::time::sleep(Duration::from_millis(400 + 30 + 10)).await;
    assert!(!h.chain.submissions().is_empty());

    token.cancel();
    let report = run.await.unwrap();
    assert!(report.backoffs >= 4);
    assert!(report.success > 0);
    assert_eq!(report.errors_of(ErrorClass::EndpointUnavailable), report.backoffs);
    assert!(h.chain.submissions().iter().all(|s| s.endpoint == Some(EndpointId(1))));
}

/// Flags any moment where two runs hold the same owner.
struct ExclusiveHold {
    held: Mutex<HashSet<Address>>,
    overlaps: AtomicU64,
}

#[async_trait]
impl TempoTask for ExclusiveHold {
    fn name(&self) -> &'static str {
        "exclusive_hold"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Outcome> {
        let owner = ctx.address();
        if !self.held.lock().unwrap().insert(owner) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(fastrand::u64(1..20))).await;
        self.held.lock().unwrap().remove(&owner);
        Ok(Outcome::success("held", None))
    }
}

#[tokio::test(start_paused = true)]
async fn more_workers_than_owners_never_double_lease() {
    let h = harness(
        SimulatedChain::new(),
        3,
        1,
        PoolConfig {
            max_wait_ms: 100,
            release_cooldown_ms: 0,
        },
    );
    let hold = Arc::new(ExclusiveHold {
        held: Mutex::new(HashSet::new()),
        overlaps: AtomicU64::new(0),
    });
    let scheduler = scheduler(&h, 12, hold.clone());

    let token = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(token.clone()));
    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    let report = run.await.unwrap();

    assert_eq!(hold.overlaps.load(Ordering::SeqCst), 0);
    assert!(report.success > 0);
    assert_eq!(report.errors_of(ErrorClass::PoolExhausted), report.backoffs);
    assert_eq!(h.pool.leased_count(), 0);
    assert_eq!(h.pool.available_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_quarantine_the_endpoint() {
    let h = harness(SimulatedChain::new(), 1, 2, PoolConfig::default());
    h.chain.set_endpoint_down(EndpointId(0), true);
    let scheduler = scheduler(&h, 1, Arc::new(LaneZeroTransfer));

    let token = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(token.clone()));
    tokio::time::sleep(Duration::from_secs(15)).await;
    token.cancel();
    let report = run.await.unwrap();

    // Suspicious endpoints sit out the quarantine, so no further failures pile up
    assert_eq!(h.health.status(EndpointId(0)), Some(EndpointStatus::Suspicious));
    assert_eq!(h.health.status(EndpointId(1)), Some(EndpointStatus::Healthy));
    assert_eq!(report.errors_of(ErrorClass::Transport), 3);
    assert!(report.success > 0);
    assert!(h.chain.submissions().iter().all(|s| s.endpoint == Some(EndpointId(1))));
}

#[test]
fn shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/config.toml");
    let config = tempo_dispatch::DispatchConfig::from_path(path).unwrap();

    assert_eq!(config.health.quarantine_hours, 24);
    assert_eq!(config.resolve_endpoints().unwrap().len(), 1);
    assert!(tempo_dispatch::TaskRegistry::new(
        tempo_dispatch::tasks::default_tasks(),
        &config.weights
    )
    .is_ok());
}
