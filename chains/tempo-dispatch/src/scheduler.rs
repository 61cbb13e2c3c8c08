//! Worker loop driving the whole engine.
//!
//! Every worker cycles `Idle -> Selecting -> Acquiring -> Executing ->
//! Recording -> Idle` until the shutdown token fires. A worker never exits on
//! a task error: pool exhaustion and endpoint outages put it into exponential
//! backoff, everything else is recorded and the loop moves on.

use crate::config::DispatchConfig;
use crate::dispatcher::ParallelDispatcher;
use crate::error::{DispatchError, ErrorClass, classify_error, is_hard_transport_failure};
use crate::health::FailureKind;
use crate::metrics::MetricsSink;
use crate::pool::{ClientLease, ResourcePool};
use crate::rpc::Endpoint;
use crate::tasks::{TaskContext, TaskRegistry, TempoTask};
use crate::types::{EndpointId, Outcome, Owner};
use core_logic::TASK_RESULT_TARGET;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Timing knobs of the worker loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    /// Jittered idle sleep between two scheduling slots
    pub interval_min: Duration,
    pub interval_max: Duration,
    pub task_timeout: Duration,
    /// Backoff after `PoolExhausted` / `EndpointUnavailable`, doubled per miss
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Permits shared by all workers, see [`CostClass`](crate::tasks::CostClass)
    pub admission_capacity: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            worker_count: config.worker_count as usize,
            interval_min: Duration::from_millis(config.task_interval_min),
            interval_max: Duration::from_millis(config.task_interval_max),
            task_timeout: config.task_timeout(),
            backoff_min: Duration::from_millis(config.backoff_min_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            admission_capacity: config.admission_capacity.max(1),
        }
    }

    fn jitter(&self) -> Duration {
        let min = self.interval_min.as_millis() as u64;
        let max = (self.interval_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.backoff_max)
    }
}

/// Totals over every worker, returned when the scheduler stops.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerReport {
    pub success: u64,
    pub failed: u64,
    /// Immediate re-attempts after a rejected sequence
    pub retries: u64,
    /// Slots skipped because no owner or endpoint was available
    pub backoffs: u64,
    pub errors: HashMap<ErrorClass, u64>,
}

impl SchedulerReport {
    pub fn attempts(&self) -> u64 {
        self.success + self.failed
    }

    pub fn errors_of(&self, class: ErrorClass) -> u64 {
        self.errors.get(&class).copied().unwrap_or(0)
    }

    fn count_error(&mut self, class: ErrorClass) {
        *self.errors.entry(class).or_insert(0) += 1;
    }

    fn merge(&mut self, other: SchedulerReport) {
        self.success += other.success;
        self.failed += other.failed;
        self.retries += other.retries;
        self.backoffs += other.backoffs;
        for (class, count) in other.errors {
            *self.errors.entry(class).or_insert(0) += count;
        }
    }
}

/// Result of one `run` under the task timeout.
struct Attempt {
    outcome: Outcome,
    /// Original error, kept so a typed `SequenceRejected` can name its lane
    error: Option<anyhow::Error>,
}

impl Attempt {
    /// Only a typed error out of `run` is retried. An `Ok` failure has
    /// already settled part of its work (a partial burst), so running the
    /// task again would resubmit the lanes that landed.
    fn is_retryable(&self) -> bool {
        self.error.is_some() && self.outcome.error == Some(ErrorClass::SequenceRejected)
    }
}

pub struct TaskScheduler {
    settings: SchedulerSettings,
    registry: TaskRegistry,
    pool: Arc<ResourcePool>,
    dispatcher: Arc<ParallelDispatcher>,
    metrics: Arc<dyn MetricsSink>,
    admission: Arc<Semaphore>,
}

impl TaskScheduler {
    /// Fails when no task is left enabled after applying `weights`.
    pub fn new(
        settings: SchedulerSettings,
        tasks: Vec<Arc<dyn TempoTask>>,
        weights: &HashMap<String, u32>,
        pool: Arc<ResourcePool>,
        dispatcher: Arc<ParallelDispatcher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, DispatchError> {
        let registry = TaskRegistry::new(tasks, weights)?;
        info!("Registered tasks: {:?}", registry);
        let admission = Arc::new(Semaphore::new(settings.admission_capacity));

        Ok(Self {
            settings,
            registry,
            pool,
            dispatcher,
            metrics,
            admission,
        })
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Runs `worker_count` workers until `token` is cancelled.
    ///
    /// Workers finish the task they are executing before exiting; a cancelled
    /// token only interrupts waits (lease, backoff, idle sleep).
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> SchedulerReport {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.settings.worker_count {
            let span = info_span!("worker", worker = format!("{:03}", worker_id));
            workers.spawn(
                self.clone()
                    .worker_loop(worker_id, token.clone())
                    .instrument(span),
            );
        }
        info!(
            target: TASK_RESULT_TARGET,
            "Started {} workers over {} owners",
            self.settings.worker_count,
            self.pool.total_count()
        );

        let mut report = SchedulerReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_report) => report.merge(worker_report),
                Err(e) => error!("Worker crashed: {}", e),
            }
        }
        report
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        token: CancellationToken,
    ) -> SchedulerReport {
        let mut report = SchedulerReport::default();
        let mut backoff = self.settings.backoff_min;

        while !token.is_cancelled() {
            let task = {
                let mut rng = rand::thread_rng();
                self.registry.select(&mut rng).clone()
            };

            let acquired = tokio::select! {
                _ = token.cancelled() => break,
                acquired = self.acquire() => acquired,
            };
            let (lease, endpoint) = match acquired {
                Ok(acquired) => acquired,
                Err(e) => {
                    let class = e.class();
                    report.backoffs += 1;
                    report.count_error(class);
                    self.record_metrics(
                        task.name(),
                        &Outcome::failure(e.to_string(), class),
                        None,
                        Duration::ZERO,
                    );
                    info!(
                        target: TASK_RESULT_TARGET,
                        "[WK:{:03}] BACKOFF {} | {} (sleeping {}ms)",
                        worker_id,
                        task.name(),
                        e,
                        backoff.as_millis()
                    );
                    if !idle(backoff, &token).await {
                        break;
                    }
                    backoff = self.settings.next_backoff(backoff);
                    continue;
                }
            };
            backoff = self.settings.backoff_min;

            let started = Instant::now();
            let attempt = self
                .execute_slot(task.as_ref(), &lease, endpoint, worker_id, &mut report)
                .await;
            let elapsed = started.elapsed();

            self.record_health(lease.endpoint, &attempt.outcome);
            self.record_metrics(task.name(), &attempt.outcome, Some(lease.endpoint), elapsed);
            log_outcome(worker_id, &lease, task.name(), &attempt.outcome, elapsed);

            if attempt.outcome.success {
                report.success += 1;
            } else {
                report.failed += 1;
                if let Some(class) = attempt.outcome.error {
                    report.count_error(class);
                }
            }
            drop(lease);

            if !idle(self.settings.jitter(), &token).await {
                break;
            }
        }

        debug!("Worker {:03} stopped", worker_id);
        report
    }

    async fn acquire(&self) -> Result<(ClientLease, Endpoint), DispatchError> {
        let lease = self.pool.lease(None).await?;
        let endpoint = self
            .pool
            .health()
            .endpoint(lease.endpoint)
            .cloned()
            .ok_or(DispatchError::EndpointUnavailable)?;
        Ok((lease, endpoint))
    }

    /// Admission, execution and the one-shot retry after a rejected sequence.
    async fn execute_slot(
        &self,
        task: &dyn TempoTask,
        lease: &ClientLease,
        endpoint: Endpoint,
        worker_id: usize,
        report: &mut SchedulerReport,
    ) -> Attempt {
        let permits = task.cost().permits().min(self.settings.admission_capacity as u32);
        let _admitted = match self.admission.clone().acquire_many_owned(permits).await {
            Ok(permit) => permit,
            Err(_) => {
                return Attempt {
                    outcome: Outcome::failure("admission closed", ErrorClass::TaskLogic),
                    error: None,
                };
            }
        };

        let ctx = TaskContext::new(
            lease.client().clone(),
            endpoint,
            self.dispatcher.clone(),
            worker_id,
            self.settings.task_timeout,
        );

        let mut attempt = self.execute(task, &ctx).await;
        if attempt.is_retryable() {
            self.invalidate_rejected(&attempt, lease.owner).await;
            report.retries += 1;
            info!(
                target: TASK_RESULT_TARGET,
                "[WK:{:03}][WL:{:03}][EP:{}] RETRY {} | {}",
                worker_id,
                lease.owner_index(),
                lease.endpoint,
                task.name(),
                attempt.outcome.message
            );
            attempt = self.execute(task, &ctx).await;
            if attempt.is_retryable() {
                self.invalidate_rejected(&attempt, lease.owner).await;
            }
        }

        if attempt.outcome.error == Some(ErrorClass::Timeout) {
            // The abandoned future may or may not have consumed its sequences
            self.dispatcher.sequences().invalidate_owner(lease.owner).await;
        }
        attempt
    }

    async fn execute(&self, task: &dyn TempoTask, ctx: &TaskContext) -> Attempt {
        match tokio::time::timeout(self.settings.task_timeout, task.run(ctx)).await {
            Ok(Ok(outcome)) => Attempt {
                outcome,
                error: None,
            },
            Ok(Err(e)) => {
                let class = classify_error(&e);
                Attempt {
                    outcome: Outcome::failure(format!("{:#}", e), class),
                    error: Some(e),
                }
            }
            Err(_) => {
                let timeout = DispatchError::Timeout {
                    timeout_ms: self.settings.task_timeout.as_millis() as u64,
                };
                Attempt {
                    outcome: Outcome::failure(timeout.to_string(), ErrorClass::Timeout),
                    error: None,
                }
            }
        }
    }

    /// Drops the rejected lane, or every lane of the owner when the task did
    /// not surface which one.
    async fn invalidate_rejected(&self, attempt: &Attempt, owner: Owner) {
        let sequences = self.dispatcher.sequences();
        let rejected = attempt.error.as_ref().and_then(|e| {
            e.chain().find_map(|cause| match cause.downcast_ref::<DispatchError>() {
                Some(DispatchError::SequenceRejected { owner, lane, .. }) => {
                    Some((*owner, *lane))
                }
                _ => None,
            })
        });

        match rejected {
            Some((owner, lane)) => sequences.invalidate(owner, lane).await,
            None => sequences.invalidate_owner(owner).await,
        }
    }

    fn record_health(&self, endpoint: EndpointId, outcome: &Outcome) {
        let health = self.pool.health();
        match outcome.error {
            None if outcome.success => health.record_success(endpoint),
            Some(ErrorClass::Transport) => {
                let kind = if is_hard_transport_failure(&outcome.message) {
                    FailureKind::Hard
                } else {
                    FailureKind::Soft
                };
                health.record_failure(endpoint, kind);
            }
            Some(ErrorClass::Timeout) => health.record_failure(endpoint, FailureKind::Soft),
            // Business failures came back through a working route
            _ => {}
        }
    }

    fn record_metrics(
        &self,
        task: &str,
        outcome: &Outcome,
        endpoint: Option<EndpointId>,
        duration: Duration,
    ) {
        if let Err(e) = self.metrics.record(task, outcome, endpoint, duration) {
            warn!("Failed to record metrics for {}: {:#}", task, e);
        }
    }
}

/// Sleeps for `duration`; `false` when shutdown interrupted the sleep.
async fn idle(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn log_outcome(
    worker_id: usize,
    lease: &ClientLease,
    task: &str,
    outcome: &Outcome,
    elapsed: Duration,
) {
    if outcome.success {
        info!(
            target: TASK_RESULT_TARGET,
            "[WK:{:03}][WL:{:03}][EP:{}] SUCCESS {} | {} t:{:.1}s",
            worker_id,
            lease.owner_index(),
            lease.endpoint,
            task,
            outcome.message,
            elapsed.as_secs_f32()
        );
    } else {
        info!(
            target: TASK_RESULT_TARGET,
            "[WK:{:03}][WL:{:03}][EP:{}] FAILED {} | {} [{}] t:{:.1}s",
            worker_id,
            lease.owner_index(),
            lease.endpoint,
            task,
            outcome.message,
            outcome.error.map_or("unclassified", |c| c.as_str()),
            elapsed.as_secs_f32()
        );
    }
}
