//! Tasks Module - Task trait, execution context and registry
//!
//! Tasks are the unit of work picked by the scheduler. Each one implements
//! [`TempoTask`] and gets a [`TaskContext`] holding the leased client, the
//! endpoint it is bound to, and handles for sequences and parallel dispatch.
//!
//! ## Task Lifecycle
//!
//! 1. **Registration**: tasks are collected into a [`TaskRegistry`] at startup
//! 2. **Selection**: a worker draws one by weight
//! 3. **Admission**: the worker takes `cost().permits()` admission permits
//! 4. **Execution**: `run()` is called under the task timeout
//! 5. **Result**: the returned [`Outcome`] (or classified error) is recorded
//!
//! # Creating a New Task
//!
//! ```ignore
//! use async_trait::async_trait;
//! use tempo_dispatch::tasks::{TaskContext, TempoTask};
//! use tempo_dispatch::Outcome;
//! use anyhow::Result;
//!
//! #[derive(Debug, Clone, Default)]
//! pub struct MyTask;
//!
//! #[async_trait]
//! impl TempoTask for MyTask {
//!     fn name(&self) -> &'static str {
//!         "my_task"
//!     }
//!
//!     async fn run(&self, ctx: &TaskContext) -> Result<Outcome> {
//!         let op = tempo_dispatch::Operation::transfer(ctx.address(), Default::default());
//!         Ok(ctx.submit(op).await?)
//!     }
//! }
//! ```

pub mod parallel_burst;
pub mod sequence_probe;
pub mod sequential_transfer;

pub use parallel_burst::ParallelBurstTask;
pub use sequence_probe::SequenceProbeTask;
pub use sequential_transfer::SequentialTransferTask;

use crate::dispatcher::ParallelDispatcher;
use crate::error::DispatchError;
use crate::pool::Client;
use crate::rpc::Endpoint;
use crate::sequence::SequenceAllocator;
use crate::types::{Lane, Operation, Outcome, Owner, PROTOCOL_LANE};
use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use core_logic::ConfigError;
use rand::Rng;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Admission weight of a task. Heavy tasks hold more permits of the shared
/// admission semaphore, so fewer of them run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostClass {
    Light,
    Standard,
    Heavy,
}

impl CostClass {
    pub fn permits(&self) -> u32 {
        match self {
            CostClass::Light => 1,
            CostClass::Standard => 2,
            CostClass::Heavy => 4,
        }
    }
}

#[async_trait]
pub trait TempoTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Relative selection weight, overridable from `[weights]`.
    fn weight(&self) -> u32 {
        1
    }

    fn cost(&self) -> CostClass {
        CostClass::Light
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Outcome>;
}

/// Execution context provided to tasks
///
/// Built per run from the worker's lease. The lease itself stays with the
/// worker, so the owner is exclusive to this task for the whole run.
#[derive(Clone)]
pub struct TaskContext {
    /// Leased owner and its transport
    pub client: Client,
    /// Endpoint the transport goes through
    pub endpoint: Endpoint,
    pub worker_id: usize,
    /// Maximum task execution duration
    pub timeout: Duration,
    dispatcher: Arc<ParallelDispatcher>,
}

impl TaskContext {
    pub fn new(
        client: Client,
        endpoint: Endpoint,
        dispatcher: Arc<ParallelDispatcher>,
        worker_id: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint,
            worker_id,
            timeout,
            dispatcher,
        }
    }

    /// Returns the owner address
    #[inline]
    pub fn address(&self) -> Owner {
        self.client.owner
    }

    pub fn sequences(&self) -> &Arc<SequenceAllocator> {
        self.dispatcher.sequences()
    }

    pub async fn next_sequence(&self, lane: Lane) -> Result<u64, DispatchError> {
        self.sequences()
            .next_sequence(self.client.rpc.as_ref(), self.client.owner, lane)
            .await
    }

    pub async fn peek_sequence(&self, lane: Lane) -> Result<u64, DispatchError> {
        self.sequences()
            .peek_sequence(self.client.rpc.as_ref(), self.client.owner, lane)
            .await
    }

    pub async fn authorize_lane(&self, lane: Lane) -> Result<(), DispatchError> {
        self.sequences()
            .authorize_lane(
                self.client.rpc.as_ref(),
                self.client.signer.as_ref(),
                lane,
            )
            .await
    }

    /// Submits on the sequential lane.
    pub async fn submit(&self, operation: Operation) -> Result<Outcome, DispatchError> {
        self.submit_on_lane(PROTOCOL_LANE, operation).await
    }

    pub async fn submit_on_lane(
        &self,
        lane: Lane,
        operation: Operation,
    ) -> Result<Outcome, DispatchError> {
        self.dispatcher.submit(&self.client, lane, operation).await
    }

    /// One lane per operation, submitted concurrently.
    pub async fn dispatch_parallel(
        &self,
        operations: Vec<Operation>,
        start_lane: Option<Lane>,
    ) -> Vec<Result<Outcome, DispatchError>> {
        self.dispatcher
            .dispatch(&self.client, operations, start_lane)
            .await
    }
}

/// The enabled tasks and their effective weights.
pub struct TaskRegistry {
    tasks: Vec<Arc<dyn TempoTask>>,
    weights: Vec<u32>,
    distribution: WeightedIndex<u32>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.tasks.iter().map(|t| t.name()).zip(&self.weights))
            .finish()
    }
}

impl TaskRegistry {
    /// Applies `overrides` (name -> weight, 0 disables) on top of each
    /// task's own weight. No enabled task is a fatal configuration error.
    pub fn new(
        tasks: Vec<Arc<dyn TempoTask>>,
        overrides: &HashMap<String, u32>,
    ) -> Result<Self, DispatchError> {
        for name in overrides.keys() {
            if !tasks.iter().any(|t| t.name() == name) {
                warn!("Weight configured for unknown task '{}'", name);
            }
        }

        let (tasks, weights): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .map(|task| {
                let weight = overrides
                    .get(task.name())
                    .copied()
                    .unwrap_or_else(|| task.weight());
                (task, weight)
            })
            .filter(|(_, weight)| *weight > 0)
            .unzip();

        if tasks.is_empty() {
            return Err(ConfigError::invalid("weights", "no enabled tasks").into());
        }

        let distribution = WeightedIndex::new(&weights)
            .map_err(|e| DispatchError::from(ConfigError::invalid("weights", e.to_string())))?;

        Ok(Self {
            tasks,
            weights,
            distribution,
        })
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &Arc<dyn TempoTask> {
        &self.tasks[self.distribution.sample(rng)]
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }
}

/// The built-in task set.
pub fn default_tasks() -> Vec<Arc<dyn TempoTask>> {
    let sequential: Arc<dyn TempoTask> = Arc::new(SequentialTransferTask);
    let burst: Arc<dyn TempoTask> = Arc::new(ParallelBurstTask::default());
    let probe: Arc<dyn TempoTask> = Arc::new(SequenceProbeTask);
    vec![sequential, burst, probe]
}

pub fn random_recipient() -> Address {
    Address::from(rand::random::<[u8; 20]>())
}
