//! Tempo Dispatch - concurrent transaction dispatch engine for Tempo-style 2D nonces
//!
//! Keeps many owners busy submitting operations at once without ever reusing a
//! sequence number, and routes every submission through the healthiest
//! endpoint available.
//!
//! # Architecture
//!
//! - **[`SequenceAllocator`]**: per-(owner, lane) sequence cache with lazy
//!   remote seeding, invalidation and lane authorization
//! - **[`ResourcePool`]**: exclusive, drop-released leases of owners
//! - **[`EndpointHealthTracker`]**: `Healthy -> Suspicious -> Banned` per
//!   endpoint with a quarantine-based redemption path
//! - **[`ParallelDispatcher`]**: fans N operations of one owner out over N lanes
//! - **[`TaskScheduler`]**: weighted task selection, timeouts, retries, backoff
//!
//! The remote chain sits behind [`RemoteRpc`]; [`JsonRpcTransport`] talks to a
//! real node, [`SimulatedChain`] is the in-memory stand-in used by tests and
//! the `sim` mode of the `dispatch-sim` binary. [`LocalSigner`] signs Tempo
//! transactions for the `live` mode.
//!
//! # Quick Start
//!
//! ```bash
//! # Simulated run for 30 seconds with 8 workers
//! cargo run -p tempo-dispatch --bin dispatch-sim -- sim --workers 8 --duration 30
//!
//! # Against the configured endpoints, keys from DISPATCH_PRIVATE_KEYS
//! cargo run -p tempo-dispatch --bin dispatch-sim -- live --duration 60
//! ```
//!
//! # Configuration
//!
//! Loaded from `config/config.toml`, see [`DispatchConfig`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod jsonrpc;
pub mod metrics;
pub mod pool;
pub mod rpc;
pub mod scheduler;
pub mod sequence;
pub mod signer;
pub mod sim;
pub mod tasks;
pub mod types;

pub use config::{
    DispatchConfig, HealthConfig, ParallelConfig, PoolConfig, SequenceConfig, SigningConfig,
};
pub use dispatcher::ParallelDispatcher;
pub use error::{DispatchError, ErrorClass, classify_error};
pub use health::{EndpointHealth, EndpointHealthTracker, EndpointStatus, FailureKind};
pub use jsonrpc::{JsonRpcFactory, JsonRpcTransport};
pub use metrics::{MetricsSink, NoopMetrics};
pub use pool::{Client, ClientLease, ResourcePool};
pub use rpc::{Endpoint, RemoteRpc, Signer, TransportFactory};
pub use scheduler::{SchedulerReport, SchedulerSettings, TaskScheduler};
pub use sequence::{AllocationStrategy, SequenceAllocator, SequenceStats};
pub use signer::LocalSigner;
pub use sim::{SimSigner, SimTransportFactory, SimulatedChain};
pub use tasks::{CostClass, TaskContext, TaskRegistry, TempoTask};
pub use types::{EndpointId, Finality, Lane, Operation, Outcome, Owner, PROTOCOL_LANE};
