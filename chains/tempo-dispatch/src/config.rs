//! Configuration loader for tempo-dispatch
//!
//! Everything operational lives here: worker count, timing bounds, health
//! thresholds, lane settings and per-task weights. Thresholds are tuned
//! values, not invariants, so all of them have defaults and can be
//! overridden from TOML.

use crate::rpc::Endpoint;
use crate::signer::PATH_USD;
use crate::types::{EndpointId, Lane};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use core_logic::{ConfigError, EndpointConfig, load_proxies};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for the dispatch engine
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// RPC endpoint URL, used by endpoints that don't set their own
    pub rpc_url: String,
    /// Chain ID (42431 for Tempo testnet), bound into every signature
    pub chain_id: u64,
    /// Number of concurrent workers
    pub worker_count: u64,
    /// Owners created by the simulator
    #[serde(default = "default_owner_count")]
    pub owner_count: usize,
    /// Minimum task interval in milliseconds
    pub task_interval_min: u64,
    /// Maximum task interval in milliseconds
    pub task_interval_max: u64,
    /// Task timeout in seconds
    pub task_timeout: u64,
    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Backoff bounds when no owner or endpoint is available
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Admission permits shared by all workers; heavy tasks take more
    #[serde(default = "default_admission_capacity")]
    pub admission_capacity: usize,
    /// Optional `ip:port[:user:pass]` file, one endpoint per proxy
    #[serde(default)]
    pub proxies_file: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Task name -> weight override. 0 disables a task.
    #[serde(default)]
    pub weights: HashMap<String, u32>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub dispatch: ParallelConfig,
    #[serde(default)]
    pub signing: SigningConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long `lease` waits for a free owner before `PoolExhausted`
    pub max_wait_ms: u64,
    /// Delay before a released owner can be leased again
    pub release_cooldown_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 5_000,
            release_cooldown_ms: 0,
        }
    }
}

impl PoolConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn release_cooldown(&self) -> Duration {
        Duration::from_millis(self.release_cooldown_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before Healthy -> Suspicious
    pub suspicious_after: u32,
    /// Further consecutive failures before Suspicious -> Banned
    pub ban_after: u32,
    /// Time a Suspicious endpoint sits out before it is eligible again
    pub quarantine_hours: u64,
    /// Chance that a success on a Suspicious endpoint redeems it right away
    pub redemption_probability: f64,
    /// Period of the banned-endpoint probe, 0 disables it
    pub recheck_interval_minutes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            suspicious_after: 3,
            ban_after: 3,
            quarantine_hours: 24,
            redemption_probability: 1.0,
            recheck_interval_minutes: 10,
        }
    }
}

impl HealthConfig {
    pub fn quarantine(&self) -> Duration {
        Duration::from_secs(self.quarantine_hours.saturating_mul(3600))
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_interval_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub authorization_poll_ms: u64,
    pub authorization_max_polls: u32,
    /// Retries of a remote sequence read on transient transport errors
    pub read_retries: u32,
    pub read_retry_delay_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            authorization_poll_ms: 500,
            authorization_max_polls: 60,
            read_retries: 3,
            read_retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// First lane used by a parallel batch when the caller doesn't pick one
    pub default_start_lane: Lane,
    /// Wait for a receipt before reporting a submission as successful
    pub await_finality: bool,
    pub finality_poll_ms: u64,
    pub finality_max_polls: u32,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            default_start_lane: 1,
            await_finality: false,
            finality_poll_ms: 500,
            finality_max_polls: 60,
        }
    }
}

/// Fixed fee fields of locally signed transactions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub gas_limit: u64,
    /// Wei
    pub max_fee_per_gas: u64,
    pub max_priority_fee_per_gas: u64,
    /// Token paying the fee; `None` leaves the choice to the node
    pub fee_token: Option<Address>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            gas_limit: 500_000,
            max_fee_per_gas: 150_000_000_000,
            max_priority_fee_per_gas: 1_500_000_000,
            fee_token: Some(PATH_USD),
        }
    }
}

fn default_owner_count() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    10
}

fn default_backoff_min_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_admission_capacity() -> usize {
    500
}

impl DispatchConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```ignore
    /// let config = DispatchConfig::from_path("config/config.toml")?;
    /// ```
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks. Anything rejected here would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be > 0"));
        }
        if self.owner_count == 0 {
            return Err(ConfigError::invalid("owner_count", "must be > 0"));
        }
        if self.task_interval_min > self.task_interval_max {
            return Err(ConfigError::invalid(
                "task_interval_min",
                "must not exceed task_interval_max",
            ));
        }
        if self.backoff_min_ms == 0 || self.backoff_min_ms > self.backoff_max_ms {
            return Err(ConfigError::invalid(
                "backoff_min_ms",
                "must be > 0 and not exceed backoff_max_ms",
            ));
        }
        if self.task_timeout == 0 {
            return Err(ConfigError::invalid("task_timeout", "must be > 0"));
        }
        if self.admission_capacity == 0 {
            return Err(ConfigError::invalid("admission_capacity", "must be > 0"));
        }
        if self.health.suspicious_after == 0 || self.health.ban_after == 0 {
            return Err(ConfigError::invalid(
                "health",
                "suspicious_after and ban_after must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.health.redemption_probability) {
            return Err(ConfigError::invalid(
                "health.redemption_probability",
                "must be within 0.0..=1.0",
            ));
        }
        if self.signing.max_priority_fee_per_gas > self.signing.max_fee_per_gas {
            return Err(ConfigError::invalid(
                "signing.max_priority_fee_per_gas",
                "must not exceed max_fee_per_gas",
            ));
        }
        if self.dispatch.default_start_lane == 0 {
            return Err(ConfigError::invalid(
                "dispatch.default_start_lane",
                "lane 0 is the sequential lane",
            ));
        }
        Ok(())
    }

    /// Resolves `[[endpoints]]` plus the proxies file into the endpoint list.
    ///
    /// With neither configured, a single direct endpoint on `rpc_url` is used.
    pub fn resolve_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        let mut configs = self.endpoints.clone();

        if let Some(file) = &self.proxies_file {
            for (idx, proxy) in load_proxies(file)?.into_iter().enumerate() {
                configs.push(EndpointConfig {
                    id: format!("proxy-{:03}", idx),
                    rpc_url: None,
                    proxy: Some(proxy),
                });
            }
        }

        if configs.is_empty() {
            configs.push(EndpointConfig {
                id: "direct".to_string(),
                rpc_url: None,
                proxy: None,
            });
        }

        configs
            .into_iter()
            .enumerate()
            .map(|(idx, cfg)| {
                let rpc_url = cfg.rpc_url.unwrap_or_else(|| self.rpc_url.clone());
                if rpc_url.is_empty() {
                    return Err(ConfigError::MissingField {
                        field: format!("rpc_url for endpoint {}", cfg.id),
                    });
                }
                Ok(Endpoint {
                    id: EndpointId(idx),
                    name: cfg.id,
                    rpc_url,
                    proxy: cfg.proxy,
                })
            })
            .collect()
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}
