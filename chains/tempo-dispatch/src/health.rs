//! Endpoint Health - recoverable ban state machine for proxies / RPC routes
//!
//! Each endpoint moves through `Healthy -> Suspicious -> Banned`:
//!
//! 1. **Healthy**: selectable. Consecutive soft failures are counted.
//! 2. **Suspicious**: reached after `suspicious_after` failures. Excluded from
//!    selection until the quarantine window since the transition has passed,
//!    then it is promoted back lazily on the next selection.
//! 3. **Banned**: reached after `ban_after` further failures, or at once on a
//!    hard failure (proxy tunnel / auth errors). Never selected. Leaves only
//!    through [`EndpointHealthTracker::restore`], either manually or from the
//!    background re-check.
//!
//! State is kept per endpoint behind its own mutex; there is no global lock.
//! Timestamps use `tokio::time::Instant` so paused-clock tests can move time.

use crate::config::HealthConfig;
use crate::error::DispatchError;
use crate::rpc::{Endpoint, TransportFactory};
use crate::types::{EndpointId, PROTOCOL_LANE};
use alloy_primitives::Address;
use core_logic::ConfigError;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointStatus {
    Healthy,
    Suspicious,
    Banned,
}

/// How strongly a failure counts against an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout or generic transport error: counted.
    Soft,
    /// Proxy is unusable (tunnel refused, bad credentials): ban now.
    Hard,
}

#[derive(Debug)]
struct EndpointState {
    status: EndpointStatus,
    consecutive_failures: u32,
    last_transition: Instant,
    last_used: Option<Instant>,
    last_seen: Option<Instant>,
}

impl EndpointState {
    fn transition(&mut self, to: EndpointStatus, now: Instant) {
        self.status = to;
        self.consecutive_failures = 0;
        self.last_transition = now;
    }
}

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub id: EndpointId,
    pub name: String,
    pub status: EndpointStatus,
    pub consecutive_failures: u32,
    /// Seconds since the last successful call, if any
    pub last_seen_secs: Option<u64>,
}

pub struct EndpointHealthTracker {
    endpoints: Vec<Endpoint>,
    states: Vec<Mutex<EndpointState>>,
    config: HealthConfig,
}

impl EndpointHealthTracker {
    pub fn new(endpoints: Vec<Endpoint>, config: HealthConfig) -> Result<Self, DispatchError> {
        if endpoints.is_empty() {
            return Err(ConfigError::MissingField {
                field: "endpoints".to_string(),
            }
            .into());
        }

        let now = Instant::now();
        let states = endpoints
            .iter()
            .map(|_| {
                Mutex::new(EndpointState {
                    status: EndpointStatus::Healthy,
                    consecutive_failures: 0,
                    last_transition: now,
                    last_used: None,
                    last_seen: None,
                })
            })
            .collect();

        Ok(Self {
            endpoints,
            states,
            config,
        })
    }

    fn state(&self, id: EndpointId) -> Option<MutexGuard<'_, EndpointState>> {
        self.states
            .get(id.0)
            .map(|m| m.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(id.0)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Least-recently-used selectable endpoint not in `excluded`.
    ///
    /// Banned endpoints are never returned. Suspicious ones are returned only
    /// once their quarantine window has passed, at which point they are
    /// promoted back to Healthy.
    pub fn select_endpoint(&self, excluded: &HashSet<EndpointId>) -> Option<EndpointId> {
        let now = Instant::now();
        let mut lost = HashSet::new();

        loop {
            let id = self.least_recently_used(excluded, &lost, now)?;
            if self.claim(id, now) {
                return Some(id);
            }
            // Failed between the scan and the claim
            debug!(endpoint = %id, "Endpoint left rotation during selection");
            lost.insert(id);
        }
    }

    fn least_recently_used(
        &self,
        excluded: &HashSet<EndpointId>,
        lost: &HashSet<EndpointId>,
        now: Instant,
    ) -> Option<EndpointId> {
        let quarantine = self.config.quarantine();
        let mut best: Option<(EndpointId, Option<Instant>)> = None;

        for endpoint in &self.endpoints {
            if excluded.contains(&endpoint.id) || lost.contains(&endpoint.id) {
                continue;
            }
            let Some(mut state) = self.state(endpoint.id) else {
                continue;
            };

            if state.status == EndpointStatus::Suspicious
                && now.duration_since(state.last_transition) >= quarantine
            {
                state.transition(EndpointStatus::Healthy, now);
                info!(endpoint = %endpoint.id, "Quarantine over, endpoint back in rotation");
            }
            if state.status != EndpointStatus::Healthy {
                continue;
            }

            // Never-used endpoints sort first
            let better = match &best {
                None => true,
                Some((_, best_used)) => match (state.last_used, best_used) {
                    (None, Some(_)) => true,
                    (Some(used), Some(best_used)) => used < *best_used,
                    _ => false,
                },
            };
            if better {
                best = Some((endpoint.id, state.last_used));
            }
        }

        best.map(|(id, _)| id)
    }

    /// Marks `id` used if it is still Healthy under its lock.
    fn claim(&self, id: EndpointId, now: Instant) -> bool {
        match self.state(id) {
            Some(mut state) if state.status == EndpointStatus::Healthy => {
                state.last_used = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn record_success(&self, id: EndpointId) {
        let Some(mut state) = self.state(id) else {
            return;
        };
        let now = Instant::now();
        state.consecutive_failures = 0;
        state.last_seen = Some(now);

        if state.status == EndpointStatus::Suspicious
            && fastrand::f64() < self.config.redemption_probability
        {
            state.transition(EndpointStatus::Healthy, now);
            info!(endpoint = %id, "Endpoint redeemed after success");
        }
    }

    pub fn record_failure(&self, id: EndpointId, kind: FailureKind) {
        let Some(mut state) = self.state(id) else {
            return;
        };
        let now = Instant::now();

        if kind == FailureKind::Hard {
            if state.status != EndpointStatus::Banned {
                state.transition(EndpointStatus::Banned, now);
                warn!(endpoint = %id, "Endpoint banned after hard failure");
            }
            return;
        }

        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;
        match state.status {
            EndpointStatus::Healthy if failures >= self.config.suspicious_after => {
                state.transition(EndpointStatus::Suspicious, now);
                warn!(endpoint = %id, "Endpoint suspicious, quarantined");
            }
            EndpointStatus::Suspicious if failures >= self.config.ban_after => {
                state.transition(EndpointStatus::Banned, now);
                warn!(endpoint = %id, "Endpoint banned");
            }
            _ => debug!(endpoint = %id, failures, "Endpoint failure"),
        }
    }

    /// Puts an endpoint back to Healthy with a clean record.
    pub fn restore(&self, id: EndpointId) {
        if let Some(mut state) = self.state(id) {
            let previous = state.status;
            state.transition(EndpointStatus::Healthy, Instant::now());
            if previous != EndpointStatus::Healthy {
                info!(endpoint = %id, ?previous, "Endpoint restored");
            }
        }
    }

    pub fn status(&self, id: EndpointId) -> Option<EndpointStatus> {
        self.state(id).map(|s| s.status)
    }

    pub fn banned(&self) -> Vec<EndpointId> {
        self.endpoints
            .iter()
            .map(|e| e.id)
            .filter(|id| self.status(*id) == Some(EndpointStatus::Banned))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<EndpointHealth> {
        let now = Instant::now();
        self.endpoints
            .iter()
            .filter_map(|endpoint| {
                let state = self.state(endpoint.id)?;
                Some(EndpointHealth {
                    id: endpoint.id,
                    name: endpoint.name.clone(),
                    status: state.status,
                    consecutive_failures: state.consecutive_failures,
                    last_seen_secs: state.last_seen.map(|t| now.duration_since(t).as_secs()),
                })
            })
            .collect()
    }

    /// Probes banned endpoints once; restores the ones that answer.
    pub async fn recheck_banned(&self, factory: &dyn TransportFactory) -> usize {
        let banned = self.banned();
        if banned.is_empty() {
            debug!("⏱️ No banned endpoints to re-check");
            return 0;
        }

        info!("⏱️ Re-checking {} banned endpoints...", banned.len());
        let mut restored = 0;
        for id in banned {
            let Some(endpoint) = self.endpoint(id) else {
                continue;
            };
            let healthy = match factory.connect(endpoint) {
                Ok(rpc) => rpc.sequence(Address::ZERO, PROTOCOL_LANE).await.is_ok(),
                Err(_) => false,
            };
            if healthy {
                self.restore(id);
                restored += 1;
            }
        }

        if restored > 0 {
            info!("✅ Restored {} recovered endpoints", restored);
        }
        restored
    }

    /// Background re-check of banned endpoints every `recheck_interval_minutes`.
    ///
    /// Returns `None` when the interval is 0.
    pub fn spawn_recheck(
        self: &Arc<Self>,
        factory: Arc<dyn TransportFactory>,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.config.recheck_interval_minutes == 0 {
            return None;
        }
        let period = self.config.recheck_interval();
        let tracker = self.clone();

        // `sleep` clamps far-future deadlines, so a huge period just never fires
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        tracker.recheck_banned(factory.as_ref()).await;
                    }
                }
            }
        }))
    }
}
