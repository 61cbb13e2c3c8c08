//! Resource Pool - owner leasing with scoped release
//!
//! The pool hands out at most one [`ClientLease`] per owner. A lease binds
//! the owner's signer to a transport for an endpoint picked by the
//! [`EndpointHealthTracker`], and gives the owner back when dropped, on every
//! exit path (return, `?`, panic unwinding, future cancellation).
//!
//! # Lifecycle
//!
//! 1. **Acquisition**: [`ResourcePool::lease`] takes the owner that has been
//!    idle longest (or the hinted one, when it is free).
//! 2. **Waiting**: when every owner is leased or cooling down, the caller
//!    parks on a [`Notify`] until a release or the wait deadline.
//! 3. **Binding**: a healthy endpoint is selected and the owner's cached
//!    client is rebound to it if the endpoint changed.
//! 4. **Release**: dropping the lease returns the owner, ready again after
//!    `release_cooldown_ms`.

use crate::config::PoolConfig;
use crate::error::DispatchError;
use crate::health::EndpointHealthTracker;
use crate::rpc::{Endpoint, RemoteRpc, Signer, TransportFactory};
use crate::types::{EndpointId, Owner};
use core_logic::ConfigError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// An owner bound to a transport.
#[derive(Clone)]
pub struct Client {
    pub owner: Owner,
    pub signer: Arc<dyn Signer>,
    pub endpoint: EndpointId,
    pub rpc: Arc<dyn RemoteRpc>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("owner", &self.owner)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

struct IdleSlot {
    index: usize,
    ready_at: Instant,
}

struct PoolState {
    /// Free owners, oldest release first.
    idle: VecDeque<IdleSlot>,
    leased: HashSet<usize>,
    clients: Vec<Option<Client>>,
}

pub struct ResourcePool {
    signers: Vec<Arc<dyn Signer>>,
    health: Arc<EndpointHealthTracker>,
    factory: Arc<dyn TransportFactory>,
    transports: Mutex<HashMap<EndpointId, Arc<dyn RemoteRpc>>>,
    state: Mutex<PoolState>,
    released: Notify,
    config: PoolConfig,
}

impl ResourcePool {
    pub fn new(
        signers: Vec<Arc<dyn Signer>>,
        health: Arc<EndpointHealthTracker>,
        factory: Arc<dyn TransportFactory>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, DispatchError> {
        if signers.is_empty() {
            return Err(ConfigError::MissingField {
                field: "owners".to_string(),
            }
            .into());
        }

        let now = Instant::now();
        let state = PoolState {
            idle: (0..signers.len())
                .map(|index| IdleSlot {
                    index,
                    ready_at: now,
                })
                .collect(),
            leased: HashSet::new(),
            clients: vec![None; signers.len()],
        };

        Ok(Arc::new(Self {
            signers,
            health,
            factory,
            transports: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            released: Notify::new(),
            config,
        }))
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn health(&self) -> &Arc<EndpointHealthTracker> {
        &self.health
    }

    pub fn owners(&self) -> Vec<Owner> {
        self.signers.iter().map(|s| s.address()).collect()
    }

    /// Leases an owner, waiting up to `max_wait_ms` for one to free up.
    ///
    /// Fails with [`DispatchError::PoolExhausted`] after the wait, or with
    /// [`DispatchError::EndpointUnavailable`] when no endpoint is selectable
    /// (the owner goes straight back to the pool in that case).
    pub async fn lease(
        self: &Arc<Self>,
        owner_hint: Option<Owner>,
    ) -> Result<ClientLease, DispatchError> {
        let started = Instant::now();
        let deadline = started + self.config.max_wait();

        let index = loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before looking at the state so a release in between is not lost
            notified.as_mut().enable();

            let now = Instant::now();
            let next_ready = match self.take_ready(owner_hint, now) {
                Ok(index) => break index,
                Err(next_ready) => next_ready,
            };

            if now >= deadline {
                return Err(DispatchError::PoolExhausted {
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }

            let wake_at = next_ready.map_or(deadline, |t| t.min(deadline));
            trace!("All owners busy, waiting");
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        };

        // Nothing below awaits, so the owner cannot leak on cancellation
        let Some(endpoint) = self.health.select_endpoint(&HashSet::new()) else {
            self.put_back(index);
            return Err(DispatchError::EndpointUnavailable);
        };

        match self.bind(index, endpoint) {
            Ok(client) => {
                debug!(owner = %client.owner, %endpoint, "Owner leased");
                Ok(ClientLease {
                    pool: self.clone(),
                    index,
                    client,
                })
            }
            Err(e) => {
                self.put_back(index);
                Err(e)
            }
        }
    }

    /// Takes a ready owner, or returns when the next one will be ready.
    fn take_ready(&self, hint: Option<Owner>, now: Instant) -> Result<usize, Option<Instant>> {
        let mut state = self.state();

        let hinted = hint.and_then(|owner| {
            state.idle.iter().position(|slot| {
                slot.ready_at <= now && self.signers[slot.index].address() == owner
            })
        });
        let position = hinted.or_else(|| state.idle.iter().position(|slot| slot.ready_at <= now));

        match position.and_then(|pos| state.idle.remove(pos)) {
            Some(slot) => {
                state.leased.insert(slot.index);
                Ok(slot.index)
            }
            None => Err(state.idle.iter().map(|slot| slot.ready_at).min()),
        }
    }

    fn bind(&self, index: usize, endpoint: EndpointId) -> Result<Client, DispatchError> {
        let mut state = self.state();
        if let Some(client) = &state.clients[index] {
            if client.endpoint == endpoint {
                return Ok(client.clone());
            }
        }

        let client = Client {
            owner: self.signers[index].address(),
            signer: self.signers[index].clone(),
            endpoint,
            rpc: self.transport(endpoint)?,
        };
        state.clients[index] = Some(client.clone());
        Ok(client)
    }

    fn transport(&self, id: EndpointId) -> Result<Arc<dyn RemoteRpc>, DispatchError> {
        let mut transports = self.transports.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(rpc) = transports.get(&id) {
            return Ok(rpc.clone());
        }
        let endpoint: &Endpoint = self
            .health
            .endpoint(id)
            .ok_or(DispatchError::EndpointUnavailable)?;
        let rpc = self.factory.connect(endpoint)?;
        transports.insert(id, rpc.clone());
        Ok(rpc)
    }

    /// Returns an owner that never got used, without cooldown.
    fn put_back(&self, index: usize) {
        {
            let mut state = self.state();
            state.leased.remove(&index);
            state.idle.push_front(IdleSlot {
                index,
                ready_at: Instant::now(),
            });
        }
        self.released.notify_waiters();
    }

    fn release(&self, index: usize) {
        {
            let mut state = self.state();
            if !state.leased.remove(&index) {
                return;
            }
            state.idle.push_back(IdleSlot {
                index,
                ready_at: Instant::now() + self.config.release_cooldown(),
            });
        }
        self.released.notify_waiters();
    }

    /// Owners free and past their cooldown.
    pub fn available_count(&self) -> usize {
        let now = Instant::now();
        self.state()
            .idle
            .iter()
            .filter(|slot| slot.ready_at <= now)
            .count()
    }

    pub fn leased_count(&self) -> usize {
        self.state().leased.len()
    }

    pub fn total_count(&self) -> usize {
        self.signers.len()
    }
}

/// Exclusive use of one owner. Released on drop.
pub struct ClientLease {
    pool: Arc<ResourcePool>,
    index: usize,
    client: Client,
}

impl ClientLease {
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Position of the owner in the pool, for log lines.
    pub fn owner_index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease")
            .field("index", &self.index)
            .field("client", &self.client)
            .finish()
    }
}

impl Deref for ClientLease {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
