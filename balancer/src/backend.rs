//! Backend pool: health, capacity and the clients attached to each game server
//!
//! Every backend descriptor sits behind its own lock. Attaching re-checks
//! health and capacity under that lock, so two clients racing for the last
//! slot cannot both win.

use log::debug;
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};

/// Balancer-assigned identifier of one client connection
pub type ClientId = u64;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("no backends configured")]
    NoBackends,
    #[error("unknown backend {0}")]
    UnknownBackend(usize),
    #[error("connecting to {address} timed out")]
    ConnectTimeout { address: String },
    #[error("connecting to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct BackendState {
    healthy: bool,
    capacity: usize,
    /// Eviction signal for each attached client's pipe
    attached: HashMap<ClientId, oneshot::Sender<()>>,
}

/// Point-in-time copy of one backend's descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct BackendView {
    pub index: usize,
    pub address: String,
    pub healthy: bool,
    pub load: usize,
    pub capacity: usize,
}

impl BackendView {
    pub fn has_room(&self) -> bool {
        self.healthy && self.load < self.capacity
    }
}

pub struct BackendPool {
    addresses: Vec<String>,
    backends: Vec<Mutex<BackendState>>,
}

impl BackendPool {
    /// Every backend starts out healthy and empty
    pub fn new(addresses: Vec<String>, capacity: usize) -> Result<Self, BalancerError> {
        if addresses.is_empty() {
            return Err(BalancerError::NoBackends);
        }

        let backends = addresses
            .iter()
            .map(|_| {
                Mutex::new(BackendState {
                    healthy: true,
                    capacity,
                    attached: HashMap::new(),
                })
            })
            .collect();

        Ok(Self {
            addresses,
            backends,
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn address(&self, index: usize) -> Result<&str, BalancerError> {
        self.addresses
            .get(index)
            .map(String::as_str)
            .ok_or(BalancerError::UnknownBackend(index))
    }

    fn backend(&self, index: usize) -> Result<&Mutex<BackendState>, BalancerError> {
        self.backends
            .get(index)
            .ok_or(BalancerError::UnknownBackend(index))
    }

    /// Binds `client` to the backend if it is healthy and has spare capacity
    ///
    /// The returned receiver fires when the backend evicts its clients, and
    /// resolves with an error once the client is detached normally.
    pub async fn try_attach(
        &self,
        index: usize,
        client: ClientId,
    ) -> Result<Option<oneshot::Receiver<()>>, BalancerError> {
        let mut backend = self.backend(index)?.lock().await;
        if !backend.healthy || backend.attached.len() >= backend.capacity {
            return Ok(None);
        }

        let (evict_tx, evict_rx) = oneshot::channel();
        backend.attached.insert(client, evict_tx);
        debug!(
            "Client {} attached to backend {} ({}/{})",
            client,
            index,
            backend.attached.len(),
            backend.capacity
        );
        Ok(Some(evict_rx))
    }

    /// Returns whether the client was still attached
    pub async fn detach(&self, index: usize, client: ClientId) -> Result<bool, BalancerError> {
        let mut backend = self.backend(index)?.lock().await;
        Ok(backend.attached.remove(&client).is_some())
    }

    /// Empties the backend's client set, handing back each eviction signal
    pub async fn drain_attached(
        &self,
        index: usize,
    ) -> Result<Vec<(ClientId, oneshot::Sender<()>)>, BalancerError> {
        let mut backend = self.backend(index)?.lock().await;
        Ok(backend.attached.drain().collect())
    }

    /// Records a probe result and returns the previous health flag
    pub async fn set_healthy(&self, index: usize, healthy: bool) -> Result<bool, BalancerError> {
        let mut backend = self.backend(index)?.lock().await;
        Ok(std::mem::replace(&mut backend.healthy, healthy))
    }

    pub async fn view(&self, index: usize) -> Result<BackendView, BalancerError> {
        let backend = self.backend(index)?.lock().await;
        Ok(BackendView {
            index,
            address: self.addresses[index].clone(),
            healthy: backend.healthy,
            load: backend.attached.len(),
            capacity: backend.capacity,
        })
    }

    /// Snapshot of every backend, taking one lock at a time
    pub async fn views(&self) -> Vec<BackendView> {
        let mut views = Vec::with_capacity(self.backends.len());
        for index in 0..self.backends.len() {
            if let Ok(view) = self.view(index).await {
                views.push(view);
            }
        }
        views
    }
}
