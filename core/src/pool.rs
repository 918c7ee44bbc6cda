//! Connection pool and connection selection

use crate::connection::Connection;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use uuid::Uuid;

/// Strategy for choosing which pooled connection handles an action
pub trait ConnectionSelector: Send {
    /// Pick an index in `0..candidates`, or `None` if there are no candidates
    fn select(&mut self, candidates: usize) -> Option<usize>;
}

/// Uniform random selection
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    /// Selector seeded from the operating system
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Selector with a fixed seed, for reproducible runs
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSelector for RandomSelector {
    fn select(&mut self, candidates: usize) -> Option<usize> {
        if candidates == 0 {
            None
        } else {
            Some(self.rng.gen_range(0..candidates))
        }
    }
}

/// The set of tracked connections
pub struct ConnectionPool {
    connections: RwLock<Vec<Arc<Connection>>>,
    selector: Mutex<Box<dyn ConnectionSelector>>,
}

impl ConnectionPool {
    /// Create an empty pool using the given selection strategy
    pub fn new(selector: Box<dyn ConnectionSelector>) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            selector: Mutex::new(selector),
        }
    }

    /// Track a connection
    pub fn add(&self, connection: Arc<Connection>) {
        self.connections.write().push(connection);
    }

    /// Stop tracking a connection
    pub fn remove(&self, id: Uuid) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write();
        let index = connections.iter().position(|c| c.id() == id)?;
        Some(connections.remove(index))
    }

    /// Look up a connection by ID
    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().iter().find(|c| c.id() == id).cloned()
    }

    /// Choose a connection with the pool's selector, whatever its state
    pub fn pick(&self) -> Option<Arc<Connection>> {
        let connections = self.connections.read();
        let index = self.selector.lock().select(connections.len())?;
        connections.get(index).cloned()
    }

    /// Snapshot of every tracked connection
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Number of connections currently connected
    pub fn connected_count(&self) -> usize {
        self.connections.read().iter().filter(|c| c.is_connected()).count()
    }

    /// Number of tracked connections
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Box::new(RandomSelector::new()))
    }
}
