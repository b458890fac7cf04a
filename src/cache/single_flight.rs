//! Per-key coalescing of origin fetches.
//!
//! The first miss for a key becomes the leader and performs the fetch; misses
//! arriving while it runs subscribe to a broadcast channel and receive the
//! leader's outcome, success or failure. The leader's guard removes the key on
//! completion or drop, so a cancelled leader never strands its waiters: their
//! channel closes and they register again.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Only the single completion message is ever sent
const BROADCAST_CHANNEL_CAPACITY: usize = 1;

pub struct InflightTracker<T: Clone> {
    pending: Arc<DashMap<String, broadcast::Sender<T>>>,
}

/// Role assigned to a request after registration
pub enum FlightRole<T: Clone> {
    /// First request for this key; must fetch and then call [`FlightGuard::complete`]
    Leader(FlightGuard<T>),
    /// Another request is already fetching; wait on the receiver
    Waiter(broadcast::Receiver<T>),
}

/// RAII guard held by the leader. Dropping it without completing releases the key.
pub struct FlightGuard<T: Clone> {
    key: String,
    sender: broadcast::Sender<T>,
    pending: Arc<DashMap<String, broadcast::Sender<T>>>,
    completed: bool,
}

impl<T: Clone> InflightTracker<T> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Atomically become the leader for `key` or subscribe to the current one
    pub fn register(&self, key: &str) -> FlightRole<T> {
        match self.pending.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());
                FlightRole::Leader(FlightGuard {
                    key: key.to_string(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                })
            }
            Entry::Occupied(occupied) => FlightRole::Waiter(occupied.get().subscribe()),
        }
    }

    /// Number of keys currently being fetched
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl<T: Clone> Default for InflightTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FlightGuard<T> {
    /// Release the key and hand `outcome` to every waiter.
    ///
    /// The key is removed before sending: a request arriving afterwards
    /// becomes a fresh leader instead of subscribing to a spent channel.
    pub fn complete(mut self, outcome: T) {
        self.completed = true;
        self.pending.remove(&self.key);
        // No receivers is fine
        let _ = self.sender.send(outcome);
    }
}

impl<T: Clone> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.key);
        }
    }
}
