//! Bookkeeping of distinct remote addresses.
//!
//! Tracks how many currently-open connections exist per peer IP. Only read
//! by the once-a-minute reporter, so a single mutex around a plain map is
//! plenty.

use std::collections::HashMap;
use std::sync::Mutex;

/// Concurrency-safe per-address connection counter.
///
/// Entries are never removed; a counter that drops back to zero stays in the
/// map and is simply not counted by [`distinct`](Self::distinct).
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, i64>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more open connection from `addr`.
    pub fn add(&self, addr: &str) {
        let mut peers = self.peers.lock().unwrap();
        *peers.entry(addr.to_string()).or_insert(0) += 1;
    }

    /// Record one connection from `addr` as closed.
    pub fn sub(&self, addr: &str) {
        let mut peers = self.peers.lock().unwrap();
        *peers.entry(addr.to_string()).or_insert(0) -= 1;
    }

    /// Number of addresses with at least one open connection.
    pub fn distinct(&self) -> usize {
        let peers = self.peers.lock().unwrap();
        peers.values().filter(|&&count| count != 0).count()
    }
}
