//! Keyed registry of live peers.
//!
//! Hosts that accept many connections (an extension background accepting one
//! port per tab, for instance) keep each peer's channel here so it can be
//! looked up by key and dropped when the peer goes away.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Thread-safe map from peer key to peer handle. Clones share the same map.
pub struct PeerRegistry<K, V> {
    peers: Arc<Mutex<HashMap<K, V>>>,
}

impl<K, V> PeerRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `peer` under `key`, returning any peer it replaced.
    pub fn insert(&self, key: K, peer: V) -> Option<V> {
        self.lock().insert(key, peer)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    /// Snapshot of every registered peer.
    pub fn peers(&self) -> Vec<V> {
        self.lock().values().cloned().collect()
    }

    /// Remove and return every registered peer.
    pub fn drain(&self) -> Vec<V> {
        self.lock().drain().map(|(_, peer)| peer).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handle that does not keep the registry alive.
    pub fn downgrade(&self) -> WeakPeerRegistry<K, V> {
        WeakPeerRegistry {
            peers: Arc::downgrade(&self.peers),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.peers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Non-owning handle to a [`PeerRegistry`], for callbacks held by the peers
/// themselves.
pub struct WeakPeerRegistry<K, V> {
    peers: Weak<Mutex<HashMap<K, V>>>,
}

impl<K, V> WeakPeerRegistry<K, V> {
    pub fn upgrade(&self) -> Option<PeerRegistry<K, V>> {
        self.peers.upgrade().map(|peers| PeerRegistry { peers })
    }
}

impl<K, V> Clone for WeakPeerRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            peers: Weak::clone(&self.peers),
        }
    }
}

impl<K, V> Clone for PeerRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            peers: Arc::clone(&self.peers),
        }
    }
}

impl<K, V> Default for PeerRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for PeerRegistry<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
