//! Short-lived pending entries with a once-per-second sweep
//!
//! Four stores share this machinery: the three token caches deposited by the
//! HTTP control plane and the pending-KCP-connection store keyed by
//! connection id. Entries live for [`PENDING_LIFETIME`] sweeps; what happens
//! on expiry is up to the sweeping caller (nothing for tokens, a `TimeOut`
//! close for pending connections).

use crate::wire::Token;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sweeps an entry survives before it is removed; with one sweep per second
/// this is the 30-second lifetime of tokens and pending connections.
pub const PENDING_LIFETIME: i32 = 30;

struct Entry<V> {
    value: V,
    lifetime: i32,
}

/// Map of pending entries with per-sweep lifetime decrement.
///
/// `try_extract` is atomic: a value extracted by one caller is gone for
/// every other caller and for the sweep.
pub struct PendingStore<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Copy, V> PendingStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert under `key`; fails when the key is already pending
    pub async fn insert(&self, key: K, value: V) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(
            key,
            Entry {
                value,
                lifetime: PENDING_LIFETIME,
            },
        );
        true
    }

    pub async fn is_pending(&self, key: &K) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Remove and return the value under `key`
    pub async fn try_extract(&self, key: &K) -> Option<V> {
        self.entries.lock().await.remove(key).map(|e| e.value)
    }

    /// One GC tick: decrement every lifetime, then remove and return the
    /// entries that went negative. Collect-then-delete, under one lock.
    pub async fn sweep(&self) -> Vec<(K, V)> {
        let mut entries = self.entries.lock().await;
        let mut expired_keys = Vec::new();
        for (key, entry) in entries.iter_mut() {
            entry.lifetime -= 1;
            if entry.lifetime < 0 {
                expired_keys.push(*key);
            }
        }
        expired_keys
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|e| (key, e.value)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl<K: Eq + Hash + Copy, V> Default for PendingStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Token-keyed pending store that mints its own keys.
pub struct TokenStore<V> {
    store: PendingStore<Token, V>,
}

impl<V> TokenStore<V> {
    pub fn new() -> Self {
        Self {
            store: PendingStore::new(),
        }
    }

    /// Deposit `value` under a freshly generated token. Collisions are
    /// retried; with 122 random bits they do not happen in practice.
    pub async fn add(&self, value: V) -> Token {
        loop {
            let token = Uuid::new_v4();
            match self.store.entries.lock().await.entry(token) {
                std::collections::hash_map::Entry::Occupied(_) => continue,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(Entry {
                        value,
                        lifetime: PENDING_LIFETIME,
                    });
                    return token;
                }
            }
        }
    }

    pub async fn is_pending(&self, token: &Token) -> bool {
        self.store.is_pending(token).await
    }

    pub async fn try_extract(&self, token: &Token) -> Option<V> {
        self.store.try_extract(token).await
    }

    pub async fn sweep(&self) -> Vec<(Token, V)> {
        self.store.sweep().await
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }
}

impl<V> Default for TokenStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
