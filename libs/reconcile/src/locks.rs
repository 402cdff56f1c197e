//! Per-identity async locks.
//!
//! Every reconciler operation takes the lock for the identity it touches
//! before probing live state and releases it after persisting. Entries are
//! held weakly so the table only grows with identities currently in use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::OwnedMutexGuard;

use crate::identity::RouteName;

/// Identity a lock is taken on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    /// A proxy route, keyed by its external name.
    Route(RouteName),
    /// A TCP relay, keyed by its listening port.
    Port(u16),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route(name) => write!(f, "route:{name}"),
            Self::Port(port) => write!(f, "port:{port}"),
        }
    }
}

/// Guard for one or more keys; dropping it releases all of them.
#[derive(Debug)]
pub struct KeyedGuard {
    keys: Vec<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedGuard {
    /// Keys held by this guard, in acquisition order.
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

/// Table of async mutexes keyed by relay identity.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<LockKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a single key.
    pub async fn lock(&self, key: LockKey) -> KeyedGuard {
        self.lock_many([key]).await
    }

    /// Acquire several keys at once.
    ///
    /// Keys are taken in sorted order so two callers asking for overlapping
    /// sets cannot deadlock. Duplicates are collapsed.
    pub async fn lock_many(&self, keys: impl IntoIterator<Item = LockKey>) -> KeyedGuard {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let mutex = self.entry(key);
            guards.push(mutex.lock_owned().await);
        }

        KeyedGuard {
            keys,
            _guards: guards,
        }
    }

    /// Number of keys that currently have a live mutex.
    pub fn active(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|w| w.strong_count() > 0).count()
    }

    fn entry(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, w| w.strong_count() > 0);

        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let mutex = Arc::new(tokio::sync::Mutex::new(()));
        entries.insert(key.clone(), Arc::downgrade(&mutex));
        mutex
    }
}
