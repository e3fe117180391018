//! External token stores.
//!
//! A `TokenStore` only knows how to read and write a counter by key. The
//! `StoreLedger` layers the ledger contract on top of it: per-key
//! serialization of read-modify-write cycles, and a local record of the keys
//! it has written so that decay can visit them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::backend::LedgerBackend;
use super::decision::{decide, Decision};
use crate::error::Result;

/// Asynchronous key-value storage for usage counters.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Read the counter stored for `key`.
    async fn get(&self, key: &str) -> Result<Option<f64>>;

    /// Save the counter for `key`.
    async fn set(&self, key: &str, value: f64) -> Result<()>;
}

/// Reads a counter from an external store.
pub type StoreAccessor =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Option<f64>>> + Send + Sync>;

/// Writes a counter to an external store.
pub type StoreMutator = Arc<dyn Fn(String, f64) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`StoreAccessor`].
pub fn store_accessor<F, Fut>(f: F) -> StoreAccessor
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<f64>>> + Send + 'static,
{
    Arc::new(move |key| Box::pin(f(key)))
}

/// Wrap an async closure as a [`StoreMutator`].
pub fn store_mutator<F, Fut>(f: F) -> StoreMutator
where
    F: Fn(String, f64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |key, value| Box::pin(f(key, value)))
}

/// A `TokenStore` built from a paired accessor and mutator.
#[derive(Clone)]
pub struct CallbackStore {
    accessor: StoreAccessor,
    mutator: StoreMutator,
}

impl CallbackStore {
    /// Pair an accessor with the mutator that writes to the same store.
    pub fn new(accessor: StoreAccessor, mutator: StoreMutator) -> Self {
        Self { accessor, mutator }
    }
}

impl fmt::Debug for CallbackStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenStore for CallbackStore {
    async fn get(&self, key: &str) -> Result<Option<f64>> {
        (self.accessor)(key.to_string()).await
    }

    async fn set(&self, key: &str, value: f64) -> Result<()> {
        (self.mutator)(key.to_string(), value).await
    }
}

/// Ledger backed by an external [`TokenStore`].
pub struct StoreLedger<S> {
    store: S,
    /// Keys written through this ledger, each with its update lock
    keys: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: TokenStore> StoreLedger<S> {
    /// Create a ledger over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            keys: DashMap::new(),
        }
    }

    /// Get the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn known_keys(&self) -> Vec<(String, Arc<Mutex<()>>)> {
        self.keys
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl<S: TokenStore> LedgerBackend for StoreLedger<S> {
    async fn get(&self, key: &str) -> Result<Option<f64>> {
        self.store.get(key).await
    }

    async fn increment(&self, key: &str) -> Result<f64> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let next = self.store.get(key).await?.unwrap_or(0.0) + 1.0;
        self.store.set(key, next).await?;
        Ok(next)
    }

    async fn decay_all(&self, amount: f64) -> Result<usize> {
        let mut decayed = 0;
        let mut failed = 0;
        for (key, lock) in self.known_keys() {
            let _guard = lock.lock().await;
            let counter = match self.store.get(&key).await {
                Ok(counter) => counter,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read counter for decay");
                    failed += 1;
                    continue;
                }
            };
            if let Some(counter) = counter.filter(|c| *c > 0.0) {
                match self.store.set(&key, counter - amount).await {
                    Ok(()) => decayed += 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to save decayed counter");
                        failed += 1;
                    }
                }
            }
        }
        trace!(amount, decayed, failed, "Decayed store counters");
        Ok(decayed)
    }

    async fn record(&self, key: &str, limit: f64) -> Result<Decision> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let counter = self.store.get(key).await.inspect_err(|e| {
            warn!(key = %key, error = %e, "Failed to read counter from store");
        })?;
        if counter.is_none() {
            debug!(key = %key, "Tracking new identity");
        }

        let (decision, next) = decide(counter, limit);
        if let Some(next) = next {
            self.store.set(key, next).await.inspect_err(|e| {
                warn!(key = %key, error = %e, "Failed to save counter to store");
            })?;
        }
        Ok(decision)
    }

    async fn prune(&self) -> Result<usize> {
        let mut pruned = 0;
        for (key, lock) in self.known_keys() {
            let _guard = lock.lock().await;
            let settled = match self.store.get(&key).await? {
                Some(counter) => counter <= 0.0,
                None => true,
            };
            // Only the map and this snapshot may hold the lock; any other
            // holder is a caller about to update the key.
            if settled
                && self
                    .keys
                    .remove_if(&key, |_, held| {
                        Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2
                    })
                    .is_some()
            {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    fn tracked(&self) -> usize {
        self.keys.len()
    }
}
