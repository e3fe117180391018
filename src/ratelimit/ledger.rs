//! In-memory token ledger.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::LedgerBackend;
use super::decision::{decide, Decision};
use crate::error::Result;

/// Decaying usage counters indexed by identity key.
///
/// Counters live in a sharded map, so an increment and a decay pass touching
/// the same key are serialized by the shard lock.
#[derive(Debug, Default)]
pub struct TokenLedger {
    counters: DashMap<String, f64>,
}

impl TokenLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Get the counter for a key, if one exists.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.counters.get(key).map(|c| *c)
    }

    /// Add one unit of usage, creating the counter at 1 if absent.
    pub fn increment(&self, key: &str) -> f64 {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0.0);
        *counter += 1.0;
        *counter
    }

    /// Subtract `amount` from every positive counter.
    ///
    /// There is no floor at zero: a positive counter may end up negative,
    /// after which it is no longer decayed. Returns how many counters changed.
    pub fn decay_all(&self, amount: f64) -> usize {
        let mut decayed = 0;
        for mut counter in self.counters.iter_mut() {
            if *counter > 0.0 {
                *counter -= amount;
                decayed += 1;
            }
        }
        trace!(amount, decayed, "Decayed ledger counters");
        decayed
    }

    /// Run the admission protocol for one key under its shard lock.
    pub fn record(&self, key: &str, limit: f64) -> Decision {
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let (decision, next) = decide(Some(*entry.get()), limit);
                if let Some(next) = next {
                    *entry.get_mut() = next;
                }
                decision
            }
            Entry::Vacant(entry) => {
                let (decision, next) = decide(None, limit);
                debug!(key = %entry.key(), "Tracking new identity");
                if let Some(next) = next {
                    entry.insert(next);
                }
                decision
            }
        }
    }

    /// Remove counters that have settled at or below zero.
    pub fn prune(&self) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| *counter > 0.0);
        before - self.counters.len()
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no identity is tracked.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every counter.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl LedgerBackend for TokenLedger {
    async fn get(&self, key: &str) -> Result<Option<f64>> {
        Ok(TokenLedger::get(self, key))
    }

    async fn increment(&self, key: &str) -> Result<f64> {
        Ok(TokenLedger::increment(self, key))
    }

    async fn decay_all(&self, amount: f64) -> Result<usize> {
        Ok(TokenLedger::decay_all(self, amount))
    }

    async fn record(&self, key: &str, limit: f64) -> Result<Decision> {
        Ok(TokenLedger::record(self, key, limit))
    }

    async fn prune(&self) -> Result<usize> {
        Ok(TokenLedger::prune(self))
    }

    fn tracked(&self) -> usize {
        self.len()
    }
}
