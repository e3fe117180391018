//! Ledger trait for abstracting in-memory and external-store implementations.

use async_trait::async_trait;

use super::decision::Decision;
use crate::error::Result;

/// Trait for token ledger implementations.
///
/// This trait abstracts over the in-memory `TokenLedger` and the
/// `StoreLedger` so the admission engine can work with either.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Current counter for a key, if any.
    async fn get(&self, key: &str) -> Result<Option<f64>>;

    /// Add one unit of usage to a key.
    async fn increment(&self, key: &str) -> Result<f64>;

    /// Subtract `amount` from every positive counter.
    ///
    /// A key that fails to update is skipped; the rest are still decayed.
    async fn decay_all(&self, amount: f64) -> Result<usize>;

    /// Read, decide and update one key without interleaving with other
    /// updates to the same key.
    async fn record(&self, key: &str, limit: f64) -> Result<Decision>;

    /// Forget keys whose counters are at or below zero.
    async fn prune(&self) -> Result<usize>;

    /// Number of identities this ledger currently knows about.
    fn tracked(&self) -> usize;
}
