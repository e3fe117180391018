//! Admission engine: identity rule, rate limit and the decay task around a ledger.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

use super::backend::LedgerBackend;
use super::decision::Decision;
use super::identity::{IdentityRule, IdentitySource};
use super::ledger::TokenLedger;
use super::store::{StoreLedger, TokenStore};
use crate::error::{Result, TurnstileError};

/// How often counters are decayed.
pub const DECAY_PERIOD: Duration = Duration::from_secs(1);

/// Length of the window the rate limit is expressed over.
const WINDOW_SECS: f64 = 60.0;

/// Check that a rate limit is a usable positive number.
pub fn validate_rate_limit(rate_limit: f64) -> Result<f64> {
    if rate_limit.is_finite() && rate_limit > 0.0 {
        Ok(rate_limit)
    } else {
        Err(TurnstileError::InvalidRateLimit(format!(
            "rate_limit must be a number greater than 0, got {}",
            rate_limit
        )))
    }
}

/// Builder for [`AdmissionEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    rate_limit: Option<f64>,
    identity_property: Option<String>,
    identity_header: Option<String>,
    ledger: Option<Arc<dyn LedgerBackend>>,
    prune_settled: bool,
}

impl EngineBuilder {
    /// Requests allowed per 60-second window.
    pub fn rate_limit(mut self, rate_limit: f64) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Identify callers by a request property.
    pub fn identity_property(mut self, name: impl Into<String>) -> Self {
        self.identity_property = Some(name.into());
        self
    }

    /// Identify callers by a request header.
    pub fn identity_header(mut self, name: impl Into<String>) -> Self {
        self.identity_header = Some(name.into());
        self
    }

    /// Keep counters in an external store instead of in memory.
    pub fn store<S: TokenStore + 'static>(mut self, store: S) -> Self {
        self.ledger = Some(Arc::new(StoreLedger::new(store)));
        self
    }

    /// Drop settled identities after each decay pass.
    pub fn prune_settled(mut self, prune: bool) -> Self {
        self.prune_settled = prune;
        self
    }

    /// Validate the options and build the engine.
    ///
    /// The decay task is not running until [`AdmissionEngine::start`].
    pub fn build(self) -> Result<AdmissionEngine> {
        let rate_limit = self
            .rate_limit
            .ok_or_else(|| TurnstileError::InvalidRateLimit("rate_limit is required".to_string()))
            .and_then(validate_rate_limit)?;

        let identity = IdentityRule::from_options(
            self.identity_property.as_deref(),
            self.identity_header.as_deref(),
        )
        .ok_or_else(|| {
            TurnstileError::InvalidConfiguration(
                "only identity_property or identity_header should be set, not both".to_string(),
            )
        })?;

        let ledger = self.ledger.unwrap_or_else(|| Arc::new(TokenLedger::new()));

        Ok(AdmissionEngine {
            rate_limit,
            identity,
            ledger,
            prune_settled: self.prune_settled,
            decay: Mutex::new(None),
        })
    }
}

struct DecayTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Decides, per identity, whether a request may proceed.
///
/// This struct is thread-safe and can be shared across request tasks.
pub struct AdmissionEngine {
    rate_limit: f64,
    identity: IdentityRule,
    ledger: Arc<dyn LedgerBackend>,
    prune_settled: bool,
    decay: Mutex<Option<DecayTask>>,
}

impl AdmissionEngine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Configured requests per 60-second window.
    pub fn rate_limit(&self) -> f64 {
        self.rate_limit
    }

    /// Amount removed from each positive counter per decay tick.
    pub fn decay_per_tick(&self) -> f64 {
        self.rate_limit / WINDOW_SECS * DECAY_PERIOD.as_secs_f64()
    }

    /// The identity rule in effect.
    pub fn identity(&self) -> &IdentityRule {
        &self.identity
    }

    /// Derive the identity key for a request.
    pub fn identify<R: IdentitySource + ?Sized>(&self, request: &R) -> String {
        self.identity.key_for(request)
    }

    /// Decide a request from `key`, recording its usage when admitted.
    pub async fn check(&self, key: &str) -> Result<Decision> {
        let decision = self.ledger.record(key, self.rate_limit).await?;

        trace!(key = %key, decision = ?decision, "Checked admission");
        if decision == Decision::Reject {
            debug!(key = %key, limit = self.rate_limit, "Rate limit exceeded");
        }

        Ok(decision)
    }

    /// Current usage counter for `key`.
    pub async fn usage(&self, key: &str) -> Result<Option<f64>> {
        self.ledger.get(key).await
    }

    /// Number of identities being tracked.
    pub fn tracked(&self) -> usize {
        self.ledger.tracked()
    }

    /// Run one decay pass now.
    pub async fn decay_tick(&self) -> Result<usize> {
        run_decay(self.ledger.as_ref(), self.decay_per_tick(), self.prune_settled).await
    }

    /// Spawn the periodic decay task. Does nothing if it is already running.
    ///
    /// Fails with [`TurnstileError::Runtime`] outside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| {
            TurnstileError::Runtime(format!("decay task needs a tokio runtime: {}", e))
        })?;

        let mut decay = self.decay.lock();
        if decay.is_some() {
            return Ok(());
        }

        let ledger = Arc::clone(&self.ledger);
        let amount = self.decay_per_tick();
        let prune = self.prune_settled;
        let (shutdown, mut stopped) = oneshot::channel();

        let handle = runtime.spawn(async move {
            // First tick one full period after start
            let mut ticker = interval_at(Instant::now() + DECAY_PERIOD, DECAY_PERIOD);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Err(e) = run_decay(ledger.as_ref(), amount, prune).await {
                            warn!(error = %e, "Decay pass failed");
                        }
                    }
                }
            }
        });

        info!(
            rate_limit = self.rate_limit,
            decay_per_tick = amount,
            identity = %self.identity,
            "Admission engine started"
        );

        *decay = Some(DecayTask { shutdown, handle });
        Ok(())
    }

    /// Whether the decay task is running.
    pub fn is_running(&self) -> bool {
        self.decay.lock().is_some()
    }

    /// Stop the decay task and wait for it to finish.
    pub async fn shutdown(&self) {
        let task = self.decay.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
            info!("Admission engine stopped");
        }
    }
}

impl Drop for AdmissionEngine {
    fn drop(&mut self) {
        if let Some(task) = self.decay.get_mut().take() {
            task.handle.abort();
        }
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("rate_limit", &self.rate_limit)
            .field("identity", &self.identity)
            .field("prune_settled", &self.prune_settled)
            .finish_non_exhaustive()
    }
}

async fn run_decay(ledger: &dyn LedgerBackend, amount: f64, prune: bool) -> Result<usize> {
    let decayed = ledger.decay_all(amount).await?;
    if prune {
        let pruned = ledger.prune().await?;
        if pruned > 0 {
            debug!(pruned, "Pruned settled identities");
        }
    }
    Ok(decayed)
}
