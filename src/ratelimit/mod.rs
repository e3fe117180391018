//! Token accounting and admission decisions.

mod backend;
mod decision;
mod engine;
mod identity;
mod ledger;
mod store;

pub use backend::LedgerBackend;
pub use decision::{decide, has_usage, Decision};
pub use engine::{validate_rate_limit, AdmissionEngine, EngineBuilder, DECAY_PERIOD};
pub use identity::{IdentityRule, IdentitySource, DEFAULT_IDENTITY_PROPERTY};
pub use ledger::TokenLedger;
pub use store::{
    store_accessor, store_mutator, CallbackStore, StoreAccessor, StoreLedger, StoreMutator,
    TokenStore,
};
