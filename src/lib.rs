//! Turnstile - Per-identity Request Admission Control
//!
//! This crate decides, per caller identity, whether a request may proceed.
//! Each identity has a usage counter that grows by one per admitted request
//! and decays linearly once per second, so a limit of `N` requests per
//! minute regenerates one unit every `60 / N` seconds. The core lives in
//! [`ratelimit`]; [`http`] wraps it as tower middleware for axum.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod registry;
