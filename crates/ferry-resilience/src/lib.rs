//! # Ferry Resilience
//!
//! Resilience patterns for the Ferry job engine.
//! Provides per-operation circuit breakers, a breaker registry, and timeouts.

pub mod circuit_breaker;
pub mod timeout;

pub use circuit_breaker::*;
pub use timeout::*;
