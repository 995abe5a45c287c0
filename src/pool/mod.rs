//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - A fixed-size, blocking pool of database connections
//! - A rate-based circuit breaker guarding connection attempts and calls
//! - Availability tracking driven by breaker events
//! - Lazy, time-gated regeneration of a tripped pool

pub mod circuit;
pub mod connection;
pub mod slots;
pub mod state;

pub use circuit::{BreakerEvent, BreakerNotice, BreakerStats, CallError, RateBreaker};
pub use connection::{ConnectionPool, InitError, PoolError, PoolStats};
pub use slots::{Checkout, SlotError, SlotQueue};
pub use state::PoolState;
