//! breakerpool - MySQL connection pool guarded by a circuit breaker

pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod pool;

pub use client::{ClientError, Connector, MySqlConnector};
pub use config::{Config, PoolConfig, PoolSettings};
pub use core::Core;
pub use pool::{ConnectionPool, InitError, PoolError, PoolState, PoolStats};
