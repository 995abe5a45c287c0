use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::{Config, PoolConfig};
use crate::pool::{ConnectionPool, InitError};

/// Core shared by the CLI commands
///
/// Holds the loaded configuration and a single MySQL pool built from the
/// selected profile. Clones share the same pool.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: Arc<ConnectionPool>,
}

impl Core {
    /// Build the pool for `profile` (or the default profile)
    ///
    /// A pool whose first build failed is kept: it starts in the `Fail` state
    /// and regenerates on use once the breaker has been open long enough.
    pub async fn new(config: Config, profile: Option<&str>) -> Result<Self> {
        let pool_config = config
            .get_profile(profile)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No profile found in configuration"))?;

        let pool = Self::open_pool(&pool_config).await?;

        Ok(Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
        })
    }

    async fn open_pool(pool_config: &PoolConfig) -> Result<ConnectionPool> {
        match ConnectionPool::connect(pool_config).await {
            Ok(pool) => Ok(pool),
            Err(InitError::Degraded { pool, source }) => {
                tracing::warn!(
                    target_url = %redact(pool.target()),
                    error = %source,
                    "pool_started_degraded"
                );
                Ok(*pool)
            }
            Err(InitError::Config(e)) => Err(e).context("Invalid pool configuration"),
        }
    }
}

/// Hide the password part of a connection URL for logging
pub fn redact(target: &str) -> String {
    match url::Url::parse(target) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparsable target>".to_string(),
    }
}
