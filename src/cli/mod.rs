//! CLI module for breakerpool
//!
//! A small operator tool around the pool: check that a database is reachable
//! through it, watch the breaker react to outages, and print statistics.
//!
//! # Usage
//!
//! ```bash
//! # One liveness query using MYSQL_URL / DATABASE_URL
//! breakerpool ping
//!
//! # Query every 500ms using a profile from a config file
//! breakerpool --config pools.yaml --profile primary watch --interval-ms 500
//!
//! # Pool statistics as JSON
//! breakerpool --format json stats
//! ```

pub mod args;
pub mod commands;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config;
use crate::core::Core;
use args::{Cli, Commands};

/// Run the CLI application
pub async fn run(cli: Cli) -> Result<()> {
    cli.validate().context("Invalid arguments")?;

    info!("Starting breakerpool CLI");
    debug!("CLI arguments: {:?}", cli);

    let config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())
        .context("Failed to get configuration")?;

    // load_config already made the requested profile the default one
    let core = Core::new(config, None).await?;

    let result = match cli.command {
        Commands::Ping => commands::cmd_ping(&core, cli.format).await,
        Commands::Watch { interval_ms, count } => {
            commands::cmd_watch(&core, interval_ms, count, cli.format).await
        }
        Commands::Stats => commands::cmd_stats(&core, cli.format).await,
    };

    core.pool.close().await;
    result
}

/// Initialize logging; `RUST_LOG` overrides `level`
pub fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    Ok(())
}
