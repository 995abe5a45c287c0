use clap::{Parser, Subcommand};

/// breakerpool - MySQL connection pool with a circuit breaker
#[derive(Parser, Debug)]
#[command(name = "breakerpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (YAML); environment variables are used otherwise
    #[arg(long, global = true, env = "BREAKERPOOL_CONFIG")]
    pub config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true, env = "BREAKERPOOL_PROFILE")]
    pub profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Output format (text, json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one liveness query through the pool
    Ping,

    /// Run liveness queries periodically and report pool state changes
    Watch {
        /// Milliseconds between queries
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Number of queries to run (0 = until interrupted)
        #[arg(long, default_value = "0")]
        count: u64,
    },

    /// Print pool statistics
    Stats,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Commands::Watch { interval_ms, .. } = self.command {
            if interval_ms == 0 {
                anyhow::bail!("Watch interval must be greater than 0");
            }
        }
        Ok(())
    }
}
