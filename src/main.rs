use anyhow::Result;

use breakerpool::cli::{self, args::Cli};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    cli::init_logging(&cli.log_level)?;

    // Callers of a real service run on many tasks; the CLI only needs the
    // pool and the breaker listener, so a current_thread runtime suffices.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(cli::run(cli))
}
