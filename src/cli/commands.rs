//! CLI command implementations

use anyhow::Result;
use mysql_async::prelude::*;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::args::OutputFormat;
use crate::core::{redact, Core};
use crate::pool::{PoolState, PoolStats};

/// Result of one liveness query
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub ok: bool,
    pub state: PoolState,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run `SELECT 1` through the pool
pub async fn probe(core: &Core) -> ProbeReport {
    let start = Instant::now();
    let result: Result<()> = core
        .pool
        .execute(|conn| {
            Box::pin(async move {
                conn.query_drop("SELECT 1").await?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .await;

    ProbeReport {
        ok: result.is_ok(),
        state: core.pool.state(),
        latency_ms: start.elapsed().as_millis() as u64,
        error: result.err().map(|e| e.to_string()),
    }
}

/// Ping command: one liveness query, non-zero exit on failure
pub async fn cmd_ping(core: &Core, format: OutputFormat) -> Result<()> {
    let report = probe(core).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
        OutputFormat::Text => {
            if report.ok {
                println!(
                    "OK  {}  ({}ms)",
                    redact(core.pool.target()),
                    report.latency_ms
                );
            } else {
                println!(
                    "FAIL  {}  state={}  {}",
                    redact(core.pool.target()),
                    report.state,
                    report.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    if !report.ok {
        anyhow::bail!("liveness query failed");
    }
    Ok(())
}

/// Watch command: periodic liveness queries, reporting state changes
pub async fn cmd_watch(core: &Core, interval_ms: u64, count: u64, format: OutputFormat) -> Result<()> {
    let interval = Duration::from_millis(interval_ms);
    let mut ticker = tokio::time::interval(interval);
    let mut last_state = core.pool.state();
    let mut failures = 0u64;
    let mut runs = 0u64;

    info!(interval_ms = interval_ms, count = count, "Watching pool");

    loop {
        ticker.tick().await;
        let report = probe(core).await;
        runs += 1;

        if !report.ok {
            failures += 1;
        }

        if report.state != last_state {
            warn!(from = %last_state, to = %report.state, "pool_state_changed");
            last_state = report.state;
        } else {
            debug!(ok = report.ok, latency_ms = report.latency_ms, "probe");
        }

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
            OutputFormat::Text => println!(
                "#{:<5} {:<10} {:>6}ms  {}",
                runs,
                report.state,
                report.latency_ms,
                report.error.as_deref().unwrap_or("ok")
            ),
        }

        if count > 0 && runs >= count {
            break;
        }
    }

    info!(runs = runs, failures = failures, "Watch finished");
    Ok(())
}

/// Stats command: print pool statistics
pub async fn cmd_stats(core: &Core, format: OutputFormat) -> Result<()> {
    let stats = core.pool.stats();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => print_stats(core.pool.target(), &stats),
    }
    Ok(())
}

fn print_stats(target: &str, stats: &PoolStats) {
    println!("Target:        {}", redact(target));
    println!("State:         {}", stats.state);
    println!(
        "Slots:         {} idle / {} checked out / {} capacity",
        stats.idle, stats.checked_out, stats.capacity
    );
    println!("Failed opens:  {}", stats.failed_opens);
    println!("Regen tries:   {}", stats.regen_tries);
    if stats.tripped_at > 0 {
        let tripped = chrono::DateTime::from_timestamp(stats.tripped_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| stats.tripped_at.to_string());
        println!("Tripped at:    {}", tripped);
    }
    println!(
        "Breaker:       tripped={} error_rate={:.2} samples={} trips={}",
        stats.breaker.tripped,
        stats.breaker.error_rate,
        stats.breaker.samples,
        stats.breaker.trip_count
    );
}
