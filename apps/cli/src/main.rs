#![deny(warnings)]

//! Headless CLI: load a normalized config, run it through the job queue,
//! and print KPI summaries.

use anyhow::{Context, Result};
use sim_core::{JobOutput, MonteCarloConfig, NormalizedConfig};
use sim_jobs::{JobQueue, JobStore, QueueConfig, SimulationRunner};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

struct Args {
    config_path: Option<String>,
    months: Option<u32>,
    seed: Option<u64>,
    trials: Option<usize>,
}

fn parse_args() -> Args {
    let mut args = Args {
        config_path: None,
        months: None,
        seed: None,
        trials: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config_path = it.next(),
            "--months" => args.months = it.next().and_then(|s| s.parse().ok()),
            "--seed" => args.seed = it.next().and_then(|s| s.parse().ok()),
            "--trials" => args.trials = it.next().and_then(|s| s.parse().ok()),
            _ => {}
        }
    }
    args
}

fn print_summary(output: &JobOutput) {
    match output {
        JobOutput::Single(run) => {
            let last = run.months.last();
            let final_price = last.map(|m| m.price).unwrap_or(0.0);
            let circulating_pct = last
                .map(|m| {
                    if m.total_supply > 0.0 {
                        100.0 * m.circulating_supply / m.total_supply
                    } else {
                        0.0
                    }
                })
                .unwrap_or(0.0);
            let peak_sell = run
                .months
                .iter()
                .map(|m| m.sold_this_month)
                .fold(0.0, f64::max);
            let burned = last.map(|m| m.burned_cumulative).unwrap_or(0.0);
            println!(
                "Run OK | months: {} | final price: ${:.4} | circulating: {:.1}% | peak monthly sell: {:.0} | burned: {:.0}",
                run.months.len(),
                final_price,
                circulating_pct,
                peak_sell,
                burned
            );
            for warning in &run.warnings {
                println!("warning: {warning}");
            }
        }
        JobOutput::MonteCarlo(result) => {
            let last = result.bands.last();
            let (p10, p50, p90) = last
                .map(|b| (b.price.p10, b.price.p50, b.price.p90))
                .unwrap_or((0.0, 0.0, 0.0));
            println!(
                "Monte Carlo OK | trials: {} (excluded: {}) | months: {} | final price p10/p50/p90: ${:.4} / ${:.4} / ${:.4}",
                result.num_trials,
                result.excluded_trials,
                result.bands.len(),
                p10,
                p50,
                p90
            );
            for warning in &result.warnings {
                println!("warning: {warning}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();

    let args = parse_args();
    let path = args
        .config_path
        .context("usage: cli --config <path> [--months N] [--seed S] [--trials N]")?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let mut config: NormalizedConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
    if let Some(months) = args.months {
        config.horizon_months = months;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(trials) = args.trials {
        let mc = config.monte_carlo.get_or_insert(MonteCarloConfig {
            num_trials: trials,
            variance_level: sim_core::VarianceLevel::Medium,
            seed: None,
            max_workers: 4,
        });
        mc.num_trials = trials;
    }
    info!(?path, months = config.horizon_months, "starting simulation job");

    let store = JobStore::new();
    let queue = JobQueue::new(store, QueueConfig::default(), Arc::new(SimulationRunner));
    let receipt = queue.submit(config).await?;
    info!(job_id = %receipt.job_id, cached = receipt.cached, "job submitted");

    loop {
        let snapshot = queue.status(receipt.job_id).await?;
        if snapshot.status.is_terminal() {
            break;
        }
        info!(
            progress_pct = snapshot.progress_pct,
            current_month = snapshot.current_month,
            "running"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let output = queue.results(receipt.job_id).await?;
    print_summary(&output);
    queue.shutdown().await;
    Ok(())
}
