#![deny(warnings)]

//! Simulation engine and Monte Carlo runner for Tokensim.
//!
//! One run iterates months in a fixed causal order: vesting unlocks, agent
//! decisions, staking settlement, treasury deployment, price update, then an
//! immutable metrics snapshot. Cancellation is cooperative and checked once
//! per month, never mid-month. The Monte Carlo runner replicates the engine
//! across perturbed configs on a bounded worker pool.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rust_decimal::Decimal;
use sim_agents::{decide, jitter, sample_population, Agent};
use sim_core::{
    config_fingerprint, validate_config, Band, BucketMonthMetrics, ConfigError, JobOutput,
    MonteCarloConfig, MonteCarloResult, MonthBands, MonthMetrics, NormalizedConfig, RewardSource,
    SimulationRun, Warning,
};
use sim_econ::{unlocked_fraction, update_price, PriceContext, StakingPool, TreasuryController};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, info_span};

/// Absolute slack allowed on balance invariants after float accumulation.
const BALANCE_TOLERANCE: f64 = 1e-6;

/// Errors terminating a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal configuration problem; no months were simulated.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Cooperative cancellation observed between months.
    #[error("simulation cancelled")]
    Cancelled,
    /// A balance invariant broke; indicates a programming error.
    #[error("balance invariant violated: {0}")]
    InvariantViolation(String),
    /// The Monte Carlo worker pool could not be built.
    #[error("trial worker pool failed: {0}")]
    WorkerPool(String),
}

/// Receiver for per-month progress events published by the engine.
///
/// The engine only publishes; it never holds a transport. Implementations
/// must tolerate out-of-order calls from parallel Monte Carlo trials.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, completed: u32, total: u32);
}

/// Sink that discards progress events.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _completed: u32, _total: u32) {}
}

/// Stake intents gathered from the population before pool clipping.
struct StakeRequest {
    agent_idx: usize,
    amount: f64,
}

/// One full simulation run over the configured horizon.
pub struct SimulationEngine<'a> {
    config: &'a NormalizedConfig,
    agents: Vec<Agent>,
    pool: Option<StakingPool>,
    treasury: Option<TreasuryController>,
    price: f64,
    circulating: f64,
    total_supply: f64,
    burned: f64,
    bucket_tokens: Vec<f64>,
    prev_fraction: Vec<f64>,
    cliff_shock_pending: Vec<bool>,
    months: Vec<MonthMetrics>,
    warnings: Vec<Warning>,
}

impl<'a> SimulationEngine<'a> {
    /// Validate the config and materialize the population.
    ///
    /// Allocation-sum violations and unknown cohorts abort here, before any
    /// month executes.
    pub fn new(config: &'a NormalizedConfig, seed: u64) -> Result<Self, EngineError> {
        let warnings = validate_config(config)?;
        let agents = sample_population(config, seed)?;

        let bucket_tokens: Vec<f64> = config
            .buckets
            .iter()
            .map(|b| {
                if config.total_supply > 0.0 {
                    b.allocation.tokens(config.total_supply)
                } else {
                    0.0
                }
            })
            .collect();
        let cliff_shock_pending: Vec<bool> =
            config.buckets.iter().map(|b| b.cliff_months > 0).collect();

        Ok(Self {
            config,
            agents,
            pool: config.staking.clone().map(StakingPool::new),
            treasury: config.treasury.clone().map(TreasuryController::new),
            price: config.initial_price.max(config.price_floor),
            circulating: 0.0,
            total_supply: config.total_supply,
            burned: 0.0,
            prev_fraction: vec![0.0; config.buckets.len()],
            cliff_shock_pending,
            bucket_tokens,
            months: Vec::with_capacity(config.horizon_months as usize),
            warnings,
        })
    }

    /// Run every month to completion, or stop at the cancellation flag.
    ///
    /// On cancellation all partial results are discarded; the caller never
    /// observes a half-finished `SimulationRun`.
    pub fn run(
        mut self,
        cancel: &AtomicBool,
        progress: &dyn ProgressSink,
    ) -> Result<SimulationRun, EngineError> {
        let total = self.config.horizon_months;
        let span = info_span!("simulation", horizon = total);
        let _guard = span.enter();

        for month in 0..total {
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
            self.step_month(month)?;
            progress.on_progress(month + 1, total);
        }

        Ok(SimulationRun {
            horizon_months: total,
            months: self.months,
            warnings: self.warnings,
        })
    }

    fn step_month(&mut self, month: u32) -> Result<(), EngineError> {
        // (1) Vesting unlocks per bucket.
        let mut unlocked_this_month = 0.0;
        let mut bucket_unlocked = vec![0.0; self.config.buckets.len()];
        let mut cliff_shock_now = vec![false; self.config.buckets.len()];
        for (idx, bucket) in self.config.buckets.iter().enumerate() {
            let frac_now = unlocked_fraction(bucket, month);
            let delta = (frac_now - self.prev_fraction[idx]).max(0.0);
            self.prev_fraction[idx] = frac_now;
            if delta <= 0.0 {
                continue;
            }
            if month > 0 && self.cliff_shock_pending[idx] {
                cliff_shock_now[idx] = true;
                self.cliff_shock_pending[idx] = false;
            }
            let amount = delta * self.bucket_tokens[idx];
            bucket_unlocked[idx] = amount;
            unlocked_this_month += amount;

            let routed_to_treasury = self
                .treasury
                .as_ref()
                .map(|t| t.manages(&bucket.name))
                .unwrap_or(false);
            if routed_to_treasury {
                if let Some(t) = self.treasury.as_mut() {
                    t.add_tokens(amount);
                }
            } else {
                // Credit each holder proportionally; unlocked tokens enter
                // circulating supply as liquid wallet balance.
                for agent in self.agents.iter_mut().filter(|a| a.bucket_idx == idx) {
                    let share = delta * agent.allocation;
                    let credited = share.min(agent.locked);
                    agent.locked -= credited;
                    agent.liquid += credited;
                }
                self.circulating += amount;
            }
        }

        // (2) Agent decisions: sell first, then stake intents.
        let staking_open = self.pool.is_some();
        let mut sold_this_month = 0.0;
        let mut bucket_sold = vec![0.0; self.config.buckets.len()];
        let mut requests: Vec<StakeRequest> = Vec::new();
        for (agent_idx, agent) in self.agents.iter_mut().enumerate() {
            let shock = cliff_shock_now[agent.bucket_idx];
            let decision = decide(agent, self.price, shock, staking_open);
            let sell = decision.sell.min(agent.liquid);
            agent.liquid -= sell;
            agent.sold += sell;
            sold_this_month += sell;
            bucket_sold[agent.bucket_idx] += sell;
            if decision.stake_requested > 0.0 {
                requests.push(StakeRequest {
                    agent_idx,
                    amount: decision.stake_requested.min(agent.liquid),
                });
            }
        }

        // (3) Staking settlement: clip at capacity, then release matured
        // lots and accrue rewards.
        let mut staking_rewards = 0.0;
        if let Some(pool) = self.pool.as_mut() {
            let total_requested: f64 = requests.iter().map(|r| r.amount).sum();
            if total_requested > 0.0 {
                let outcome = pool.stake(total_requested, month, self.circulating);
                if outcome.rejected > BALANCE_TOLERANCE {
                    self.warnings.push(Warning::CapacityExceeded {
                        month,
                        requested: total_requested,
                        accepted: outcome.accepted,
                    });
                }
                let ratio = outcome.accepted / total_requested;
                for request in &requests {
                    let accepted = request.amount * ratio;
                    let agent = &mut self.agents[request.agent_idx];
                    agent.liquid -= accepted;
                    agent.staked += accepted;
                }
                self.circulating -= outcome.accepted;
            }

            let staked_before = pool.total_staked();
            let matured = pool.release_matured(month);
            if matured > 0.0 && staked_before > 0.0 {
                for agent in self.agents.iter_mut() {
                    let share = matured * agent.staked / staked_before;
                    let released = share.min(agent.staked);
                    agent.staked -= released;
                    agent.held += released;
                }
                self.circulating += matured;
            }

            let reward = pool.monthly_reward(self.circulating);
            if reward > 0.0 {
                match pool.reward_source() {
                    RewardSource::Emission => {
                        self.total_supply += reward;
                        self.circulating += reward;
                        staking_rewards = reward;
                    }
                    RewardSource::Treasury => {
                        let funded = self
                            .treasury
                            .as_mut()
                            .filter(|t| t.token_balance() >= reward)
                            .map(|t| t.draw_tokens(reward))
                            .unwrap_or(0.0);
                        if funded > 0.0 {
                            self.circulating += funded;
                            staking_rewards = funded;
                        } else {
                            self.warnings.push(Warning::RewardSkipped { month });
                        }
                    }
                }
            }
        }

        // Uncommitted liquid drifts into the held balance; it re-releases
        // through the hold-time rule in later months.
        for agent in self.agents.iter_mut() {
            agent.held += agent.liquid;
            agent.liquid = 0.0;
        }

        // (4) Treasury deployment at the pre-update price.
        let mut treasury_sell_volume = 0.0;
        let mut bought_back = 0.0;
        if let Some(treasury) = self.treasury.as_mut() {
            let outcome = treasury.deploy(self.price, self.circulating);
            self.circulating += outcome.liquidity;
            self.circulating -= outcome.bought_back;
            self.total_supply -= outcome.burned;
            self.burned += outcome.burned;
            treasury_sell_volume = outcome.liquidity;
            bought_back = outcome.bought_back;
        }
        self.circulating = self.circulating.clamp(0.0, self.total_supply.max(0.0));

        // (5) Price update from the aggregated flow signals.
        let (price, price_warning) = update_price(
            &self.config.pricing,
            &PriceContext {
                month,
                prev_price: self.price,
                initial_price: self.config.initial_price,
                circulating_supply: self.circulating,
                total_supply: self.total_supply,
                monthly_sell_volume: sold_this_month + treasury_sell_volume,
                monthly_buy_volume: bought_back,
                price_floor: self.config.price_floor,
            },
        );
        self.price = price;
        if let Some(w) = price_warning {
            self.warnings.push(w);
        }

        self.check_invariants(month)?;

        // (6) Immutable snapshot.
        let buckets = self
            .config
            .buckets
            .iter()
            .enumerate()
            .map(|(idx, bucket)| BucketMonthMetrics {
                name: bucket.name.clone(),
                unlocked_cumulative: self.prev_fraction[idx] * self.bucket_tokens[idx],
                unlocked_this_month: bucket_unlocked[idx],
                sold_this_month: bucket_sold[idx],
                locked_remaining: (1.0 - self.prev_fraction[idx]) * self.bucket_tokens[idx],
            })
            .collect();
        self.months.push(MonthMetrics {
            month,
            price: self.price,
            circulating_supply: self.circulating,
            total_supply: self.total_supply,
            unlocked_this_month,
            sold_this_month,
            staked_total: self.pool.as_ref().map(|p| p.total_staked()).unwrap_or(0.0),
            staking_rewards,
            treasury_tokens: self
                .treasury
                .as_ref()
                .map(|t| t.token_balance())
                .unwrap_or(0.0),
            treasury_fiat: self
                .treasury
                .as_ref()
                .map(|t| t.fiat_balance())
                .unwrap_or(Decimal::ZERO),
            bought_back,
            burned_cumulative: self.burned,
            buckets,
        });
        debug!(
            month,
            price = self.price,
            circulating = self.circulating,
            sold = sold_this_month,
            "month complete"
        );
        Ok(())
    }

    fn check_invariants(&self, month: u32) -> Result<(), EngineError> {
        for (idx, agent) in self.agents.iter().enumerate() {
            let negative = agent.locked < -BALANCE_TOLERANCE
                || agent.liquid < -BALANCE_TOLERANCE
                || agent.staked < -BALANCE_TOLERANCE
                || agent.held < -BALANCE_TOLERANCE;
            if negative {
                return Err(EngineError::InvariantViolation(format!(
                    "agent {idx} holds a negative balance at month {month}"
                )));
            }
            let total = agent.wallet_total();
            let tolerance = BALANCE_TOLERANCE * agent.allocation.max(1.0);
            if (total - agent.allocation).abs() > tolerance {
                return Err(EngineError::InvariantViolation(format!(
                    "agent {idx} wallet total {total} drifted from allocation {} at month {month}",
                    agent.allocation
                )));
            }
        }
        if self.circulating > self.total_supply + BALANCE_TOLERANCE {
            return Err(EngineError::InvariantViolation(format!(
                "circulating {} exceeds total supply {} at month {month}",
                self.circulating, self.total_supply
            )));
        }
        Ok(())
    }
}

/// Run a single simulation for `config` with its own seed.
pub fn run_simulation(
    config: &NormalizedConfig,
    cancel: &AtomicBool,
    progress: &dyn ProgressSink,
) -> Result<SimulationRun, EngineError> {
    SimulationEngine::new(config, config.seed)?.run(cancel, progress)
}

/// Entry point used by the job queue: Monte Carlo when configured,
/// otherwise a single run.
pub fn run_job(
    config: &NormalizedConfig,
    cancel: &AtomicBool,
    progress: &dyn ProgressSink,
) -> Result<JobOutput, EngineError> {
    match &config.monte_carlo {
        Some(mc) => run_monte_carlo(config, mc, cancel, progress).map(JobOutput::MonteCarlo),
        None => run_simulation(config, cancel, progress).map(JobOutput::Single),
    }
}

/// Derive one trial's perturbed config from the base and the trial seed.
///
/// Magnitudes follow the stress-test envelope: cliff within ±2 months, TGE
/// within ±5pp, vesting duration within ±10%, cohort sell pressure within
/// ±5pp, all scaled by the variance level.
fn perturb_config(base: &NormalizedConfig, trial_seed: u64, scale: f64) -> NormalizedConfig {
    let mut rng = ChaCha8Rng::seed_from_u64(trial_seed);
    let mut config = base.clone();
    for bucket in &mut config.buckets {
        let cliff_shift = jitter(&mut rng, 2.0 * scale).round() as i64;
        bucket.cliff_months = (bucket.cliff_months as i64 + cliff_shift).max(0) as u32;
        bucket.tge_unlock_pct =
            (bucket.tge_unlock_pct + jitter(&mut rng, 5.0 * scale)).clamp(0.0, 100.0);
        let vesting_factor = 1.0 + jitter(&mut rng, 0.10 * scale);
        bucket.vesting_months =
            ((bucket.vesting_months as f64) * vesting_factor).round().max(0.0) as u32;
    }
    for profile in config.cohorts.values_mut() {
        profile.sell_pressure_mean =
            (profile.sell_pressure_mean + jitter(&mut rng, 0.05 * scale)).clamp(0.0, 1.0);
    }
    config.monte_carlo = None;
    config.seed = trial_seed;
    config
}

fn run_is_finite(run: &SimulationRun) -> bool {
    run.months.iter().all(|m| {
        m.price.is_finite() && m.circulating_supply.is_finite() && m.sold_this_month.is_finite()
    })
}

/// Linear-interpolated quantile over an ascending-sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn band(values: &mut Vec<f64>) -> Band {
    values.sort_by(|a, b| a.partial_cmp(b).expect("finite metric"));
    Band {
        p10: quantile(values, 0.10),
        p50: quantile(values, 0.50),
        p90: quantile(values, 0.90),
    }
}

/// Execute `num_trials` independent perturbed runs and reduce them to
/// per-month percentile bands.
///
/// Trial `i` derives seed `base + i`, so identical seeds reproduce
/// byte-identical aggregates. Trials run on a rayon pool bounded by
/// `max_workers`; callers sizing the outer job queue are expected to keep
/// `max_workers * max_concurrent_jobs` within their core budget.
pub fn run_monte_carlo(
    config: &NormalizedConfig,
    mc: &MonteCarloConfig,
    cancel: &AtomicBool,
    progress: &dyn ProgressSink,
) -> Result<MonteCarloResult, EngineError> {
    let num_trials = mc.num_trials.max(1);
    let base_seed = mc.seed.unwrap_or(config.seed);
    let scale = mc.variance_level.scale();
    let span = info_span!("monte_carlo", trials = num_trials, fingerprint = %config_fingerprint(config));
    let _guard = span.enter();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(mc.max_workers.max(1))
        .build()
        .map_err(|e| EngineError::WorkerPool(e.to_string()))?;

    let completed = AtomicU32::new(0);
    let outcomes: Vec<Result<SimulationRun, EngineError>> = pool.install(|| {
        (0..num_trials)
            .into_par_iter()
            .map(|i| {
                if cancel.load(Ordering::Relaxed) {
                    return Err(EngineError::Cancelled);
                }
                let trial_seed = base_seed.wrapping_add(i as u64);
                let trial_config = perturb_config(config, trial_seed, scale);
                let run =
                    SimulationEngine::new(&trial_config, trial_seed)?.run(cancel, &NoProgress)?;
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                progress.on_progress(done, num_trials as u32);
                Ok(run)
            })
            .collect()
    });

    let mut trials = Vec::with_capacity(num_trials);
    for outcome in outcomes {
        trials.push(outcome?);
    }

    let mut warnings = Vec::new();
    let finite: Vec<&SimulationRun> = trials.iter().filter(|t| run_is_finite(t)).collect();
    let excluded_trials = trials.len() - finite.len();
    if excluded_trials > 0 {
        warnings.push(Warning::DegenerateTrials {
            count: excluded_trials,
        });
    }

    let horizon = config.horizon_months;
    let mut bands = Vec::with_capacity(horizon as usize);
    for month in 0..horizon as usize {
        let mut prices = Vec::with_capacity(finite.len());
        let mut circulating = Vec::with_capacity(finite.len());
        let mut sold = Vec::with_capacity(finite.len());
        for run in &finite {
            if let Some(metrics) = run.months.get(month) {
                prices.push(metrics.price);
                circulating.push(metrics.circulating_supply);
                sold.push(metrics.sold_this_month);
            }
        }
        bands.push(MonthBands {
            month: month as u32,
            price: band(&mut prices),
            circulating_supply: band(&mut circulating),
            sold: band(&mut sold),
        });
    }

    Ok(MonteCarloResult {
        num_trials,
        excluded_trials,
        trials,
        bands,
        warnings,
    })
}
