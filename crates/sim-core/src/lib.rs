#![deny(warnings)]

//! Core domain models and invariants for Tokensim.
//!
//! This crate defines the serializable configuration and result types used
//! across the simulation, the allocation-sum validation that must abort a
//! run before any month executes, and the canonical config fingerprint used
//! by the job queue's result cache.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Tolerance applied to allocation-sum checks to absorb float rounding.
pub const ALLOCATION_EPSILON: f64 = 1e-9;

/// Default positive floor applied to every modeled price.
pub const DEFAULT_PRICE_FLOOR: f64 = 1e-9;

/// Size of a bucket's allocation, either as a fraction of total supply or
/// as an absolute token amount.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    /// Fraction of total supply in [0, 1].
    Fraction(f64),
    /// Absolute token amount.
    Tokens(f64),
}

impl Allocation {
    /// Resolve this allocation to a token amount against `total_supply`.
    pub fn tokens(&self, total_supply: f64) -> f64 {
        match *self {
            Allocation::Fraction(f) => f * total_supply,
            Allocation::Tokens(t) => t,
        }
    }
}

/// One allocation bucket with its unlock schedule.
///
/// Immutable after job submission; the Monte Carlo runner perturbs per-trial
/// copies and leaves the submitted schedule untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketSchedule {
    /// Bucket name, e.g. "team" or "seed_investors".
    pub name: String,
    /// Allocation size.
    pub allocation: Allocation,
    /// Percentage of the allocation unlocked at TGE (month 0), in [0, 100].
    pub tge_unlock_pct: f64,
    /// Months after TGE during which no further unlock occurs.
    pub cliff_months: u32,
    /// Months of linear vesting after the cliff; 0 means a step unlock.
    pub vesting_months: u32,
    /// Behavior cohort applied to holders of this bucket.
    pub cohort: String,
}

/// Behavioral profile distributions for one cohort.
///
/// Means parameterize the distributions agents are sampled from: Beta for
/// probabilities, LogNormal for hold time, Normal clipped to domain for
/// sell pressure and thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CohortProfile {
    /// Mean fraction of newly liquid tokens sold per month, in [0, 1].
    pub sell_pressure_mean: f64,
    /// Standard deviation of the monthly sell fraction.
    #[serde(default = "default_sell_pressure_std")]
    pub sell_pressure_std: f64,
    /// Probability that liquid tokens are staked rather than held, in [0, 1].
    #[serde(default)]
    pub stake_probability: f64,
    /// Mean holding time in months for tokens an agent decides to keep.
    #[serde(default = "default_hold_time")]
    pub hold_time_months: f64,
    /// LogNormal sigma for the hold-time draw.
    #[serde(default = "default_hold_time_sigma")]
    pub hold_time_sigma: f64,
    /// Sensitivity of sell pressure to price trend; 0 disables the coupling.
    #[serde(default)]
    pub price_sensitivity: f64,
    /// Risk tolerance in [0, 1]; scales trigger-driven extra selling.
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: f64,
    /// Sell-pressure multiplier in the first unlock month after a cliff.
    #[serde(default = "default_cliff_shock")]
    pub cliff_shock_multiplier: f64,
    /// Take-profit trigger as a multiple of entry price, e.g. 2.0 for +100%.
    #[serde(default)]
    pub take_profit_multiple: Option<f64>,
    /// Stop-loss trigger as a multiple of entry price, e.g. 0.5 for -50%.
    #[serde(default)]
    pub stop_loss_multiple: Option<f64>,
}

fn default_sell_pressure_std() -> f64 {
    0.05
}
fn default_hold_time() -> f64 {
    6.0
}
fn default_hold_time_sigma() -> f64 {
    0.5
}
fn default_risk_tolerance() -> f64 {
    0.5
}
fn default_cliff_shock() -> f64 {
    1.0
}

/// How holder populations are materialized into simulated agents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentGranularity {
    /// One agent per estimated holder.
    FullIndividual,
    /// A fixed number of scaled meta-agents per cohort.
    MetaAgents,
    /// FullIndividual below a holder threshold, MetaAgents above it.
    Adaptive,
}

/// Agent population settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Population scaling strategy.
    #[serde(default = "default_granularity")]
    pub granularity: AgentGranularity,
    /// Meta-agent count per bucket when scaling down.
    #[serde(default = "default_meta_agents")]
    pub meta_agents_per_bucket: usize,
    /// Estimated holder count switching Adaptive to meta-agents.
    #[serde(default = "default_adaptive_threshold")]
    pub adaptive_threshold: u64,
    /// Estimated real holders per bucket.
    #[serde(default = "default_estimated_holders")]
    pub estimated_holders_per_bucket: u64,
}

fn default_granularity() -> AgentGranularity {
    AgentGranularity::Adaptive
}
fn default_meta_agents() -> usize {
    100
}
fn default_adaptive_threshold() -> u64 {
    10_000
}
fn default_estimated_holders() -> u64 {
    1_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            granularity: default_granularity(),
            meta_agents_per_bucket: default_meta_agents(),
            adaptive_threshold: default_adaptive_threshold(),
            estimated_holders_per_bucket: default_estimated_holders(),
        }
    }
}

/// Price-formation model, selected per run.
///
/// Represented as a tagged variant so the engine's price step stays a
/// single exhaustive match, testable in isolation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum PricingModel {
    /// Identity: price never moves.
    Constant,
    /// price = k * circulating_supply^exponent.
    BondingCurve { k: f64, exponent: f64 },
    /// price = initial_price * (1 + circulating/total)^alpha.
    IssuanceCurve { alpha: f64 },
    /// price = demand / (circulating * velocity), velocity = 1/holding_time,
    /// smoothed with an exponential moving average.
    EquationOfExchange {
        monthly_demand_usd: f64,
        holding_time_months: f64,
        #[serde(default = "default_smoothing")]
        smoothing_factor: f64,
    },
}

fn default_smoothing() -> f64 {
    0.3
}

impl Default for PricingModel {
    fn default() -> Self {
        PricingModel::Constant
    }
}

/// Where staking rewards come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardSource {
    /// Rewards are minted, increasing total supply.
    Emission,
    /// Rewards are drawn from the treasury token balance.
    Treasury,
}

/// Staking subsystem settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StakingConfig {
    /// Base annual percentage yield, e.g. 0.12 for 12%.
    pub base_apy: f64,
    /// APY multiplier at zero utilization.
    #[serde(default = "default_apy_empty")]
    pub apy_multiplier_at_empty: f64,
    /// APY multiplier at full utilization.
    #[serde(default = "default_apy_full")]
    pub apy_multiplier_at_full: f64,
    /// Months a stake is locked before it matures.
    #[serde(default = "default_lockup")]
    pub lockup_months: u32,
    /// Pool capacity as a fraction of circulating supply.
    #[serde(default = "default_max_capacity")]
    pub max_capacity_pct: f64,
    /// Reward funding source.
    #[serde(default = "default_reward_source")]
    pub reward_source: RewardSource,
}

fn default_apy_empty() -> f64 {
    1.5
}
fn default_apy_full() -> f64 {
    0.5
}
fn default_lockup() -> u32 {
    3
}
fn default_max_capacity() -> f64 {
    0.5
}
fn default_reward_source() -> RewardSource {
    RewardSource::Emission
}

/// Treasury subsystem settings.
///
/// `hold_pct + liquidity_pct + buyback_pct` must equal 1.0; the upstream
/// validation layer enforces that before submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreasuryConfig {
    /// Buckets whose unlocks route to the treasury instead of holders.
    pub managed_buckets: Vec<String>,
    /// Fraction of inflow held out of circulation without burning.
    pub hold_pct: f64,
    /// Fraction of inflow deployed as market liquidity.
    pub liquidity_pct: f64,
    /// Fraction of inflow committed to buybacks.
    pub buyback_pct: f64,
    /// Burn bought-back tokens, permanently reducing total supply.
    #[serde(default)]
    pub burn_bought_tokens: bool,
}

/// Perturbation magnitude for Monte Carlo trials.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceLevel {
    Low,
    Medium,
    High,
}

impl VarianceLevel {
    /// Scale factor applied to every perturbation magnitude.
    pub fn scale(&self) -> f64 {
        match self {
            VarianceLevel::Low => 0.5,
            VarianceLevel::Medium => 1.0,
            VarianceLevel::High => 2.0,
        }
    }
}

/// Monte Carlo replication settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    /// Number of independent trials.
    #[serde(default = "default_trials")]
    pub num_trials: usize,
    /// Perturbation magnitude.
    #[serde(default = "default_variance")]
    pub variance_level: VarianceLevel,
    /// Base seed; trial i derives seed + i. None draws a random base seed.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Upper bound on parallel trial workers within one job.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_trials() -> usize {
    100
}
fn default_variance() -> VarianceLevel {
    VarianceLevel::Medium
}
fn default_max_workers() -> usize {
    4
}

/// A fully normalized simulation configuration.
///
/// Schema validation (ranges, percentages, date normalization) happens in
/// the upstream layer; this type only carries the simulation semantics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedConfig {
    /// Project label, informational only.
    #[serde(default)]
    pub project: String,
    /// Total token supply at TGE.
    pub total_supply: f64,
    /// Token price at TGE in USD.
    pub initial_price: f64,
    /// Simulation horizon in months.
    #[serde(default = "default_horizon")]
    pub horizon_months: u32,
    /// Allocation buckets. A `BTreeMap` keyed cohort table keeps the
    /// serialized form canonical for fingerprinting.
    pub buckets: Vec<BucketSchedule>,
    /// Cohort behavior profiles referenced by buckets.
    pub cohorts: BTreeMap<String, CohortProfile>,
    /// Price-formation model.
    #[serde(default)]
    pub pricing: PricingModel,
    /// Optional staking subsystem.
    #[serde(default)]
    pub staking: Option<StakingConfig>,
    /// Optional treasury subsystem.
    #[serde(default)]
    pub treasury: Option<TreasuryConfig>,
    /// Agent population settings.
    #[serde(default)]
    pub agents: AgentConfig,
    /// Optional Monte Carlo replication; absent means a single run.
    #[serde(default)]
    pub monte_carlo: Option<MonteCarloConfig>,
    /// Seed for every stochastic draw in a single run.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Strictly positive floor applied to modeled prices.
    #[serde(default = "default_price_floor")]
    pub price_floor: f64,
}

fn default_horizon() -> u32 {
    36
}
fn default_seed() -> u64 {
    42
}
fn default_price_floor() -> f64 {
    DEFAULT_PRICE_FLOOR
}

/// Fatal configuration errors surfaced before any simulation month runs.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Fractional allocations exceed the whole supply.
    #[error("bucket allocation fractions sum to {0:.6}, exceeding 1.0")]
    AllocationFractionOverflow(f64),
    /// Absolute allocations exceed total supply.
    #[error("bucket token allocations sum to {total}, exceeding total supply {supply}")]
    AllocationTokenOverflow { total: f64, supply: f64 },
    /// A bucket references a cohort with no profile.
    #[error("bucket '{bucket}' references undefined cohort '{cohort}'")]
    UnknownCohort { bucket: String, cohort: String },
    /// A numeric configuration field is NaN or infinite.
    #[error("non-finite value in configuration field '{0}'")]
    NonFinite(&'static str),
}

/// Recoverable conditions recorded on results while the simulation continues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A model produced NaN/Inf; the prior value was substituted.
    #[error("numeric degeneracy at month {month} in {source_label}; prior value substituted")]
    NumericDegeneracy {
        month: u32,
        #[serde(rename = "source")]
        source_label: String,
    },
    /// A stake request exceeded pool capacity and was clipped.
    #[error(
        "staking capacity exceeded at month {month}: requested {requested}, accepted {accepted}"
    )]
    CapacityExceeded {
        month: u32,
        requested: f64,
        accepted: f64,
    },
    /// A treasury-funded reward was skipped for lack of balance.
    #[error("staking reward skipped at month {month}: treasury balance insufficient")]
    RewardSkipped { month: u32 },
    /// Allocations cover less than the whole supply.
    #[error("allocations cover {covered_pct:.2}% of supply; remainder stays unallocated")]
    UnderAllocated { covered_pct: f64 },
    /// Total supply is zero; every metric degenerates to zero.
    #[error("total supply is zero; all monthly metrics degenerate to zero")]
    ZeroSupply,
    /// Monte Carlo trials with non-finite metrics were excluded.
    #[error("{count} Monte Carlo trial(s) produced non-finite metrics and were excluded")]
    DegenerateTrials { count: usize },
}

/// Validate allocation sums and basic numeric sanity.
///
/// Over-allocation is fatal; under-allocation only yields a warning, and
/// the uncovered remainder is treated as a reserve that never unlocks.
pub fn validate_config(config: &NormalizedConfig) -> Result<Vec<Warning>, ConfigError> {
    if !config.total_supply.is_finite() {
        return Err(ConfigError::NonFinite("total_supply"));
    }
    if !config.initial_price.is_finite() {
        return Err(ConfigError::NonFinite("initial_price"));
    }

    let mut warnings = Vec::new();
    if config.total_supply == 0.0 {
        warnings.push(Warning::ZeroSupply);
        return Ok(warnings);
    }

    let fraction_sum: f64 = config
        .buckets
        .iter()
        .filter_map(|b| match b.allocation {
            Allocation::Fraction(f) => Some(f),
            Allocation::Tokens(_) => None,
        })
        .sum();
    if fraction_sum > 1.0 + ALLOCATION_EPSILON {
        return Err(ConfigError::AllocationFractionOverflow(fraction_sum));
    }

    let token_sum: f64 = config
        .buckets
        .iter()
        .map(|b| b.allocation.tokens(config.total_supply))
        .sum();
    if token_sum > config.total_supply * (1.0 + ALLOCATION_EPSILON) {
        return Err(ConfigError::AllocationTokenOverflow {
            total: token_sum,
            supply: config.total_supply,
        });
    }

    let covered = token_sum / config.total_supply;
    if !config.buckets.is_empty() && covered < 1.0 - ALLOCATION_EPSILON {
        warnings.push(Warning::UnderAllocated {
            covered_pct: covered * 100.0,
        });
    }
    Ok(warnings)
}

/// Stable content-addressed fingerprint of a configuration.
///
/// Serializes through `serde_json::Value`, whose object keys are sorted, so
/// structurally identical configs fingerprint identically regardless of the
/// key order they were submitted with.
pub fn config_fingerprint(config: &NormalizedConfig) -> String {
    let value = serde_json::to_value(config).expect("config serialization is infallible");
    let canonical = value.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// Immutable per-bucket slice of one month's metrics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketMonthMetrics {
    pub name: String,
    /// Tokens unlocked up to and including this month.
    pub unlocked_cumulative: f64,
    /// Tokens newly unlocked this month.
    pub unlocked_this_month: f64,
    /// Tokens sold into the market by this bucket's holders this month.
    pub sold_this_month: f64,
    /// Tokens still locked at month end.
    pub locked_remaining: f64,
}

/// Immutable snapshot of global market state after one simulated month.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonthMetrics {
    pub month: u32,
    pub price: f64,
    pub circulating_supply: f64,
    pub total_supply: f64,
    /// Tokens newly unlocked across all buckets this month.
    pub unlocked_this_month: f64,
    /// Tokens sold into the market this month.
    pub sold_this_month: f64,
    /// Tokens staked at month end.
    pub staked_total: f64,
    /// Staking rewards paid this month.
    pub staking_rewards: f64,
    /// Treasury token balance at month end.
    pub treasury_tokens: f64,
    /// Treasury fiat balance at month end.
    pub treasury_fiat: Decimal,
    /// Tokens bought back by the treasury this month.
    pub bought_back: f64,
    /// Tokens burned since TGE.
    pub burned_cumulative: f64,
    pub buckets: Vec<BucketMonthMetrics>,
}

/// One complete simulation run, immutable once finalized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub horizon_months: u32,
    pub months: Vec<MonthMetrics>,
    pub warnings: Vec<Warning>,
}

/// A p10/p50/p90 percentile band for one metric at one month.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

/// Percentile bands across trials for one month.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonthBands {
    pub month: u32,
    pub price: Band,
    pub circulating_supply: Band,
    pub sold: Band,
}

/// Aggregated Monte Carlo output, derived and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub num_trials: usize,
    /// Trials excluded from aggregation for non-finite metrics.
    pub excluded_trials: usize,
    pub trials: Vec<SimulationRun>,
    pub bands: Vec<MonthBands>,
    pub warnings: Vec<Warning>,
}

/// Result payload of a completed job: a single run or a Monte Carlo batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    MonteCarlo(MonteCarloResult),
    Single(SimulationRun),
}
