#![deny(warnings)]

//! Agent population sampling and monthly behavior decisions.
//!
//! A population is materialized once per run from the cohort profiles, with
//! every behavioral parameter drawn from a generator seeded explicitly so a
//! given seed reproduces an identical population. Decisions themselves are
//! deterministic given the sampled parameters; all run-to-run variation
//! comes from the sampling stage.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution, LogNormal, Normal};
use serde::{Deserialize, Serialize};
use sim_core::{AgentGranularity, ConfigError, NormalizedConfig};
use tracing::debug;

/// Behavioral parameters sampled once per agent from its cohort profile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehaviorParams {
    /// Base fraction of liquid tokens sold per month, in [0, 1].
    pub sell_pressure: f64,
    /// Fraction of post-sale liquid tokens routed to staking, in [0, 1].
    pub stake_probability: f64,
    /// Coupling between price trend and sell pressure.
    pub price_sensitivity: f64,
    /// Scales trigger-driven extra selling, in [0, 1].
    pub risk_tolerance: f64,
    /// Mean months an agent keeps held tokens before releasing them.
    pub hold_time_months: f64,
    /// Sell-pressure multiplier in the month a cliff ends.
    pub cliff_shock_multiplier: f64,
    /// Take-profit trigger as a multiple of entry price.
    pub take_profit_multiple: Option<f64>,
    /// Stop-loss trigger as a multiple of entry price.
    pub stop_loss_multiple: Option<f64>,
}

/// One holder, or a meta-agent standing in for a population slice.
///
/// Wallet conservation: `locked + liquid + staked + held + sold` equals
/// `allocation` at every month boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Index into the config's bucket list.
    pub bucket_idx: usize,
    /// Tokens this agent represents in total.
    pub allocation: f64,
    /// Still vesting.
    pub locked: f64,
    /// Unlocked and not yet committed to a decision.
    pub liquid: f64,
    /// In the staking pool.
    pub staked: f64,
    /// Deliberately held; re-released to liquid at 1/hold_time per month.
    pub held: f64,
    /// Cumulative tokens sold to the market.
    pub sold: f64,
    /// Price at which this agent's tokens started unlocking.
    pub entry_price: f64,
    pub params: BehaviorParams,
}

impl Agent {
    /// Wallet total; must equal `allocation` up to float tolerance.
    pub fn wallet_total(&self) -> f64 {
        self.locked + self.liquid + self.staked + self.held + self.sold
    }
}

/// Sell/stake intents produced by one agent for one month.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Decision {
    /// Tokens to sell out of the liquid balance.
    pub sell: f64,
    /// Tokens requested for staking out of the remaining liquid balance.
    pub stake_requested: f64,
}

/// Number of agents materialized for a bucket under the configured
/// granularity strategy.
fn agents_per_bucket(config: &NormalizedConfig) -> usize {
    let agents = &config.agents;
    match agents.granularity {
        AgentGranularity::FullIndividual => agents.estimated_holders_per_bucket.max(1) as usize,
        AgentGranularity::MetaAgents => agents.meta_agents_per_bucket.max(1),
        AgentGranularity::Adaptive => {
            if agents.estimated_holders_per_bucket >= agents.adaptive_threshold {
                agents.meta_agents_per_bucket.max(1)
            } else {
                agents.estimated_holders_per_bucket.max(1) as usize
            }
        }
    }
}

fn clipped_normal(rng: &mut ChaCha8Rng, mean: f64, std: f64, lo: f64, hi: f64) -> f64 {
    if std <= 0.0 || !std.is_finite() {
        return mean.clamp(lo, hi);
    }
    let dist = Normal::new(mean, std).expect("finite mean/std");
    dist.sample(rng).clamp(lo, hi)
}

/// Beta draw with the profile value as mean and a fixed concentration.
fn beta_around(rng: &mut ChaCha8Rng, mean: f64) -> f64 {
    const CONCENTRATION: f64 = 10.0;
    if !(1e-6..=1.0 - 1e-6).contains(&mean) {
        return mean.clamp(0.0, 1.0);
    }
    let alpha = mean * CONCENTRATION;
    let beta = (1.0 - mean) * CONCENTRATION;
    Beta::new(alpha, beta)
        .map(|d| d.sample(rng))
        .unwrap_or(mean)
}

fn lognormal_around(rng: &mut ChaCha8Rng, mean: f64, sigma: f64) -> f64 {
    if mean <= 0.0 || sigma <= 0.0 || !mean.is_finite() {
        return mean.max(1.0);
    }
    // mu chosen so the distribution mean equals the profile mean
    let mu = mean.ln() - sigma * sigma / 2.0;
    LogNormal::new(mu, sigma)
        .map(|d| d.sample(rng).max(0.1))
        .unwrap_or(mean)
}

/// Materialize the agent population for a run.
///
/// Buckets listed as treasury-managed get no agents; their unlocks route to
/// the treasury. Fails when a holder bucket references an undefined cohort.
pub fn sample_population(
    config: &NormalizedConfig,
    seed: u64,
) -> Result<Vec<Agent>, ConfigError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut population = Vec::new();

    for (bucket_idx, bucket) in config.buckets.iter().enumerate() {
        let treasury_managed = config
            .treasury
            .as_ref()
            .map(|t| t.managed_buckets.iter().any(|b| b == &bucket.name))
            .unwrap_or(false);
        if treasury_managed {
            continue;
        }

        let profile =
            config
                .cohorts
                .get(&bucket.cohort)
                .ok_or_else(|| ConfigError::UnknownCohort {
                    bucket: bucket.name.clone(),
                    cohort: bucket.cohort.clone(),
                })?;

        let n = agents_per_bucket(config);
        // A zero-supply project degenerates to zero allocations everywhere.
        let bucket_tokens = if config.total_supply > 0.0 {
            bucket.allocation.tokens(config.total_supply)
        } else {
            0.0
        };
        let per_agent = bucket_tokens / n as f64;

        for _ in 0..n {
            let params = BehaviorParams {
                sell_pressure: clipped_normal(
                    &mut rng,
                    profile.sell_pressure_mean,
                    profile.sell_pressure_std,
                    0.0,
                    1.0,
                ),
                stake_probability: beta_around(&mut rng, profile.stake_probability),
                price_sensitivity: clipped_normal(
                    &mut rng,
                    profile.price_sensitivity,
                    0.1,
                    0.0,
                    5.0,
                ),
                risk_tolerance: beta_around(&mut rng, profile.risk_tolerance),
                hold_time_months: lognormal_around(
                    &mut rng,
                    profile.hold_time_months,
                    profile.hold_time_sigma,
                ),
                cliff_shock_multiplier: profile.cliff_shock_multiplier.max(0.0),
                take_profit_multiple: profile
                    .take_profit_multiple
                    .map(|tp| clipped_normal(&mut rng, tp, 0.1 * tp, 1.0, f64::INFINITY)),
                stop_loss_multiple: profile
                    .stop_loss_multiple
                    .map(|sl| clipped_normal(&mut rng, sl, 0.1 * sl, 0.0, 1.0)),
            };
            population.push(Agent {
                bucket_idx,
                allocation: per_agent,
                locked: per_agent,
                liquid: 0.0,
                staked: 0.0,
                held: 0.0,
                sold: 0.0,
                entry_price: config.initial_price,
                params,
            });
        }
    }

    debug!(agents = population.len(), "sampled population");
    Ok(population)
}

/// Evaluate one agent's sell/stake intent for the month.
///
/// `cliff_ended` marks the first unlock month after this agent's bucket
/// cliff; `staking_open` gates the stake leg. Mutates only the held->liquid
/// re-release; balance transfers for sells and stakes are settled by the
/// engine so pool clipping can be applied across the whole population.
pub fn decide(agent: &mut Agent, price: f64, cliff_ended: bool, staking_open: bool) -> Decision {
    // Hold-time release: held tokens drift back to liquid.
    if agent.held > 0.0 && agent.params.hold_time_months > 0.0 {
        let release = agent.held * (1.0 / agent.params.hold_time_months).min(1.0);
        agent.held -= release;
        agent.liquid += release;
    }

    if agent.liquid <= 0.0 {
        return Decision::default();
    }

    let trend = if agent.entry_price > 0.0 {
        price / agent.entry_price - 1.0
    } else {
        0.0
    };
    let trend_multiplier = (1.0 + agent.params.price_sensitivity * trend).clamp(0.0, 3.0);
    let mut sell_fraction = agent.params.sell_pressure * trend_multiplier;
    if cliff_ended {
        sell_fraction *= agent.params.cliff_shock_multiplier;
    }

    // Take-profit / stop-loss addons on top of the base pressure.
    let mut extra = 0.0;
    if let Some(tp) = agent.params.take_profit_multiple {
        if agent.entry_price > 0.0 && price >= agent.entry_price * tp {
            extra += 0.5 * agent.params.risk_tolerance;
        }
    }
    if let Some(sl) = agent.params.stop_loss_multiple {
        if agent.entry_price > 0.0 && price <= agent.entry_price * sl {
            extra += 0.5 * agent.params.risk_tolerance;
        }
    }
    let sell_fraction = (sell_fraction + extra).clamp(0.0, 1.0);

    let sell = agent.liquid * sell_fraction;
    let after_sale = agent.liquid - sell;
    let stake_requested = if staking_open {
        after_sale * agent.params.stake_probability.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Decision {
        sell,
        stake_requested,
    }
}

/// Seeded uniform jitter helper shared with the Monte Carlo perturbation
/// stage: a value in [-magnitude, magnitude].
pub fn jitter(rng: &mut ChaCha8Rng, magnitude: f64) -> f64 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    rng.gen_range(-magnitude..=magnitude)
}
