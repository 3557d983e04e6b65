//! Disease progression model.
//!
//! Every person moves through the stages of [`DiseaseState`] in order. Pre-infectious stages
//! have a single successor, while the infectious stages branch according to the configured
//! case severity probabilities. The time spent in every active stage is drawn from its
//! [`DwellTime`] distribution.

use crate::config::{DiseaseParams, SeverityParams, check_num};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::{Gamma, LogNormal, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage of the illness of a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiseaseState {
    Susceptible,
    Latent,
    IncubatingPostLatent,
    Asymptomatic,
    SymptomaticInfectious,
    Critical,
    Deceased,
    Immune,
}

impl DiseaseState {
    pub const COUNT: usize = 8;

    /// Stages with a scheduled exit.
    pub const ACTIVE: [DiseaseState; 5] = [
        DiseaseState::Latent,
        DiseaseState::IncubatingPostLatent,
        DiseaseState::Asymptomatic,
        DiseaseState::SymptomaticInfectious,
        DiseaseState::Critical,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Absorbing states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, DiseaseState::Deceased | DiseaseState::Immune)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != DiseaseState::Susceptible
    }
}

impl fmt::Display for DiseaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiseaseState::Susceptible => "susceptible",
            DiseaseState::Latent => "latent",
            DiseaseState::IncubatingPostLatent => "incubating_post_latent",
            DiseaseState::Asymptomatic => "asymptomatic",
            DiseaseState::SymptomaticInfectious => "symptomatic_infectious",
            DiseaseState::Critical => "critical",
            DiseaseState::Deceased => "deceased",
            DiseaseState::Immune => "immune",
        };
        f.write_str(name)
    }
}

/// Distribution of the number of days spent in a stage.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum DwellTime {
    Fixed { days: u32 },
    Uniform { min: u32, max: u32 },
    Gamma { shape: f64, scale: f64 },
    LogNormal { mu: f64, sigma: f64 },
}

impl DwellTime {
    pub fn validate(&self) -> Result<()> {
        match *self {
            DwellTime::Fixed { days } => check_num(days, 1..10_000).context("invalid days")?,
            DwellTime::Uniform { min, max } => {
                check_num(min, 1..10_000).context("invalid minimum")?;
                check_num(max, min..10_000).context("invalid maximum")?;
            }
            DwellTime::Gamma { shape, scale } => {
                check_num(shape, 0.0..1e3).context("invalid shape")?;
                check_num(scale, 0.0..1e3).context("invalid scale")?;
            }
            DwellTime::LogNormal { mu, sigma } => {
                check_num(mu, -1e2..1e2).context("invalid mu")?;
                check_num(sigma, 0.0..1e2).context("invalid sigma")?;
            }
        }
        Ok(())
    }
}

enum DwellSampler {
    Fixed(u32),
    Uniform(Uniform<u32>),
    Gamma(Gamma<f64>),
    LogNormal(LogNormal<f64>),
}

impl DwellSampler {
    fn new(dwell_time: &DwellTime) -> Result<Self> {
        let sampler = match *dwell_time {
            DwellTime::Fixed { days } => DwellSampler::Fixed(days),
            DwellTime::Uniform { min, max } => DwellSampler::Uniform(Uniform::new_inclusive(min, max)?),
            DwellTime::Gamma { shape, scale } => DwellSampler::Gamma(Gamma::new(shape, scale)?),
            DwellTime::LogNormal { mu, sigma } => DwellSampler::LogNormal(LogNormal::new(mu, sigma)?),
        };
        Ok(sampler)
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> u32 {
        let days = match self {
            DwellSampler::Fixed(days) => return (*days).max(1),
            DwellSampler::Uniform(dist) => return dist.sample(rng).max(1),
            DwellSampler::Gamma(dist) => dist.sample(rng),
            DwellSampler::LogNormal(dist) => dist.sample(rng),
        };
        days.round().clamp(1.0, f64::from(u16::MAX)) as u32
    }
}

/// Per-person finite state machine for illness stages and dwell times.
pub struct DiseaseModel {
    infectiousness: [f64; DiseaseState::COUNT],
    dwell_samplers: Vec<(DiseaseState, DwellSampler)>,
    severity: SeverityParams,
}

impl DiseaseModel {
    /// Build the model, failing on any unconfigured stage.
    pub fn new(params: &DiseaseParams) -> Result<Self> {
        let mut infectiousness = [0.0; DiseaseState::COUNT];
        let mut dwell_samplers = Vec::with_capacity(DiseaseState::ACTIVE.len());
        for state in DiseaseState::ACTIVE {
            infectiousness[state.index()] = *params.infectiousness.get(state)?;
            let sampler = DwellSampler::new(params.dwell_time.get(state)?)
                .with_context(|| format!("invalid dwell time of stage {state:?}"))?;
            dwell_samplers.push((state, sampler));
        }

        Ok(Self {
            infectiousness,
            dwell_samplers,
            severity: params.severity.clone(),
        })
    }

    /// Infectiousness multiplier of a person in `state`.
    pub fn infectiousness(&self, state: DiseaseState) -> f64 {
        self.infectiousness[state.index()]
    }

    /// Sample the number of days a person spends in `state` (at least one).
    pub fn dwell_time<R: Rng>(&self, state: DiseaseState, rng: &mut R) -> Result<u32> {
        let (_, sampler) = self
            .dwell_samplers
            .iter()
            .find(|(s, _)| *s == state)
            .with_context(|| format!("stage {state:?} has no dwell time"))?;
        Ok(sampler.sample(rng))
    }

    /// Select the stage that follows `state` once its dwell time is over.
    ///
    /// Returns `None` for states without a scheduled exit.
    pub fn next_state<R: Rng>(
        &self,
        state: DiseaseState,
        age_category: usize,
        rng: &mut R,
    ) -> Option<DiseaseState> {
        let next = match state {
            DiseaseState::Susceptible | DiseaseState::Deceased | DiseaseState::Immune => {
                return None;
            }
            DiseaseState::Latent => DiseaseState::IncubatingPostLatent,
            DiseaseState::IncubatingPostLatent => {
                let prob = by_age(&self.severity.prob_symptomatic, age_category);
                if rng.random_bool(prob) {
                    DiseaseState::SymptomaticInfectious
                } else {
                    DiseaseState::Asymptomatic
                }
            }
            DiseaseState::Asymptomatic => DiseaseState::Immune,
            DiseaseState::SymptomaticInfectious => {
                let prob = by_age(&self.severity.prob_critical, age_category);
                if rng.random_bool(prob) {
                    DiseaseState::Critical
                } else {
                    DiseaseState::Immune
                }
            }
            DiseaseState::Critical => {
                let prob = by_age(&self.severity.prob_death, age_category);
                if rng.random_bool(prob) {
                    DiseaseState::Deceased
                } else {
                    DiseaseState::Immune
                }
            }
        };
        Some(next)
    }

    /// Check that `to` may follow `from` in the progression.
    pub fn check_transition(from: DiseaseState, to: DiseaseState) -> Result<()> {
        if from.is_terminal() {
            bail!("{from} is terminal and cannot transition to {to}");
        }
        if to == DiseaseState::Susceptible {
            bail!("{from} cannot transition back to susceptible");
        }
        Ok(())
    }
}

fn by_age(probs: &[f64], age_category: usize) -> f64 {
    probs[age_category.min(probs.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use rand_chacha::ChaCha12Rng;

    fn model() -> DiseaseModel {
        DiseaseModel::new(&test_config().disease).unwrap()
    }

    #[test]
    fn terminal_states_never_transition() {
        let model = model();
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(model.next_state(DiseaseState::Immune, 3, &mut rng), None);
            assert_eq!(model.next_state(DiseaseState::Deceased, 3, &mut rng), None);
        }
        assert!(model.dwell_time(DiseaseState::Immune, &mut rng).is_err());
        assert!(DiseaseModel::check_transition(DiseaseState::Deceased, DiseaseState::Immune).is_err());
        assert!(DiseaseModel::check_transition(DiseaseState::Latent, DiseaseState::Susceptible).is_err());
    }

    #[test]
    fn pre_infectious_successors_are_deterministic() {
        let model = model();
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        for _ in 0..100 {
            assert_eq!(
                model.next_state(DiseaseState::Latent, 0, &mut rng),
                Some(DiseaseState::IncubatingPostLatent)
            );
            assert_eq!(
                model.next_state(DiseaseState::Asymptomatic, 0, &mut rng),
                Some(DiseaseState::Immune)
            );
        }
    }

    #[test]
    fn dwell_times_respect_distributions() {
        let model = model();
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        for _ in 0..1000 {
            let latent = model.dwell_time(DiseaseState::Latent, &mut rng).unwrap();
            assert!((2..=4).contains(&latent));
            let critical = model.dwell_time(DiseaseState::Critical, &mut rng).unwrap();
            assert_eq!(critical, 10);
            let asymptomatic = model.dwell_time(DiseaseState::Asymptomatic, &mut rng).unwrap();
            assert!(asymptomatic >= 1);
        }
    }

    #[test]
    fn severity_branches_follow_age_category() {
        let model = model();
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let n_trials = 20_000;

        // Age categories past the end of the table use its last entry (0.4).
        let n_deaths = (0..n_trials)
            .filter(|_| {
                model.next_state(DiseaseState::Critical, 9, &mut rng) == Some(DiseaseState::Deceased)
            })
            .count();
        let freq = n_deaths as f64 / n_trials as f64;
        approx::assert_abs_diff_eq!(freq, 0.4, epsilon = 0.02);

        // Nobody dies in the youngest category.
        assert!((0..1000).all(|_| {
            model.next_state(DiseaseState::Critical, 0, &mut rng) == Some(DiseaseState::Immune)
        }));
    }

    #[test]
    fn unconfigured_infectiousness_is_fatal() {
        let mut params = test_config().disease;
        params.infectiousness.asymptomatic = None;
        assert!(DiseaseModel::new(&params).is_err());
    }
}
