//! Contact environments and the same-day exposure pass.

use crate::disease::{DiseaseModel, DiseaseState};
use crate::person::PersonId;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_distr::weighted::WeightedIndex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvId(pub u32);

impl EnvId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Household,
    Workplace,
    Neighborhood,
    City,
}

impl EnvironmentKind {
    pub const ALL: [EnvironmentKind; 4] = [
        EnvironmentKind::Household,
        EnvironmentKind::Workplace,
        EnvironmentKind::Neighborhood,
        EnvironmentKind::City,
    ];
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvironmentKind::Household => "household",
            EnvironmentKind::Workplace => "workplace",
            EnvironmentKind::Neighborhood => "neighborhood",
            EnvironmentKind::City => "city",
        };
        f.write_str(name)
    }
}

/// Person present in an environment for the current day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RosterEntry {
    pub person: PersonId,
    /// Fraction of the day spent in the environment.
    pub duration: f64,
}

/// Successful exposure of a susceptible person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exposure {
    pub person: PersonId,
    pub infector: PersonId,
    pub environment: EnvId,
}

/// Grouping of people within which daily pairwise exposure is computed.
///
/// `members` is the membership assigned by the population generator, while the roster only
/// lists the people signed up for the current day and is cleared every day.
#[derive(Debug, Clone)]
pub struct Environment {
    id: EnvId,
    kind: EnvironmentKind,
    city: usize,
    contact_prob: f64,
    members: Vec<PersonId>,
    roster: Vec<RosterEntry>,
}

impl Environment {
    pub fn new(id: EnvId, kind: EnvironmentKind, city: usize, contact_prob: f64) -> Self {
        Self {
            id,
            kind,
            city,
            contact_prob,
            members: Vec::new(),
            roster: Vec::new(),
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn kind(&self) -> EnvironmentKind {
        self.kind
    }

    pub fn city(&self) -> usize {
        self.city
    }

    pub fn contact_prob(&self) -> f64 {
        self.contact_prob
    }

    pub fn members(&self) -> &[PersonId] {
        &self.members
    }

    pub fn add_member(&mut self, person: PersonId) {
        self.members.push(person);
    }

    /// Register `person` as present today for a `duration` fraction of the day.
    ///
    /// Each person is expected to sign up at most once per day.
    pub fn sign_up_for_today(&mut self, person: PersonId, duration: f64) {
        self.roster.push(RosterEntry {
            person,
            duration: duration.clamp(0.0, 1.0),
        });
    }

    /// People signed up for today.
    pub fn get_people(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn clear_roster(&mut self) {
        self.roster.clear();
    }

    /// Compute today's exposures inside this environment.
    ///
    /// Every ordered (infectious, susceptible) pair of the roster is exposed with probability
    /// `p = contact_prob * infectiousness * min(durations)`. Infectors sharing the same
    /// infectiousness and duration form a group, so a susceptible person escapes the whole
    /// roster with probability `prod((1 - p_g)^n_g)` and costs one draw per group instead
    /// of one per infector. An exposed person is attributed to one infector, drawn with
    /// weight `p`. People already in `exposed` (from this or another environment) are
    /// skipped. Returns the number of (susceptible person, infector group) draws made.
    pub fn propagate_infection<F, R>(
        &self,
        state_of: F,
        model: &DiseaseModel,
        exposed: &mut FxHashSet<PersonId>,
        exposures: &mut Vec<Exposure>,
        rng: &mut R,
    ) -> Result<usize>
    where
        F: Fn(PersonId) -> Option<DiseaseState>,
        R: Rng,
    {
        if self.roster.len() < 2 || self.contact_prob <= 0.0 {
            return Ok(0);
        }

        let mut groups: Vec<InfectorGroup> = Vec::new();
        let mut susceptible = Vec::new();
        for entry in &self.roster {
            let Some(state) = state_of(entry.person) else {
                continue;
            };
            let infectiousness = model.infectiousness(state);
            if infectiousness > 0.0 {
                let group = groups.iter_mut().find(|group| {
                    group.infectiousness == infectiousness && group.duration == entry.duration
                });
                match group {
                    Some(group) => group.members.push(entry.person),
                    None => groups.push(InfectorGroup {
                        infectiousness,
                        duration: entry.duration,
                        members: vec![entry.person],
                    }),
                }
            } else if state == DiseaseState::Susceptible {
                susceptible.push(entry);
            }
        }
        if groups.is_empty() {
            return Ok(0);
        }

        let mut n_draws = 0;
        let mut weights = vec![0.0; groups.len()];
        for target in susceptible {
            if exposed.contains(&target.person) {
                continue;
            }
            n_draws += groups.len();

            let mut escape = 1.0;
            for (group, weight) in groups.iter().zip(&mut weights) {
                let prob = (self.contact_prob
                    * group.infectiousness
                    * group.duration.min(target.duration))
                .clamp(0.0, 1.0);
                escape *= (1.0 - prob).powf(group.members.len() as f64);
                *weight = prob * group.members.len() as f64;
            }
            if !rng.random_bool((1.0 - escape).clamp(0.0, 1.0)) {
                continue;
            }

            let group_dist =
                WeightedIndex::new(&weights).context("failed to weight infector groups")?;
            let group = &groups[group_dist.sample(rng)];
            let &infector = group
                .members
                .choose(rng)
                .context("infector group is empty")?;

            exposed.insert(target.person);
            exposures.push(Exposure {
                person: target.person,
                infector,
                environment: self.id,
            });
        }
        Ok(n_draws)
    }
}

/// Infectors of one roster exposing others with the same per-pair probability.
struct InfectorGroup {
    infectiousness: f64,
    duration: f64,
    members: Vec<PersonId>,
}
