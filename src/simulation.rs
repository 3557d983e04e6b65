//! Daily simulation loop.
//!
//! Each tick runs, in order: the start-of-day hooks, the contact/exposure pass over every
//! environment roster, the state-transition pass, the end-of-day hooks, and finally records
//! the day and advances the date. Seeding happens once, before the first tick.

use crate::config::{ContactParams, ImmuneOrder, SeedingParams, SeedingStrategy};
use crate::disease::{DiseaseModel, DiseaseState};
use crate::environment::{EnvironmentKind, Exposure};
use crate::event::{Cause, Event};
use crate::stats::DayRecord;
use crate::world::World;
use anyhow::{Context, Result};
use chrono::{Datelike, Days, NaiveDate, Weekday};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rustc_hash::FxHashSet;

/// Daily hook invoked by the [`Simulation`].
///
/// Hooks receive the simulation for the duration of the call only. They may change the
/// state of the world but must report the resulting events through
/// [`Simulation::register_events`].
pub trait Extension {
    fn start_of_day_processing(&mut self, _sim: &mut Simulation) -> Result<()> {
        Ok(())
    }

    fn end_of_day_processing(&mut self, _sim: &mut Simulation) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    StartOfDay,
    EndOfDay,
}

pub struct Simulation {
    world: World,
    model: DiseaseModel,
    contact: ContactParams,
    initial_date: NaiveDate,
    date: NaiveDate,
    rng: ChaCha12Rng,
    events: Vec<Event>,
    days: Vec<DayRecord>,
    extensions: Vec<Box<dyn Extension>>,
}

impl Simulation {
    pub fn new(
        world: World,
        model: DiseaseModel,
        contact: ContactParams,
        initial_date: NaiveDate,
        rng: ChaCha12Rng,
    ) -> Self {
        Self {
            world,
            model,
            contact,
            initial_date,
            date: initial_date,
            rng,
            events: Vec::new(),
            days: Vec::new(),
            extensions: Vec::new(),
        }
    }

    /// Register a daily hook; hooks run in registration order.
    pub fn register_extension(&mut self, extension: Box<dyn Extension>) {
        self.extensions.push(extension);
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn initial_date(&self) -> NaiveDate {
        self.initial_date
    }

    pub fn rng_mut(&mut self) -> &mut ChaCha12Rng {
        &mut self.rng
    }

    /// Event log, in chronological order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn days(&self) -> &[DayRecord] {
        &self.days
    }

    /// Append events to the run-wide log.
    pub fn register_events<I: IntoIterator<Item = Event>>(&mut self, events: I) {
        self.events.extend(events);
    }

    /// Whether anybody is in an active disease stage or awaits a scheduled transition.
    pub fn has_pending_transitions(&self) -> bool {
        self.world
            .all_people()
            .iter()
            .any(|person| person.state().is_active() || person.next_transition_date().is_some())
    }

    /// Seed the world using the configured strategy.
    pub fn seed(&mut self, params: &SeedingParams) -> Result<()> {
        match params.strategy {
            SeedingStrategy::Random => self.infect_random_set(params),
            SeedingStrategy::ImmuneHouseholds => self.immune_households_infect_others(params),
        }
    }

    /// Immunize a fraction of the population and infect a random set of the rest.
    ///
    /// `per_to_immune` is a fraction of the (city-filtered) population, drawn among the
    /// persons aged at least `min_age` in the configured order. The infected are drawn
    /// uniformly, without replacement, among the persons left susceptible. Requests larger
    /// than the eligible pools are truncated.
    pub fn infect_random_set(&mut self, params: &SeedingParams) -> Result<()> {
        let population = self.population(params)?;

        let n_immune = (params.per_to_immune * population.len() as f64).round() as usize;
        let eligible: Vec<Vec<usize>> = population
            .iter()
            .copied()
            .filter(|&i_person| self.world.all_people()[i_person].age() >= params.min_age)
            .map(|i_person| vec![i_person])
            .collect();
        if n_immune > eligible.len() {
            log::warn!(
                "requested {n_immune} immune persons but only {} are eligible",
                eligible.len()
            );
        }

        let immunized = self.immunize_groups(eligible, n_immune, params)?;
        log::info!("immunized {} persons", immunized.len());

        let remaining: Vec<usize> = population
            .into_iter()
            .filter(|i_person| !immunized.contains(i_person))
            .collect();
        self.infect_selected(remaining, params.num_infected)
    }

    /// Immunize whole households and infect a random set of the other persons.
    ///
    /// Households are taken in the configured order and all their members aged at least
    /// `min_age` are immunized until `per_to_immune` of those members across the selected
    /// city is reached. With `per_to_immune = 1.0` every such member becomes immune.
    pub fn immune_households_infect_others(&mut self, params: &SeedingParams) -> Result<()> {
        let city = self.city_filter(params)?;
        let households: Vec<Vec<usize>> = self
            .world
            .get_all_city_households(city)
            .into_iter()
            .map(|household| {
                household
                    .members()
                    .iter()
                    .filter_map(|&id| self.world.index_of(id))
                    .filter(|&i_person| {
                        let person = &self.world.all_people()[i_person];
                        person.age() >= params.min_age && person.state() == DiseaseState::Susceptible
                    })
                    .collect::<Vec<usize>>()
            })
            .filter(|household| !household.is_empty())
            .collect();

        let n_eligible: usize = households.iter().map(Vec::len).sum();
        let n_immune = (params.per_to_immune * n_eligible as f64).round() as usize;

        let immunized = self.immunize_groups(households, n_immune, params)?;
        log::info!("immunized {} household members", immunized.len());

        let remaining: Vec<usize> = self
            .population(params)?
            .into_iter()
            .filter(|i_person| !immunized.contains(i_person))
            .collect();
        self.infect_selected(remaining, params.num_infected)
    }

    /// Advance the simulation by one day.
    pub fn tick(&mut self) -> Result<()> {
        self.run_extensions(Phase::StartOfDay)
            .context("failed to run start of day processing")?;

        let (exposures, n_draws) = self.contact_pass().context("failed to run contact pass")?;
        let date = self.date;
        let n_new_infections = exposures.len();
        for exposure in exposures {
            let cause = Cause::Exposure {
                environment: exposure.environment,
                infector: exposure.infector,
            };
            let person = self
                .world
                .get_person_mut(exposure.person)
                .context("exposed person is not registered")?;
            if let Some(event) =
                person.infect(date, DiseaseState::Latent, cause, &self.model, &mut self.rng)?
            {
                self.events.push(event);
            }
        }

        for person in self.world.all_people_mut() {
            if !person.is_due(date) {
                continue;
            }
            if let Some(event) = person.advance(date, &self.model, &mut self.rng)? {
                self.events.push(event);
            }
        }

        self.run_extensions(Phase::EndOfDay)
            .context("failed to run end of day processing")?;

        let record = DayRecord::new(date, self.world.count_states(), n_new_infections, n_draws);
        log::debug!("{date}: {record:?}");
        self.days.push(record);

        self.date = date
            .checked_add_days(Days::new(1))
            .context("date is out of range")?;

        Ok(())
    }

    /// Run up to `max_days` ticks, stopping early once nothing is left to happen if requested.
    pub fn run(&mut self, max_days: usize, stop_early: bool) -> Result<()> {
        let log_every = (max_days / 10).max(1);
        for i_day in 0..max_days {
            if stop_early && !self.has_pending_transitions() {
                log::info!("no pending transitions left after {i_day} days");
                break;
            }

            self.tick()
                .with_context(|| format!("failed to simulate {}", self.date))?;

            if (i_day + 1) % log_every == 0 {
                let progress = 100.0 * (i_day + 1) as f64 / max_days as f64;
                log::info!("completed {progress:06.2}%");
            }
        }
        Ok(())
    }

    /// Give up the simulation, keeping its daily records and event log.
    pub fn into_records(self) -> (Vec<DayRecord>, Vec<Event>) {
        (self.days, self.events)
    }

    fn run_extensions(&mut self, phase: Phase) -> Result<()> {
        let mut extensions = std::mem::take(&mut self.extensions);
        let result = extensions.iter_mut().try_for_each(|extension| match phase {
            Phase::StartOfDay => extension.start_of_day_processing(self),
            Phase::EndOfDay => extension.end_of_day_processing(self),
        });
        // Keep hooks registered while running, after the existing ones.
        extensions.append(&mut self.extensions);
        self.extensions = extensions;
        result
    }

    /// Sign everybody up for today and draw the day's exposures.
    fn contact_pass(&mut self) -> Result<(Vec<Exposure>, usize)> {
        let weekend = matches!(self.date.weekday(), Weekday::Sat | Weekday::Sun);
        let skip_workplaces = weekend && !self.contact.workplace_weekends;

        let (people, environments) = self.world.people_and_environments_mut();
        for env in environments.iter_mut() {
            env.clear_roster();
        }
        for person in people {
            // Critical patients are hospitalized and meet nobody.
            if matches!(
                person.state(),
                DiseaseState::Critical | DiseaseState::Deceased
            ) {
                continue;
            }
            for &env_id in person.environments() {
                let env = &mut environments[env_id.index()];
                if skip_workplaces && env.kind() == EnvironmentKind::Workplace {
                    continue;
                }
                env.sign_up_for_today(person.id(), self.contact.get(env.kind()).duration);
            }
        }

        let world = &self.world;
        let mut exposed = FxHashSet::default();
        let mut exposures = Vec::new();
        let mut n_draws = 0;
        for env in world.all_environments() {
            n_draws += env.propagate_infection(
                |id| world.state_of(id),
                &self.model,
                &mut exposed,
                &mut exposures,
                &mut self.rng,
            )?;
        }
        Ok((exposures, n_draws))
    }

    fn city_filter(&self, params: &SeedingParams) -> Result<Option<usize>> {
        params
            .city
            .as_deref()
            .map(|name| self.world.city_index(name))
            .transpose()
    }

    /// Indices of the susceptible persons matching the seeding city filter.
    fn population(&self, params: &SeedingParams) -> Result<Vec<usize>> {
        let city = self.city_filter(params)?;
        let population = self
            .world
            .all_people()
            .iter()
            .enumerate()
            .filter(|(_, person)| {
                person.state() == DiseaseState::Susceptible
                    && city.is_none_or(|city| person.city() == city)
            })
            .map(|(i_person, _)| i_person)
            .collect();
        Ok(population)
    }

    /// Walk the groups in the configured order and immunize their members until `n_immune`
    /// persons are immunized.
    ///
    /// Groups are never split: the last one taken may overshoot `n_immune`. A person who
    /// refuses immunization stays susceptible and the walk moves on to the next one. Beyond
    /// `people_per_day`, immunizations are scheduled on the following days.
    fn immunize_groups(
        &mut self,
        mut groups: Vec<Vec<usize>>,
        n_immune: usize,
        params: &SeedingParams,
    ) -> Result<FxHashSet<usize>> {
        // Shuffling first breaks age ties at random.
        groups.shuffle(&mut self.rng);
        let people = self.world.all_people();
        let age_of = |i_person: &usize| people[*i_person].age();
        match params.order {
            ImmuneOrder::Random => {}
            ImmuneOrder::Ascending => {
                groups.sort_by_key(|group| group.iter().map(age_of).min());
            }
            ImmuneOrder::Descending => {
                groups.sort_by_key(|group| std::cmp::Reverse(group.iter().map(age_of).max()));
            }
        }

        let mut immunized = FxHashSet::default();
        for group in groups {
            if immunized.len() >= n_immune {
                break;
            }
            for i_person in group {
                if !self.rng.random_bool(params.immune_compliance) {
                    continue;
                }
                let delay = match params.people_per_day {
                    0 => 0,
                    per_day => (immunized.len() / per_day) as u64,
                };
                let effective_date = self
                    .date
                    .checked_add_days(Days::new(delay))
                    .context("immunization date is out of range")?;
                let person = &mut self.world.all_people_mut()[i_person];
                if let Some(event) = person.immunize(self.date, effective_date) {
                    self.events.push(event);
                }
                immunized.insert(i_person);
            }
        }
        Ok(immunized)
    }

    /// Infect up to `num_infected` persons drawn uniformly from `candidates`.
    fn infect_selected(&mut self, candidates: Vec<usize>, num_infected: usize) -> Result<()> {
        if num_infected > candidates.len() {
            log::warn!(
                "requested {num_infected} infected persons but only {} are eligible",
                candidates.len()
            );
        }
        let infected: Vec<usize> = candidates
            .choose_multiple(&mut self.rng, num_infected.min(candidates.len()))
            .copied()
            .collect();

        let date = self.date;
        for &i_person in &infected {
            let person = &mut self.world.all_people_mut()[i_person];
            let event = person.infect(
                date,
                DiseaseState::IncubatingPostLatent,
                Cause::Seeded,
                &self.model,
                &mut self.rng,
            )?;
            self.events.extend(event);
        }
        log::info!("infected {} persons", infected.len());
        Ok(())
    }
}
