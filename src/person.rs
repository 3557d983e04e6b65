use crate::disease::{DiseaseModel, DiseaseState};
use crate::environment::EnvId;
use crate::event::{Cause, Event};
use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width in years of an age category.
pub const AGE_CATEGORY_WIDTH: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonId(pub u32);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "person-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scheduled {
    date: NaiveDate,
    /// Forced target; `None` lets the disease model choose when the transition fires.
    target: Option<DiseaseState>,
}

/// Person of the simulated population.
///
/// A person references the environments it belongs to but does not own them.
#[derive(Debug, Clone)]
pub struct Person {
    id: PersonId,
    age: u32,
    city: usize,
    state: DiseaseState,
    scheduled: Option<Scheduled>,
    environments: Vec<EnvId>,
}

impl Person {
    /// Create a new susceptible person living in the city with index `city`.
    pub fn new(id: PersonId, age: u32, city: usize) -> Self {
        Self {
            id,
            age,
            city,
            state: DiseaseState::Susceptible,
            scheduled: None,
            environments: Vec::new(),
        }
    }

    pub fn id(&self) -> PersonId {
        self.id
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn age_category(&self) -> usize {
        (self.age / AGE_CATEGORY_WIDTH) as usize
    }

    pub fn city(&self) -> usize {
        self.city
    }

    pub fn state(&self) -> DiseaseState {
        self.state
    }

    /// Date at which the next scheduled transition fires, if any.
    pub fn next_transition_date(&self) -> Option<NaiveDate> {
        self.scheduled.map(|scheduled| scheduled.date)
    }

    pub fn environments(&self) -> &[EnvId] {
        &self.environments
    }

    pub fn add_environment(&mut self, env: EnvId) {
        self.environments.push(env);
    }

    /// Start the disease course of a susceptible person at `state`.
    ///
    /// Returns `None` if the person is no longer susceptible.
    pub fn infect<R: Rng>(
        &mut self,
        date: NaiveDate,
        state: DiseaseState,
        cause: Cause,
        model: &DiseaseModel,
        rng: &mut R,
    ) -> Result<Option<Event>> {
        if self.state != DiseaseState::Susceptible {
            return Ok(None);
        }
        DiseaseModel::check_transition(self.state, state)?;

        // An infection supersedes any immunization that has not taken effect yet.
        self.scheduled = None;
        Ok(Some(self.enter(date, state, cause, model, rng)?))
    }

    /// Make a susceptible person immune from `effective_date` on.
    ///
    /// If the date has already arrived the transition happens now and its event is returned;
    /// otherwise it is scheduled and reported when it fires.
    pub fn immunize(&mut self, date: NaiveDate, effective_date: NaiveDate) -> Option<Event> {
        if self.state != DiseaseState::Susceptible {
            return None;
        }
        if effective_date > date {
            self.scheduled = Some(Scheduled {
                date: effective_date,
                target: Some(DiseaseState::Immune),
            });
            return None;
        }

        self.scheduled = None;
        self.state = DiseaseState::Immune;
        Some(Event::new(
            date,
            self.id,
            DiseaseState::Susceptible,
            DiseaseState::Immune,
            Cause::Immunization,
        ))
    }

    /// Whether a scheduled transition fires on `date`.
    pub fn is_due(&self, date: NaiveDate) -> bool {
        self.scheduled.is_some_and(|scheduled| scheduled.date <= date)
    }

    /// Fire the scheduled transition if it is due on `date`.
    pub fn advance<R: Rng>(
        &mut self,
        date: NaiveDate,
        model: &DiseaseModel,
        rng: &mut R,
    ) -> Result<Option<Event>> {
        let Some(scheduled) = self.scheduled.filter(|scheduled| scheduled.date <= date) else {
            return Ok(None);
        };
        self.scheduled = None;

        let (next, cause) = match scheduled.target {
            Some(target) => (target, Cause::Immunization),
            None => match model.next_state(self.state, self.age_category(), rng) {
                Some(next) => (next, Cause::Progression),
                None => return Ok(None),
            },
        };
        DiseaseModel::check_transition(self.state, next)
            .with_context(|| format!("invalid transition of {}", self.id))?;

        Ok(Some(self.enter(date, next, cause, model, rng)?))
    }

    fn enter<R: Rng>(
        &mut self,
        date: NaiveDate,
        next: DiseaseState,
        cause: Cause,
        model: &DiseaseModel,
        rng: &mut R,
    ) -> Result<Event> {
        let event = Event::new(date, self.id, self.state, next, cause);
        self.state = next;

        if next.is_active() {
            let days = model.dwell_time(next, rng)?;
            let date = date
                .checked_add_days(Days::new(u64::from(days)))
                .context("transition date is out of range")?;
            self.scheduled = Some(Scheduled { date, target: None });
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, day).unwrap()
    }

    #[test]
    fn age_category_uses_ten_year_bands() {
        assert_eq!(Person::new(PersonId(0), 9, 0).age_category(), 0);
        assert_eq!(Person::new(PersonId(1), 10, 0).age_category(), 1);
        assert_eq!(Person::new(PersonId(2), 87, 0).age_category(), 8);
    }

    #[test]
    fn infection_schedules_next_transition() {
        let model = DiseaseModel::new(&test_config().disease).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let mut person = Person::new(PersonId(0), 30, 0);

        let event = person
            .infect(date(1), DiseaseState::Latent, Cause::Seeded, &model, &mut rng)
            .unwrap()
            .unwrap();
        assert_eq!(event.from, DiseaseState::Susceptible);
        assert_eq!(event.to, DiseaseState::Latent);

        let next = person.next_transition_date().unwrap();
        assert!(next >= date(3) && next <= date(5));
        assert!(!person.is_due(date(2)));

        // A second infection is a no-op.
        let again = person
            .infect(date(2), DiseaseState::Latent, Cause::Seeded, &model, &mut rng)
            .unwrap();
        assert!(again.is_none());

        let event = person.advance(next, &model, &mut rng).unwrap().unwrap();
        assert_eq!(event.to, DiseaseState::IncubatingPostLatent);
        assert_eq!(event.cause, Cause::Progression);
    }

    #[test]
    fn scheduled_immunization_fires_on_effective_date() {
        let model = DiseaseModel::new(&test_config().disease).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(6);
        let mut person = Person::new(PersonId(0), 30, 0);

        assert!(person.immunize(date(1), date(4)).is_none());
        assert_eq!(person.state(), DiseaseState::Susceptible);
        assert!(person.advance(date(3), &model, &mut rng).unwrap().is_none());

        let event = person.advance(date(4), &model, &mut rng).unwrap().unwrap();
        assert_eq!(event.to, DiseaseState::Immune);
        assert_eq!(event.cause, Cause::Immunization);
        assert_eq!(person.next_transition_date(), None);
        assert!(person.immunize(date(5), date(5)).is_none());
    }

    #[test]
    fn infection_supersedes_pending_immunization() {
        let model = DiseaseModel::new(&test_config().disease).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let mut person = Person::new(PersonId(0), 30, 0);

        person.immunize(date(1), date(10));
        person
            .infect(date(2), DiseaseState::Latent, Cause::Seeded, &model, &mut rng)
            .unwrap();
        assert_eq!(person.state(), DiseaseState::Latent);
        assert!(person.next_transition_date().unwrap() < date(10));
    }
}
