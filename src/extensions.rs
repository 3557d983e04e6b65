use crate::config::ExtensionParams;
use crate::disease::DiseaseState;
use crate::simulation::{Extension, Simulation};
use anyhow::Result;
use rand::seq::IndexedRandom;

/// Build the daily hook described by `params`.
pub fn build(params: &ExtensionParams) -> Box<dyn Extension> {
    match *params {
        ExtensionParams::ImmuneByAge {
            immune_portion,
            start_age,
            band_width,
        } => Box::new(ImmuneByAge::new(immune_portion, start_age, band_width)),
        ExtensionParams::DailyImmunization {
            people_per_day,
            min_age,
        } => Box::new(DailyImmunization::new(people_per_day, min_age)),
    }
}

/// Immunize age bands, one band per day, until the immune share of the living population
/// reaches `immune_portion`.
pub struct ImmuneByAge {
    immune_portion: f64,
    band_start: u32,
    band_width: u32,
}

impl ImmuneByAge {
    pub fn new(immune_portion: f64, start_age: u32, band_width: u32) -> Self {
        Self {
            immune_portion,
            band_start: start_age,
            band_width,
        }
    }

    fn immune_share(sim: &Simulation) -> f64 {
        let counts = sim.world().count_states();
        let alive: usize = sim.world().all_people().len() - counts[DiseaseState::Deceased.index()];
        if alive == 0 {
            return 1.0;
        }
        counts[DiseaseState::Immune.index()] as f64 / alive as f64
    }
}

impl Extension for ImmuneByAge {
    fn end_of_day_processing(&mut self, sim: &mut Simulation) -> Result<()> {
        if Self::immune_share(sim) >= self.immune_portion {
            return Ok(());
        }

        let date = sim.date();
        let band = self.band_start..self.band_start.saturating_add(self.band_width);
        let events: Vec<_> = sim
            .world_mut()
            .all_people_mut()
            .iter_mut()
            .filter(|person| band.contains(&person.age()))
            .filter_map(|person| person.immunize(date, date))
            .collect();
        log::debug!("{date}: immunized {} persons aged {band:?}", events.len());
        sim.register_events(events);

        self.band_start = band.end;
        Ok(())
    }
}

/// Immunize up to `people_per_day` random susceptible persons every morning.
pub struct DailyImmunization {
    people_per_day: usize,
    min_age: u32,
}

impl DailyImmunization {
    pub fn new(people_per_day: usize, min_age: u32) -> Self {
        Self {
            people_per_day,
            min_age,
        }
    }
}

impl Extension for DailyImmunization {
    fn start_of_day_processing(&mut self, sim: &mut Simulation) -> Result<()> {
        let candidates: Vec<usize> = sim
            .world()
            .all_people()
            .iter()
            .enumerate()
            .filter(|(_, person)| {
                person.state() == DiseaseState::Susceptible && person.age() >= self.min_age
            })
            .map(|(i_person, _)| i_person)
            .collect();
        let chosen: Vec<usize> = candidates
            .choose_multiple(sim.rng_mut(), self.people_per_day)
            .copied()
            .collect();

        let date = sim.date();
        let people = sim.world_mut().all_people_mut();
        let events: Vec<_> = chosen
            .into_iter()
            .filter_map(|i_person| people[i_person].immunize(date, date))
            .collect();
        sim.register_events(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::disease::DiseaseModel;
    use crate::person::{Person, PersonId};
    use crate::world::World;
    use chrono::NaiveDate;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn simulation(ages: &[u32]) -> Simulation {
        let cfg = test_config();
        let people = ages
            .iter()
            .enumerate()
            .map(|(id, &age)| Person::new(PersonId(id as u32), age, 0))
            .collect();
        let world = World::new(people, Vec::new(), vec!["test".into()], 1.0).unwrap();
        let model = DiseaseModel::new(&cfg.disease).unwrap();
        Simulation::new(
            world,
            model,
            cfg.contact,
            NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(),
            ChaCha12Rng::seed_from_u64(3),
        )
    }

    fn immune_ages(sim: &Simulation) -> Vec<u32> {
        sim.world()
            .all_people()
            .iter()
            .filter(|person| person.state() == DiseaseState::Immune)
            .map(Person::age)
            .collect()
    }

    #[test]
    fn immune_by_age_advances_one_band_per_day() {
        let mut sim = simulation(&[5, 15, 25, 35, 45, 55, 65, 75]);
        sim.register_extension(Box::new(ImmuneByAge::new(0.5, 0, 10)));

        sim.tick().unwrap();
        assert_eq!(immune_ages(&sim), vec![5]);
        sim.tick().unwrap();
        assert_eq!(immune_ages(&sim), vec![5, 15]);

        sim.tick().unwrap();
        sim.tick().unwrap();
        assert_eq!(immune_ages(&sim), vec![5, 15, 25, 35]);

        // The target share is reached, so no further bands are immunized.
        sim.tick().unwrap();
        sim.tick().unwrap();
        assert_eq!(immune_ages(&sim).len(), 4);
        assert_eq!(sim.events().len(), 4);
        assert!(sim.events().iter().all(|event| event.to == DiseaseState::Immune));
    }

    #[test]
    fn daily_immunization_respects_capacity_and_age() {
        let mut sim = simulation(&[10, 20, 30, 40, 50, 60, 70]);
        sim.register_extension(build(&ExtensionParams::DailyImmunization {
            people_per_day: 2,
            min_age: 30,
        }));

        sim.tick().unwrap();
        assert_eq!(immune_ages(&sim).len(), 2);
        sim.tick().unwrap();
        assert_eq!(immune_ages(&sim).len(), 4);
        sim.tick().unwrap();
        let ages = immune_ages(&sim);
        assert_eq!(ages, vec![30, 40, 50, 60, 70]);
    }
}
