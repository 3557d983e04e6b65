use crate::disease::DiseaseState;
use crate::environment::{EnvId, Environment, EnvironmentKind};
use crate::person::{Person, PersonId};
use anyhow::{Context, Result, bail};
use rustc_hash::{FxHashMap, FxHashSet};

/// Registry of all people and environments of one run.
///
/// Environment ids are dense: the environment with id `i` is stored at index `i`.
pub struct World {
    people: Vec<Person>,
    environments: Vec<Environment>,
    person_index: FxHashMap<PersonId, usize>,
    cities: Vec<String>,
    scale: f64,
}

impl World {
    /// Create a new `World`, checking that every reference resolves inside it.
    pub fn new(
        people: Vec<Person>,
        environments: Vec<Environment>,
        cities: Vec<String>,
        scale: f64,
    ) -> Result<Self> {
        let mut person_index = FxHashMap::default();
        person_index.reserve(people.len());
        for (i_person, person) in people.iter().enumerate() {
            if person_index.insert(person.id(), i_person).is_some() {
                bail!("duplicate {}", person.id());
            }
            if person.city() >= cities.len() {
                bail!("{} lives in unknown city {}", person.id(), person.city());
            }
            for env in person.environments() {
                if env.index() >= environments.len() {
                    bail!("{} belongs to unknown environment {}", person.id(), env.0);
                }
            }
        }

        for (i_env, env) in environments.iter().enumerate() {
            if env.id() != EnvId(i_env as u32) {
                bail!("environment {} is stored at index {i_env}", env.id().0);
            }
            if env.city() >= cities.len() {
                bail!("environment {i_env} is in unknown city {}", env.city());
            }
            let referenced = env
                .members()
                .iter()
                .chain(env.get_people().iter().map(|entry| &entry.person));
            for person in referenced {
                if !person_index.contains_key(person) {
                    bail!("environment {i_env} references unregistered {person}");
                }
            }
        }

        let memberships: FxHashSet<(EnvId, PersonId)> = environments
            .iter()
            .flat_map(|env| env.members().iter().map(|&person| (env.id(), person)))
            .collect();
        for person in &people {
            for &env in person.environments() {
                if !memberships.contains(&(env, person.id())) {
                    bail!("{} is not a member of environment {}", person.id(), env.0);
                }
            }
        }

        Ok(Self {
            people,
            environments,
            person_index,
            cities,
            scale,
        })
    }

    pub fn get_person_from_id(&self, id: PersonId) -> Option<&Person> {
        self.person_index.get(&id).map(|&i_person| &self.people[i_person])
    }

    pub fn get_person_mut(&mut self, id: PersonId) -> Option<&mut Person> {
        self.person_index
            .get(&id)
            .map(|&i_person| &mut self.people[i_person])
    }

    /// Position of the person in [`World::all_people`].
    pub fn index_of(&self, id: PersonId) -> Option<usize> {
        self.person_index.get(&id).copied()
    }

    pub fn state_of(&self, id: PersonId) -> Option<DiseaseState> {
        self.get_person_from_id(id).map(Person::state)
    }

    pub fn all_people(&self) -> &[Person] {
        &self.people
    }

    pub fn all_people_mut(&mut self) -> &mut [Person] {
        &mut self.people
    }

    pub fn all_environments(&self) -> &[Environment] {
        &self.environments
    }

    /// Borrow people and environments at the same time.
    pub fn people_and_environments_mut(&mut self) -> (&[Person], &mut [Environment]) {
        (&self.people, &mut self.environments)
    }

    pub fn city_names(&self) -> &[String] {
        &self.cities
    }

    /// Index of the city called `name` (case-insensitive).
    pub fn city_index(&self, name: &str) -> Result<usize> {
        self.cities
            .iter()
            .position(|city| city.eq_ignore_ascii_case(name))
            .with_context(|| format!("world has no city named {name:?}"))
    }

    /// Scaling factor the population was generated with.
    pub fn generating_scale(&self) -> f64 {
        self.scale
    }

    /// Environments of `kind`, optionally restricted to one city.
    pub fn environments_of_kind(
        &self,
        kind: EnvironmentKind,
        city: Option<usize>,
    ) -> impl Iterator<Item = &Environment> {
        self.environments
            .iter()
            .filter(move |env| env.kind() == kind && city.is_none_or(|city| env.city() == city))
    }

    pub fn get_all_city_households(&self, city: Option<usize>) -> Vec<&Environment> {
        self.environments_of_kind(EnvironmentKind::Household, city)
            .collect()
    }

    pub fn get_all_city_communities(&self, city: Option<usize>) -> Vec<&Environment> {
        self.environments_of_kind(EnvironmentKind::City, city)
            .collect()
    }

    /// Number of people in each disease state, indexed by [`DiseaseState::index`].
    pub fn count_states(&self) -> [usize; DiseaseState::COUNT] {
        let mut counts = [0; DiseaseState::COUNT];
        for person in &self.people {
            counts[person.state().index()] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people(n: u32) -> Vec<Person> {
        (0..n).map(|id| Person::new(PersonId(id), 20 + id, 0)).collect()
    }

    #[test]
    fn lookup_round_trips() {
        let mut env = Environment::new(EnvId(0), EnvironmentKind::Household, 0, 0.5);
        env.add_member(PersonId(1));
        let world = World::new(people(4), vec![env], vec!["test".into()], 1.0).unwrap();

        for person in world.all_people() {
            let found = world.get_person_from_id(person.id()).unwrap();
            assert_eq!(found.id(), person.id());
        }
        assert!(world.get_person_from_id(PersonId(4)).is_none());
        assert_eq!(world.all_people().len(), 4);
        assert_eq!(world.get_all_city_households(Some(0)).len(), 1);
        assert!(world.get_all_city_communities(None).is_empty());
        assert_eq!(world.city_index("TEST").unwrap(), 0);
        assert!(world.city_index("other").is_err());
    }

    #[test]
    fn rejects_duplicate_person_ids() {
        let mut people = people(3);
        people.push(Person::new(PersonId(1), 40, 0));
        assert!(World::new(people, Vec::new(), vec!["test".into()], 1.0).is_err());
    }

    #[test]
    fn rejects_unregistered_environment_members() {
        let mut env = Environment::new(EnvId(0), EnvironmentKind::Household, 0, 0.5);
        env.add_member(PersonId(7));
        assert!(World::new(people(3), vec![env], vec!["test".into()], 1.0).is_err());

        let mut env = Environment::new(EnvId(0), EnvironmentKind::Household, 0, 0.5);
        env.sign_up_for_today(PersonId(7), 1.0);
        assert!(World::new(people(3), vec![env], vec!["test".into()], 1.0).is_err());
    }

    #[test]
    fn rejects_environments_missing_their_members() {
        let mut people = people(3);
        people[2].add_environment(EnvId(0));
        let mut env = Environment::new(EnvId(0), EnvironmentKind::Household, 0, 0.5);
        env.add_member(PersonId(0));
        env.add_member(PersonId(1));
        assert!(World::new(people.clone(), vec![env.clone()], vec!["test".into()], 1.0).is_err());

        env.add_member(PersonId(2));
        assert!(World::new(people, vec![env], vec!["test".into()], 1.0).is_ok());
    }

    #[test]
    fn rejects_sparse_environment_ids() {
        let env = Environment::new(EnvId(3), EnvironmentKind::Household, 0, 0.5);
        assert!(World::new(people(3), vec![env], vec!["test".into()], 1.0).is_err());
    }
}
