//! Population generator.
//!
//! Builds the people and the environment hierarchy of a [`World`] from aggregate city
//! statistics. Every distribution is drawn up to `max_retries` times and the sample closest
//! to its target (in total variation distance) is kept.

use crate::cities::CityData;
use crate::config::{ContactParams, GenerationParams};
use crate::environment::{EnvId, Environment, EnvironmentKind};
use crate::person::{Person, PersonId};
use crate::world::World;
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::weighted::WeightedIndex;

/// Minimum age of a household head.
pub const ADULT_AGE: u32 = 18;

/// Generate a [`World`] containing the scaled population of every city in `cities`.
pub fn generate_world<R: Rng>(
    cities: &[&CityData],
    scale: f64,
    params: &GenerationParams,
    contact: &ContactParams,
    rng: &mut R,
) -> Result<World> {
    if !(scale > 0.0 && scale.is_finite()) {
        bail!("scaling factor must be positive, but is {scale}");
    }

    let mut generator = Generator {
        params,
        contact,
        rng,
        people: Vec::new(),
        environments: Vec::new(),
    };
    for (i_city, city) in cities.iter().enumerate() {
        generator
            .generate_city(i_city, city, scale)
            .with_context(|| format!("failed to generate city {:?}", city.name))?;
    }

    let names = cities.iter().map(|city| city.name.clone()).collect();
    World::new(generator.people, generator.environments, names, scale)
}

struct Generator<'a, R> {
    params: &'a GenerationParams,
    contact: &'a ContactParams,
    rng: &'a mut R,
    people: Vec<Person>,
    environments: Vec<Environment>,
}

impl<R: Rng> Generator<'_, R> {
    fn generate_city(&mut self, i_city: usize, city: &CityData, scale: f64) -> Result<()> {
        let n_people = (city.population as f64 * scale).round() as usize;
        if n_people == 0 {
            bail!("scaled population is empty");
        }

        let ages = self.sample_ages(city, n_people)?;
        let first = self.people.len();
        for age in ages {
            let id = PersonId(self.people.len() as u32);
            self.people.push(Person::new(id, age, i_city));
        }
        let residents: Vec<usize> = (first..self.people.len()).collect();

        let households = self.partition_households(city, &residents)?;
        for members in &households {
            self.add_environment(EnvironmentKind::Household, i_city, members);
        }

        let mut n_neighborhoods = 0;
        for chunk in households.chunks(self.params.households_per_neighborhood) {
            let members: Vec<usize> = chunk.iter().flatten().copied().collect();
            self.add_environment(EnvironmentKind::Neighborhood, i_city, &members);
            n_neighborhoods += 1;
        }

        let workplaces = self.assign_workplaces(city, &residents)?;
        for members in &workplaces {
            self.add_environment(EnvironmentKind::Workplace, i_city, members);
        }

        self.add_environment(EnvironmentKind::City, i_city, &residents);

        log::info!(
            "generated {:?}: {n_people} people, {} households, {} workplaces, {n_neighborhoods} neighborhoods",
            city.name,
            households.len(),
            workplaces.len(),
        );

        Ok(())
    }

    fn add_environment(&mut self, kind: EnvironmentKind, city: usize, members: &[usize]) -> EnvId {
        let id = EnvId(self.environments.len() as u32);
        let contact_prob = self.contact.get(kind).contact_prob;
        let mut env = Environment::new(id, kind, city, contact_prob);
        for &i_person in members {
            let person = &mut self.people[i_person];
            env.add_member(person.id());
            person.add_environment(id);
        }
        self.environments.push(env);
        id
    }

    fn sample_ages(&mut self, city: &CityData, n_people: usize) -> Result<Vec<u32>> {
        let weights: Vec<_> = city.age_groups.iter().map(|group| group.weight).collect();
        let group_dist = WeightedIndex::new(&weights)?;
        let age_dists = city
            .age_groups
            .iter()
            .map(|group| rand_distr::Uniform::new_inclusive(group.min_age, group.max_age))
            .collect::<Result<Vec<_>, _>>()?;

        sample_matching(&mut *self.rng, self.params, "age distribution", |rng| {
            let mut counts = vec![0; weights.len()];
            let mut ages = Vec::with_capacity(n_people);
            for _ in 0..n_people {
                let i_group = group_dist.sample(rng);
                counts[i_group] += 1;
                ages.push(age_dists[i_group].sample(rng));
            }
            let distance = total_variation(&counts, &weights);
            (ages, distance)
        })
    }

    /// Split `residents` into households, heading each one with an adult while any remain.
    fn partition_households(&mut self, city: &CityData, residents: &[usize]) -> Result<Vec<Vec<usize>>> {
        let n_people = residents.len();
        let weights = &city.household_sizes;
        let size_dist = WeightedIndex::new(weights)?;

        let sizes = sample_matching(&mut *self.rng, self.params, "household size distribution", |rng| {
            let mut counts = vec![0; weights.len()];
            let mut sizes = Vec::new();
            let mut n_placed = 0;
            while n_placed < n_people {
                // The last household absorbs the remainder.
                let size = (size_dist.sample(rng) + 1).min(n_people - n_placed);
                counts[size - 1] += 1;
                sizes.push(size);
                n_placed += size;
            }
            let distance = total_variation(&counts, weights);
            (sizes, distance)
        })?;

        let (mut adults, mut minors): (Vec<usize>, Vec<usize>) = residents
            .iter()
            .partition(|&&i_person| self.people[i_person].age() >= ADULT_AGE);
        adults.shuffle(&mut *self.rng);
        minors.shuffle(&mut *self.rng);

        let mut households: Vec<Vec<usize>> =
            sizes.iter().map(|&size| Vec::with_capacity(size)).collect();
        for household in &mut households {
            match adults.pop() {
                Some(head) => household.push(head),
                None => break,
            }
        }

        let mut pool = adults;
        pool.append(&mut minors);
        pool.shuffle(&mut *self.rng);
        for (household, &size) in households.iter_mut().zip(&sizes) {
            while household.len() < size {
                let i_person = pool.pop().context("ran out of residents to place")?;
                household.push(i_person);
            }
        }

        Ok(households)
    }

    fn assign_workplaces(&mut self, city: &CityData, residents: &[usize]) -> Result<Vec<Vec<usize>>> {
        if city.workplace_sizes.is_empty() {
            return Ok(Vec::new());
        }

        let working_ages = self.params.min_working_age..=self.params.max_working_age;
        let mut workers = Vec::new();
        for &i_person in residents {
            if working_ages.contains(&self.people[i_person].age())
                && self.rng.random_bool(self.params.employment_rate)
            {
                workers.push(i_person);
            }
        }
        if workers.is_empty() {
            log::warn!("{:?} has no workers", city.name);
            return Ok(Vec::new());
        }
        workers.shuffle(&mut *self.rng);

        let weights: Vec<_> = city.workplace_sizes.iter().map(|bucket| bucket.weight).collect();
        let bucket_dist = WeightedIndex::new(&weights)?;
        let n_workers = workers.len();

        let sizes = sample_matching(&mut *self.rng, self.params, "workplace size distribution", |rng| {
            let mut counts = vec![0; weights.len()];
            let mut sizes = Vec::new();
            let mut n_placed = 0;
            while n_placed < n_workers {
                let i_bucket = bucket_dist.sample(rng);
                let bucket = &city.workplace_sizes[i_bucket];
                let size = rng.random_range(bucket.min..=bucket.max).min(n_workers - n_placed);
                counts[i_bucket] += 1;
                sizes.push(size);
                n_placed += size;
            }
            let distance = total_variation(&counts, &weights);
            (sizes, distance)
        })?;

        let mut workplaces = Vec::with_capacity(sizes.len());
        let mut rest = workers.as_slice();
        for size in sizes {
            let (members, tail) = rest.split_at(size);
            workplaces.push(members.to_vec());
            rest = tail;
        }

        Ok(workplaces)
    }
}

/// Draw samples until one is within tolerance, keeping the closest one.
///
/// A sample outside the tolerance is a warning, or an error in strict mode.
fn sample_matching<T, R, F>(rng: &mut R, params: &GenerationParams, what: &str, mut draw: F) -> Result<T>
where
    R: Rng,
    F: FnMut(&mut R) -> (T, f64),
{
    let mut best: Option<(T, f64)> = None;
    for _ in 0..params.max_retries {
        let (sample, distance) = draw(rng);
        if best.as_ref().is_none_or(|(_, best_distance)| distance < *best_distance) {
            best = Some((sample, distance));
        }
        if distance <= params.tolerance {
            break;
        }
    }
    let (sample, distance) = best.context("no sample was drawn")?;

    if distance > params.tolerance {
        let tolerance = params.tolerance;
        if params.strict {
            bail!("{what} deviates from its target by {distance:.4} (tolerance: {tolerance})");
        }
        log::warn!("{what} deviates from its target by {distance:.4} (tolerance: {tolerance})");
    }

    Ok(sample)
}

/// Total variation distance between a histogram and (unnormalized) target weights.
fn total_variation(counts: &[usize], weights: &[f64]) -> f64 {
    let n_total: usize = counts.iter().sum();
    let weight_sum: f64 = weights.iter().sum();
    if n_total == 0 {
        return 1.0;
    }
    0.5 * counts
        .iter()
        .zip(weights)
        .map(|(&count, &weight)| (count as f64 / n_total as f64 - weight / weight_sum).abs())
        .sum::<f64>()
}
