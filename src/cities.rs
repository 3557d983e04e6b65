use crate::config::{check_num, check_weights};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Name selecting every registered city.
pub const ALL_CITIES: &str = "all";

/// Aggregate population statistics of one city.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CityData {
    pub name: String,
    pub population: usize,
    /// Age histogram.
    pub age_groups: Vec<AgeGroup>,
    /// Weights of household sizes `1..=household_sizes.len()`.
    pub household_sizes: Vec<f64>,
    /// Workplace size histogram; empty when the city has no workplace data.
    #[serde(default)]
    pub workplace_sizes: Vec<SizeBucket>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgeGroup {
    pub min_age: u32,
    pub max_age: u32,
    pub weight: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeBucket {
    pub min: usize,
    pub max: usize,
    pub weight: f64,
}

impl CityData {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.eq_ignore_ascii_case(ALL_CITIES) {
            bail!("city name {:?} is reserved", self.name);
        }
        check_num(self.population, 1..100_000_000).context("invalid population")?;

        if self.age_groups.is_empty() {
            bail!("age distribution must not be empty");
        }
        for (i_group, group) in self.age_groups.iter().enumerate() {
            check_num(group.max_age, group.min_age..150)
                .with_context(|| format!("invalid age group {i_group}"))?;
        }
        let weights: Vec<_> = self.age_groups.iter().map(|group| group.weight).collect();
        check_weights(&weights).context("invalid age distribution")?;

        check_weights(&self.household_sizes).context("invalid household size distribution")?;

        if !self.workplace_sizes.is_empty() {
            for (i_bucket, bucket) in self.workplace_sizes.iter().enumerate() {
                check_num(bucket.min, 1..1_000_000)
                    .with_context(|| format!("invalid workplace size bucket {i_bucket}"))?;
                check_num(bucket.max, bucket.min..1_000_000)
                    .with_context(|| format!("invalid workplace size bucket {i_bucket}"))?;
            }
            let weights: Vec<_> = self.workplace_sizes.iter().map(|b| b.weight).collect();
            check_weights(&weights).context("invalid workplace size distribution")?;
        }

        Ok(())
    }
}

/// City metadata lookup, loaded from a TOML file of `[[city]]` tables.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CityRegistry {
    #[serde(rename = "city")]
    cities: Vec<CityData>,
}

impl CityRegistry {
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let registry: CityRegistry =
            toml::from_str(contents).context("failed to deserialize cities")?;

        for (i_city, city) in registry.cities.iter().enumerate() {
            city.validate()
                .with_context(|| format!("invalid city {i_city} ({:?})", city.name))?;
            if registry.cities[..i_city]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&city.name))
            {
                bail!("city {:?} is defined twice", city.name);
            }
        }

        Ok(registry)
    }

    /// Look up a city by name (case-insensitive).
    pub fn get_city_by_name(&self, name: &str) -> Result<&CityData> {
        self.cities
            .iter()
            .find(|city| city.name.eq_ignore_ascii_case(name))
            .with_context(|| format!("no population data for city {name:?}"))
    }

    /// Cities selected by `name`, where [`ALL_CITIES`] selects every city.
    pub fn select(&self, name: &str) -> Result<Vec<&CityData>> {
        if name.eq_ignore_ascii_case(ALL_CITIES) {
            if self.cities.is_empty() {
                bail!("no cities are registered");
            }
            return Ok(self.cities.iter().collect());
        }
        Ok(vec![self.get_city_by_name(name)?])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const TEST_CITIES: &str = r#"
[[city]]
name = "Rivertown"
population = 2000
household_sizes = [0.2, 0.3, 0.2, 0.2, 0.1]
age_groups = [
    { min_age = 0, max_age = 17, weight = 0.3 },
    { min_age = 18, max_age = 64, weight = 0.55 },
    { min_age = 65, max_age = 95, weight = 0.15 },
]
workplace_sizes = [
    { min = 2, max = 9, weight = 0.6 },
    { min = 10, max = 49, weight = 0.4 },
]

[[city]]
name = "Hillside"
population = 500
household_sizes = [0.5, 0.5]
age_groups = [{ min_age = 18, max_age = 80, weight = 1.0 }]
"#;

    pub fn test_cities() -> CityRegistry {
        CityRegistry::parse(TEST_CITIES).expect("test cities must be valid")
    }

    #[test]
    fn looks_up_cities_by_name() {
        let registry = test_cities();
        assert_eq!(registry.get_city_by_name("rivertown").unwrap().population, 2000);
        assert!(registry.get_city_by_name("Nowhere").is_err());
        assert_eq!(registry.select("all").unwrap().len(), 2);
        assert_eq!(registry.select("Hillside").unwrap()[0].name, "Hillside");
    }

    #[test]
    fn rejects_malformed_distributions() {
        let contents = TEST_CITIES.replace("[0.5, 0.5]", "[0.0, 0.0]");
        assert!(CityRegistry::parse(&contents).is_err());

        let contents = TEST_CITIES.replace("min_age = 65, max_age = 95", "min_age = 65, max_age = 20");
        assert!(CityRegistry::parse(&contents).is_err());
    }
}
