use crate::disease::{DiseaseState, DwellTime};
use crate::environment::EnvironmentKind;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Parameter overrides, keyed by dotted config path (e.g. `"disease.infectiousness.critical"`).
pub type Overrides = BTreeMap<String, toml::Value>;

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Disease progression parameters.
    pub disease: DiseaseParams,
    /// Contact parameters per environment kind.
    pub contact: ContactParams,
    /// Population generation parameters.
    pub generation: GenerationParams,
    /// Initial infection/immunization parameters.
    pub seeding: SeedingParams,
    /// Daily loop parameters.
    pub run: RunParams,
    /// Daily hooks, invoked in the listed order.
    #[serde(default)]
    pub extensions: Vec<ExtensionParams>,
}

/// Per-stage parameter table.
///
/// Every active stage must be present; lookups of a missing stage are configuration errors.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageTable<T> {
    pub latent: Option<T>,
    pub incubating_post_latent: Option<T>,
    pub asymptomatic: Option<T>,
    pub symptomatic_infectious: Option<T>,
    pub critical: Option<T>,
}

impl<T> StageTable<T> {
    /// Get the parameter configured for `state`.
    pub fn get(&self, state: DiseaseState) -> Result<&T> {
        let entry = match state {
            DiseaseState::Latent => &self.latent,
            DiseaseState::IncubatingPostLatent => &self.incubating_post_latent,
            DiseaseState::Asymptomatic => &self.asymptomatic,
            DiseaseState::SymptomaticInfectious => &self.symptomatic_infectious,
            DiseaseState::Critical => &self.critical,
            _ => bail!("stage {state:?} takes no parameters"),
        };
        entry
            .as_ref()
            .with_context(|| format!("stage {state:?} is not configured"))
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiseaseParams {
    /// Infectiousness multiplier per stage.
    pub infectiousness: StageTable<f64>,
    /// Dwell-time distribution per stage.
    pub dwell_time: StageTable<DwellTime>,
    /// Case severity probabilities per age category.
    pub severity: SeverityParams,
}

/// Case severity probabilities, indexed by age category.
///
/// The last entry of each vector covers every older category.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityParams {
    pub prob_symptomatic: Vec<f64>,
    pub prob_critical: Vec<f64>,
    pub prob_death: Vec<f64>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactParams {
    pub household: EnvironmentParams,
    pub workplace: EnvironmentParams,
    pub neighborhood: EnvironmentParams,
    pub city: EnvironmentParams,
    /// Whether workplaces are attended on Saturdays and Sundays.
    #[serde(default = "default_true")]
    pub workplace_weekends: bool,
}

impl ContactParams {
    pub fn get(&self, kind: EnvironmentKind) -> &EnvironmentParams {
        match kind {
            EnvironmentKind::Household => &self.household,
            EnvironmentKind::Workplace => &self.workplace,
            EnvironmentKind::Neighborhood => &self.neighborhood,
            EnvironmentKind::City => &self.city,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentParams {
    /// Probability of contact between any two co-present people.
    pub contact_prob: f64,
    /// Fraction of the day spent in the environment.
    #[serde(default = "default_duration")]
    pub duration: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParams {
    /// Number of households grouped into one neighborhood.
    pub households_per_neighborhood: usize,
    pub min_working_age: u32,
    pub max_working_age: u32,
    /// Fraction of working-age people assigned to a workplace.
    pub employment_rate: f64,
    /// Accepted distance between generated and target distributions.
    pub tolerance: f64,
    /// Maximum number of sampling attempts per distribution.
    pub max_retries: usize,
    /// Fail instead of warning when the tolerance is violated.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedingStrategy {
    Random,
    ImmuneHouseholds,
}

/// Order in which selected persons are immunized.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImmuneOrder {
    #[default]
    Random,
    Ascending,
    Descending,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedingParams {
    pub strategy: SeedingStrategy,
    pub num_infected: usize,
    #[serde(default)]
    pub per_to_immune: f64,
    /// Restrict seeding to the residents of this city.
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub min_age: u32,
    /// Probability that a person selected for immunization accepts it.
    #[serde(default = "default_one")]
    pub immune_compliance: f64,
    #[serde(default)]
    pub order: ImmuneOrder,
    /// Immunizations taking effect per day; zero immunizes everyone at once.
    #[serde(default)]
    pub people_per_day: usize,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunParams {
    pub initial_date: NaiveDate,
    pub max_days: usize,
    /// Stop as soon as nobody is in an active disease stage.
    #[serde(default = "default_true")]
    pub stop_early: bool,
    /// Base seed; sample `i` uses `seed + i`.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ExtensionParams {
    ImmuneByAge {
        immune_portion: f64,
        #[serde(default)]
        start_age: u32,
        #[serde(default = "default_band_width")]
        band_width: u32,
    },
    DailyImmunization {
        people_per_day: usize,
        #[serde(default)]
        min_age: u32,
    },
}

fn default_true() -> bool {
    true
}

fn default_one() -> f64 {
    1.0
}

fn default_duration() -> f64 {
    1.0
}

fn default_band_width() -> u32 {
    10
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        Self::from_file_with_overrides(file, &Overrides::new())
    }

    /// Load a [`Config`] from a file, applying `overrides` before validation.
    pub fn from_file_with_overrides<P: AsRef<Path>>(file: P, overrides: &Overrides) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::parse(&contents, overrides)
    }

    /// Parse a [`Config`] from TOML text, applying `overrides` before validation.
    pub fn parse(contents: &str, overrides: &Overrides) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(contents).context("failed to parse config")?;

        for (path, value) in overrides {
            apply_override(&mut table, path, value.clone())
                .with_context(|| format!("failed to apply override {path:?}"))?;
        }

        let config: Config = toml::Value::Table(table)
            .try_into()
            .context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.disease
            .validate()
            .context("invalid disease parameters")?;

        for kind in EnvironmentKind::ALL {
            let params = self.contact.get(kind);
            check_num(params.contact_prob, 0.0..=1.0)
                .with_context(|| format!("invalid {kind} contact probability"))?;
            check_num(params.duration, 0.0..=1.0)
                .with_context(|| format!("invalid {kind} duration"))?;
        }

        let generation = &self.generation;
        check_num(generation.households_per_neighborhood, 1..1_000_000)
            .context("invalid number of households per neighborhood")?;
        check_num(generation.max_working_age, generation.min_working_age..150)
            .context("invalid working age range")?;
        check_num(generation.employment_rate, 0.0..=1.0).context("invalid employment rate")?;
        check_num(generation.tolerance, 0.0..1.0).context("invalid generation tolerance")?;
        check_num(generation.max_retries, 1..10_000).context("invalid maximum number of retries")?;

        let seeding = &self.seeding;
        check_num(seeding.per_to_immune, 0.0..=1.0).context("invalid immune fraction")?;
        check_num(seeding.immune_compliance, 0.0..=1.0).context("invalid immune compliance")?;

        check_num(self.run.max_days, 1..100_000).context("invalid maximum number of days")?;

        for (i_ext, ext) in self.extensions.iter().enumerate() {
            ext.validate()
                .with_context(|| format!("invalid extension {i_ext}"))?;
        }

        Ok(())
    }
}

impl ExtensionParams {
    fn validate(&self) -> Result<()> {
        match *self {
            ExtensionParams::ImmuneByAge {
                immune_portion,
                band_width,
                ..
            } => {
                check_num(immune_portion, 0.0..=1.0).context("invalid immune portion")?;
                check_num(band_width, 1..150).context("invalid band width")?;
            }
            ExtensionParams::DailyImmunization { people_per_day, .. } => {
                check_num(people_per_day, 1..usize::MAX)
                    .context("invalid number of people per day")?;
            }
        }
        Ok(())
    }
}

impl DiseaseParams {
    fn validate(&self) -> Result<()> {
        for state in DiseaseState::ACTIVE {
            let infectiousness = self.infectiousness.get(state)?;
            check_num(*infectiousness, 0.0..=1.0)
                .with_context(|| format!("invalid infectiousness of stage {state:?}"))?;
            self.dwell_time
                .get(state)?
                .validate()
                .with_context(|| format!("invalid dwell time of stage {state:?}"))?;
        }

        let severity = &self.severity;
        check_prob_vec(&severity.prob_symptomatic).context("invalid symptomatic probabilities")?;
        check_prob_vec(&severity.prob_critical).context("invalid critical probabilities")?;
        check_prob_vec(&severity.prob_death).context("invalid death probabilities")?;

        Ok(())
    }
}

fn apply_override(table: &mut toml::Table, path: &str, value: toml::Value) -> Result<()> {
    let mut keys: Vec<&str> = path.split('.').collect();
    let last = keys.pop().context("override path is empty")?;
    if last.is_empty() {
        bail!("override path must not end with a dot");
    }

    let mut table = table;
    for key in keys {
        table = table
            .get_mut(key)
            .and_then(toml::Value::as_table_mut)
            .with_context(|| format!("{key:?} is not a config table"))?;
    }
    table.insert(last.to_string(), value);

    Ok(())
}

pub fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

/// Check a non-empty vector of independent probabilities.
pub fn check_prob_vec(vec: &[f64]) -> Result<()> {
    if vec.is_empty() {
        bail!("vector must not be empty");
    }
    for (i_ele, &ele) in vec.iter().enumerate() {
        check_num(ele, 0.0..=1.0).with_context(|| format!("invalid element {i_ele}"))?;
    }
    Ok(())
}

/// Check a vector of non-negative weights with a positive sum.
pub fn check_weights(vec: &[f64]) -> Result<()> {
    if vec.iter().any(|&ele| ele < 0.0 || !ele.is_finite()) {
        bail!("weights must be finite and non-negative");
    }
    let sum: f64 = vec.iter().sum();
    if sum <= 0.0 {
        bail!("weights must have a positive sum, but sum to {sum}");
    }
    Ok(())
}
