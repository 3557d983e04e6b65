use crate::analysis::{Analyzer, ScenarioSummary, compare_scenarios};
use crate::cities::CityRegistry;
use crate::config::{Config, Overrides, check_num};
use crate::disease::DiseaseModel;
use crate::extensions;
use crate::generation::generate_world;
use crate::simulation::Simulation;
use crate::stats::SampleStatistics;
use anyhow::{Context, Result, anyhow, bail};
use glob::glob;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
};

/// Description of one scenario and how many samples to draw from it.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub scenario: String,
    /// City to simulate, or `"all"`.
    pub city: String,
    /// Population scaling factor.
    pub scale: f64,
    pub samples: usize,
    /// Run the samples on worker threads.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub overrides: Overrides,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobList {
    #[serde(rename = "job", default)]
    jobs: Vec<Job>,
}

impl Job {
    fn validate(&self, cities: &CityRegistry) -> Result<()> {
        let valid_name = !self.scenario.is_empty()
            && self
                .scenario
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            bail!("scenario name {:?} is not a valid directory name", self.scenario);
        }
        if !(self.scale > 0.0) {
            bail!("scaling factor must be positive, but is {}", self.scale);
        }
        check_num(self.samples, 1..100_000).context("invalid number of samples")?;
        cities.select(&self.city)?;
        Ok(())
    }
}

/// Parse a list of `[[job]]` tables.
pub fn parse_jobs(contents: &str, cities: &CityRegistry) -> Result<Vec<Job>> {
    let list: JobList = toml::from_str(contents).context("failed to deserialize jobs")?;
    for (i_job, job) in list.jobs.iter().enumerate() {
        job.validate(cities)
            .with_context(|| format!("invalid job {i_job} ({:?})", job.scenario))?;
        if list.jobs[..i_job]
            .iter()
            .any(|other| other.scenario == job.scenario)
        {
            bail!("scenario {:?} is defined twice", job.scenario);
        }
    }
    Ok(list.jobs)
}

/// Run one sample of `job` synchronously.
///
/// With a base seed configured, sample `sample_idx` is seeded with `seed + sample_idx`;
/// otherwise it is seeded from the OS.
pub fn run_sample(
    cfg: &Config,
    cities: &CityRegistry,
    job: &Job,
    sample_idx: usize,
) -> Result<SampleStatistics> {
    let seed = cfg.run.seed.map(|seed| seed.wrapping_add(sample_idx as u64));
    let mut rng = match seed {
        Some(seed) => ChaCha12Rng::seed_from_u64(seed),
        None => ChaCha12Rng::try_from_os_rng().context("failed to seed rng")?,
    };

    let selected = cities.select(&job.city)?;
    let world = generate_world(&selected, job.scale, &cfg.generation, &cfg.contact, &mut rng)
        .context("failed to generate world")?;
    log::info!(
        "generated {} people in {} environments",
        world.all_people().len(),
        world.all_environments().len()
    );
    let cities = world.city_names().to_vec();
    let scale = world.generating_scale();

    let model = DiseaseModel::new(&cfg.disease).context("failed to construct disease model")?;
    let mut sim = Simulation::new(
        world,
        model,
        cfg.contact.clone(),
        cfg.run.initial_date,
        rng,
    );
    for params in &cfg.extensions {
        sim.register_extension(extensions::build(params));
    }

    sim.seed(&cfg.seeding).context("failed to seed world")?;
    sim.run(cfg.run.max_days, cfg.run.stop_early)
        .context("failed to run simulation")?;

    log::info!(
        "simulated {} days with {} events",
        sim.days().len(),
        sim.events().len()
    );

    let (days, events) = sim.into_records();
    Ok(SampleStatistics {
        scenario: job.scenario.clone(),
        sample_idx,
        seed,
        cities,
        scale,
        initial_date: cfg.run.initial_date,
        days,
        events,
    })
}

pub struct Manager {
    sim_dir: PathBuf,
    cfg_contents: String,
    cities: CityRegistry,
    jobs: Vec<Job>,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg_file = sim_dir.join("config.toml");
        let cfg_contents =
            fs::read_to_string(&cfg_file).with_context(|| format!("failed to read {cfg_file:?}"))?;
        let cfg = Config::parse(&cfg_contents, &Overrides::new())
            .context("failed to construct cfg")?;
        log::debug!("{cfg:#?}");

        let cities = CityRegistry::from_file(sim_dir.join("cities.toml"))
            .context("failed to load cities")?;

        let jobs_file = sim_dir.join("jobs.toml");
        let jobs_contents = fs::read_to_string(&jobs_file)
            .with_context(|| format!("failed to read {jobs_file:?}"))?;
        let jobs = parse_jobs(&jobs_contents, &cities).context("failed to load jobs")?;

        let mgr = Self {
            sim_dir,
            cfg_contents,
            cities,
            jobs,
        };
        for job in &mgr.jobs {
            mgr.job_config(job)
                .with_context(|| format!("invalid overrides of job {:?}", job.scenario))?;
        }
        Ok(mgr)
    }

    /// Run every job, or only the job of `scenario`.
    pub fn run_jobs(&self, scenario: Option<&str>) -> Result<()> {
        let jobs = match scenario {
            Some(scenario) => vec![self.job(scenario)?],
            None => self.jobs.iter().collect(),
        };
        for job in jobs {
            self.run_job(job)
                .with_context(|| format!("failed to run job {:?}", job.scenario))?;
        }
        Ok(())
    }

    /// Run (or rerun) a single sample of the job of `scenario`.
    pub fn run_single(&self, scenario: &str, sample_idx: usize) -> Result<()> {
        let job = self.job(scenario)?;
        let n_samples = self
            .count_sample_dirs(scenario)
            .context("failed to count sample dirs")?;
        if sample_idx > n_samples {
            bail!("sample index {sample_idx} would leave a gap after {n_samples} samples");
        }
        let cfg = self.job_config(job)?;
        self.run_and_save(job, &cfg, sample_idx)
    }

    pub fn analyze_sim(&self) -> Result<()> {
        for job in &self.jobs {
            let n_samples = self
                .count_sample_dirs(&job.scenario)
                .context("failed to count sample dirs")?;
            if n_samples == 0 {
                log::warn!("scenario {:?} has no samples yet", job.scenario);
                continue;
            }

            let summary = self.summarize(&job.scenario)?;
            let file = self.summary_file(&job.scenario);
            summary
                .save(&file)
                .with_context(|| format!("failed to save {file:?}"))?;
            log::info!("saved {file:?}");
        }
        Ok(())
    }

    /// Compare scenarios, writing the result only if every scenario has as many samples as
    /// the first one.
    pub fn compare(&self, scenarios: &[String]) -> Result<()> {
        let file = self.comparison_file();
        if file.exists() {
            fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
        }

        let mut summaries = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            self.job(scenario)?;
            summaries.push(self.summarize(scenario)?);
        }
        let comparison = compare_scenarios(&summaries).context("failed to compare scenarios")?;

        comparison
            .save(&file)
            .with_context(|| format!("failed to save {file:?}"))?;
        log::info!("saved {file:?}");
        Ok(())
    }

    pub fn clean_sim(&self) -> Result<()> {
        for job in &self.jobs {
            let dir = self.scenario_dir(&job.scenario);
            if dir.exists() {
                fs::remove_dir_all(&dir).with_context(|| format!("failed to remove {dir:?}"))?;
                log::info!("removed {dir:?}");
            }
        }
        let file = self.comparison_file();
        if file.exists() {
            fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
            log::info!("removed {file:?}");
        }
        Ok(())
    }

    fn job(&self, scenario: &str) -> Result<&Job> {
        self.jobs
            .iter()
            .find(|job| job.scenario == scenario)
            .with_context(|| format!("no job for scenario {scenario:?}"))
    }

    fn job_config(&self, job: &Job) -> Result<Config> {
        Config::parse(&self.cfg_contents, &job.overrides).context("failed to construct cfg")
    }

    /// Append `job.samples` new samples after the existing ones.
    fn run_job(&self, job: &Job) -> Result<()> {
        let cfg = self.job_config(job)?;
        let first = self
            .count_sample_dirs(&job.scenario)
            .context("failed to count sample dirs")?;
        let indices: Vec<usize> = (first..first + job.samples).collect();

        if !job.parallel {
            for &sample_idx in &indices {
                self.run_and_save(job, &cfg, sample_idx)?;
            }
            return Ok(());
        }

        let n_workers = thread::available_parallelism()
            .map_or(1, usize::from)
            .clamp(1, indices.len().max(1));
        log::info!("running {} samples on {n_workers} workers", indices.len());
        thread::scope(|scope| {
            let handles: Vec<_> = (0..n_workers)
                .map(|i_worker| {
                    let (cfg, indices) = (&cfg, &indices);
                    scope.spawn(move || -> Result<()> {
                        for &sample_idx in indices.iter().skip(i_worker).step_by(n_workers) {
                            self.run_and_save(job, cfg, sample_idx)?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles.into_iter().try_for_each(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("sample worker panicked"))?
            })
        })
    }

    fn run_and_save(&self, job: &Job, cfg: &Config, sample_idx: usize) -> Result<()> {
        log::info!("running sample {sample_idx} of {:?}", job.scenario);
        let stats = run_sample(cfg, &self.cities, job, sample_idx)
            .with_context(|| format!("failed to run sample {sample_idx}"))?;

        let dir = self.sample_dir(&job.scenario, sample_idx);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {dir:?}"))?;
        let file = dir.join("statistics.msgpack");
        stats
            .save(&file)
            .with_context(|| format!("failed to save {file:?}"))?;
        log::info!("saved {file:?}");
        Ok(())
    }

    fn summarize(&self, scenario: &str) -> Result<ScenarioSummary> {
        let n_samples = self
            .count_sample_dirs(scenario)
            .context("failed to count sample dirs")?;
        let mut analyzer = Analyzer::new(scenario);
        for sample_idx in 0..n_samples {
            let file = self.sample_dir(scenario, sample_idx).join("statistics.msgpack");
            analyzer
                .add_file(&file)
                .with_context(|| format!("failed to add {file:?}"))?;
        }
        analyzer.summarize()
    }

    fn count_sample_dirs(&self, scenario: &str) -> Result<usize> {
        let pattern = self.scenario_dir(scenario).join("sample-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob sample dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    fn scenario_dir(&self, scenario: &str) -> PathBuf {
        self.sim_dir.join(scenario)
    }

    fn sample_dir(&self, scenario: &str, sample_idx: usize) -> PathBuf {
        self.scenario_dir(scenario)
            .join(format!("sample-{sample_idx:04}"))
    }

    fn summary_file(&self, scenario: &str) -> PathBuf {
        self.scenario_dir(scenario).join("summary.json")
    }

    fn comparison_file(&self) -> PathBuf {
        self.sim_dir.join("comparison.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cities::tests::test_cities;
    use crate::config::tests::TEST_CONFIG;

    const TEST_JOBS: &str = r#"
[[job]]
scenario = "baseline"
city = "Rivertown"
scale = 0.1
samples = 2

[[job]]
scenario = "no-critical-spread"
city = "all"
scale = 0.1
samples = 2
parallel = true

[job.overrides]
"disease.infectiousness.critical" = 0.0
"run.max_days" = 15
"#;

    #[test]
    fn parses_jobs_with_overrides() {
        let jobs = parse_jobs(TEST_JOBS, &test_cities()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(!jobs[0].parallel);
        assert!(jobs[0].overrides.is_empty());
        assert_eq!(
            jobs[1].overrides.get("run.max_days"),
            Some(&toml::Value::Integer(15))
        );

        let cfg = Config::parse(TEST_CONFIG, &jobs[1].overrides).unwrap();
        assert_eq!(cfg.run.max_days, 15);
    }

    #[test]
    fn rejects_invalid_jobs() {
        let cities = test_cities();
        let unknown_city = TEST_JOBS.replace("\"Rivertown\"", "\"Atlantis\"");
        assert!(parse_jobs(&unknown_city, &cities).is_err());

        let duplicate = TEST_JOBS.replace("no-critical-spread", "baseline");
        assert!(parse_jobs(&duplicate, &cities).is_err());

        let bad_name = TEST_JOBS.replace("no-critical-spread", "../escape");
        assert!(parse_jobs(&bad_name, &cities).is_err());
    }

    #[test]
    fn samples_are_reproducible_per_index() {
        let cities = test_cities();
        let jobs = parse_jobs(TEST_JOBS, &cities).unwrap();
        let cfg = Config::parse(TEST_CONFIG, &jobs[1].overrides).unwrap();

        let first = run_sample(&cfg, &cities, &jobs[1], 0).unwrap();
        let again = run_sample(&cfg, &cities, &jobs[1], 0).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.seed, Some(7));
        assert_eq!(first.cities, vec!["Rivertown", "Hillside"]);
        assert!(first.days.len() <= 15);
        assert!(first.total_infected() >= cfg.seeding.num_infected);

        let other = run_sample(&cfg, &cities, &jobs[1], 1).unwrap();
        assert_eq!(other.seed, Some(8));
    }
}
