use crate::disease::DiseaseState;
use crate::stats::{Accumulator, AccumulatorReport, DayRecord, SampleStatistics};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufWriter,
    path::Path,
};

pub trait Obs {
    fn update(&mut self, stats: &SampleStatistics) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Per-day mean and standard deviation of a daily count across samples.
///
/// Samples that stopped early count as zero on the days they did not simulate.
pub struct DailySeries {
    name: &'static str,
    extract: fn(&DayRecord) -> usize,
    samples: Vec<Vec<usize>>,
}

impl DailySeries {
    pub fn new(name: &'static str, extract: fn(&DayRecord) -> usize) -> Self {
        Self {
            name,
            extract,
            samples: Vec::new(),
        }
    }
}

impl Obs for DailySeries {
    fn update(&mut self, stats: &SampleStatistics) -> Result<()> {
        let series = stats.days.iter().map(self.extract).collect();
        self.samples.push(series);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        let n_days = self.samples.iter().map(Vec::len).max().unwrap_or(0);
        let mut acc_vec = Vec::new();
        acc_vec.resize_with(n_days, Accumulator::new);
        for series in &self.samples {
            for (i_day, acc) in acc_vec.iter_mut().enumerate() {
                acc.add(series.get(i_day).copied().unwrap_or(0) as f64);
            }
        }
        let reports: Vec<_> = acc_vec.iter().map(|acc| acc.report()).collect();
        serde_json::json!({ self.name: reports })
    }
}

/// Run-level totals of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalsReport {
    pub total_infected: AccumulatorReport,
    pub deceased: AccumulatorReport,
    pub immune: AccumulatorReport,
    pub peak_critical: AccumulatorReport,
    pub days: AccumulatorReport,
}

pub struct Totals {
    total_infected: Accumulator,
    deceased: Accumulator,
    immune: Accumulator,
    peak_critical: Accumulator,
    days: Accumulator,
}

impl Totals {
    pub fn new() -> Self {
        Self {
            total_infected: Accumulator::new(),
            deceased: Accumulator::new(),
            immune: Accumulator::new(),
            peak_critical: Accumulator::new(),
            days: Accumulator::new(),
        }
    }

    pub fn add(&mut self, stats: &SampleStatistics) {
        self.total_infected.add(stats.total_infected() as f64);
        self.deceased
            .add(stats.final_count(DiseaseState::Deceased) as f64);
        self.immune.add(stats.final_count(DiseaseState::Immune) as f64);
        self.peak_critical.add(stats.peak_critical() as f64);
        self.days.add(stats.days.len() as f64);
    }

    pub fn report(&self) -> TotalsReport {
        TotalsReport {
            total_infected: self.total_infected.report(),
            deceased: self.deceased.report(),
            immune: self.immune.report(),
            peak_critical: self.peak_critical.report(),
            days: self.days.report(),
        }
    }
}

/// Aggregate of every sample of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub scenario: String,
    pub n_samples: usize,
    pub totals: TotalsReport,
    pub daily: Vec<serde_json::Value>,
}

impl ScenarioSummary {
    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).context("failed to serialize summary")?;
        Ok(())
    }
}

pub struct Analyzer {
    scenario: String,
    n_samples: usize,
    totals: Totals,
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new(scenario: &str) -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(DailySeries::new("new_infections", |day| day.new_infections)),
            Box::new(DailySeries::new("active_infections", DayRecord::active_infections)),
            Box::new(DailySeries::new("critical", |day| {
                day.count(DiseaseState::Critical)
            })),
        ];
        Self {
            scenario: scenario.to_string(),
            n_samples: 0,
            totals: Totals::new(),
            obs_ptr_vec,
        }
    }

    pub fn add_sample(&mut self, stats: &SampleStatistics) -> Result<()> {
        if stats.scenario != self.scenario {
            bail!(
                "sample {} belongs to scenario {:?}, not {:?}",
                stats.sample_idx,
                stats.scenario,
                self.scenario
            );
        }
        for obs in &mut self.obs_ptr_vec {
            obs.update(stats).context("failed to update observable")?;
        }
        self.totals.add(stats);
        self.n_samples += 1;
        Ok(())
    }

    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let stats = SampleStatistics::load(file)?;
        self.add_sample(&stats)
    }

    pub fn summarize(&self) -> Result<ScenarioSummary> {
        if self.n_samples == 0 {
            bail!("scenario {:?} has no samples", self.scenario);
        }
        Ok(ScenarioSummary {
            scenario: self.scenario.clone(),
            n_samples: self.n_samples,
            totals: self.totals.report(),
            daily: self.obs_ptr_vec.iter().map(|obs| obs.report()).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioComparison {
    pub scenario: String,
    pub totals: TotalsReport,
    /// Mean infections averted with respect to the baseline.
    pub infections_averted: f64,
    /// Mean deaths averted with respect to the baseline.
    pub deaths_averted: f64,
}

/// Side-by-side totals of several scenarios, relative to the first one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub baseline: String,
    pub n_samples: usize,
    pub scenarios: Vec<ScenarioComparison>,
}

impl Comparison {
    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).context("failed to serialize comparison")?;
        Ok(())
    }
}

/// Compare scenario summaries; the first one is the baseline.
///
/// Fails if the scenarios do not share the same number of samples.
pub fn compare_scenarios(summaries: &[ScenarioSummary]) -> Result<Comparison> {
    let Some(baseline) = summaries.first() else {
        bail!("no scenarios to compare");
    };
    for summary in &summaries[1..] {
        if summary.n_samples != baseline.n_samples {
            bail!(
                "scenario {:?} has {} samples but {:?} has {}",
                summary.scenario,
                summary.n_samples,
                baseline.scenario,
                baseline.n_samples
            );
        }
    }

    let scenarios = summaries
        .iter()
        .map(|summary| ScenarioComparison {
            scenario: summary.scenario.clone(),
            totals: summary.totals.clone(),
            infections_averted: baseline.totals.total_infected.mean
                - summary.totals.total_infected.mean,
            deaths_averted: baseline.totals.deceased.mean - summary.totals.deceased.mean,
        })
        .collect();

    Ok(Comparison {
        baseline: baseline.scenario.clone(),
        n_samples: baseline.n_samples,
        scenarios,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Cause, Event};
    use crate::person::PersonId;
    use chrono::NaiveDate;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, day).unwrap()
    }

    fn sample(scenario: &str, sample_idx: usize, new_infections: &[usize]) -> SampleStatistics {
        let days = new_infections
            .iter()
            .enumerate()
            .map(|(i_day, &n)| {
                let mut counts = [0; DiseaseState::COUNT];
                counts[DiseaseState::Critical.index()] = i_day;
                DayRecord::new(date(i_day as u32 + 1), counts, n, 0)
            })
            .collect();
        let events = (0..new_infections.iter().sum::<usize>())
            .map(|id| {
                let cause = Cause::Exposure {
                    environment: crate::environment::EnvId(0),
                    infector: PersonId(0),
                };
                Event::new(
                    date(1),
                    PersonId(id as u32 + 1),
                    DiseaseState::Susceptible,
                    DiseaseState::Latent,
                    cause,
                )
            })
            .collect();
        SampleStatistics {
            scenario: scenario.to_string(),
            sample_idx,
            seed: Some(sample_idx as u64),
            cities: vec!["Rivertown".into()],
            scale: 1.0,
            initial_date: date(1),
            days,
            events,
        }
    }

    fn summary(scenario: &str, samples: &[&[usize]]) -> ScenarioSummary {
        let mut analyzer = Analyzer::new(scenario);
        for (i_sample, new_infections) in samples.iter().enumerate() {
            analyzer
                .add_sample(&sample(scenario, i_sample, new_infections))
                .unwrap();
        }
        analyzer.summarize().unwrap()
    }

    #[test]
    fn daily_series_pads_short_samples_with_zeros() {
        let summary = summary("baseline", &[&[2, 4], &[4, 2, 6]]);
        assert_eq!(summary.n_samples, 2);

        let reports = &summary.daily[0]["new_infections"];
        let means: Vec<f64> = reports
            .as_array()
            .unwrap()
            .iter()
            .map(|report| report["mean"].as_f64().unwrap())
            .collect();
        assert_eq!(means, vec![3.0, 3.0, 3.0]);

        approx::assert_abs_diff_eq!(summary.totals.total_infected.mean, 9.0);
        approx::assert_abs_diff_eq!(summary.totals.days.mean, 2.5);
        approx::assert_abs_diff_eq!(summary.totals.peak_critical.mean, 1.5);
    }

    #[test]
    fn rejects_samples_of_other_scenarios() {
        let mut analyzer = Analyzer::new("baseline");
        assert!(analyzer.add_sample(&sample("vaccination", 0, &[1])).is_err());
        assert!(analyzer.summarize().is_err());
    }

    #[test]
    fn compares_against_the_first_scenario() {
        let baseline = summary("baseline", &[&[10], &[20]]);
        let vaccination = summary("vaccination", &[&[4], &[6]]);
        let comparison = compare_scenarios(&[baseline, vaccination]).unwrap();

        assert_eq!(comparison.baseline, "baseline");
        assert_eq!(comparison.n_samples, 2);
        approx::assert_abs_diff_eq!(comparison.scenarios[0].infections_averted, 0.0);
        approx::assert_abs_diff_eq!(comparison.scenarios[1].infections_averted, 10.0);
    }

    #[test]
    fn differing_sample_counts_are_fatal() {
        let baseline = summary("baseline", &[&[10], &[20]]);
        let vaccination = summary("vaccination", &[&[4], &[6], &[8]]);
        let error = compare_scenarios(&[baseline, vaccination]).unwrap_err();
        assert!(format!("{error:#}").contains("3 samples"));
        assert!(compare_scenarios(&[]).is_err());
    }
}
