use crate::disease::DiseaseState;
use crate::event::Event;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Record of the simulation at the end of a single day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: NaiveDate,

    /// Number of people per disease state, indexed by [`DiseaseState::index`].
    pub counts: [usize; DiseaseState::COUNT],

    /// Number of people infected through contacts on this day.
    pub new_infections: usize,

    /// Number of exposure draws made by the contact pass.
    pub exposure_draws: usize,
}

impl DayRecord {
    pub fn new(
        date: NaiveDate,
        counts: [usize; DiseaseState::COUNT],
        new_infections: usize,
        exposure_draws: usize,
    ) -> Self {
        Self {
            date,
            counts,
            new_infections,
            exposure_draws,
        }
    }

    pub fn count(&self, state: DiseaseState) -> usize {
        self.counts[state.index()]
    }

    /// Number of people in an active disease stage.
    pub fn active_infections(&self) -> usize {
        DiseaseState::ACTIVE
            .iter()
            .map(|&state| self.count(state))
            .sum()
    }
}

/// Statistics artifact of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleStatistics {
    pub scenario: String,
    pub sample_idx: usize,
    pub seed: Option<u64>,
    pub cities: Vec<String>,
    pub scale: f64,
    pub initial_date: NaiveDate,

    /// One record per simulated day.
    pub days: Vec<DayRecord>,

    /// Full event log, in chronological order.
    pub events: Vec<Event>,
}

impl SampleStatistics {
    /// Save the statistics to a MessagePack-encoded file.
    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, self).context("failed to serialize statistics")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    /// Load statistics previously written by [`SampleStatistics::save`].
    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let stats = decode::from_read(&mut reader).context("failed to deserialize statistics")?;
        Ok(stats)
    }

    /// Number of infections, seeded ones included.
    pub fn total_infected(&self) -> usize {
        self.events.iter().filter(|event| event.is_infection()).count()
    }

    /// Number of people in `state` at the end of the run.
    pub fn final_count(&self, state: DiseaseState) -> usize {
        self.days.last().map_or(0, |day| day.count(state))
    }

    /// Largest number of simultaneous critical cases.
    pub fn peak_critical(&self) -> usize {
        self.days
            .iter()
            .map(|day| day.count(DiseaseState::Critical))
            .max()
            .unwrap_or(0)
    }
}

/// Streaming mean and variance (Welford's algorithm).
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorReport {
    pub mean: f64,
    pub std_dev: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            n_vals: 0,
            mean: 0.0,
            diff_2_sum: 0.0,
        }
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn variance(&self) -> f64 {
        if self.n_vals > 1 {
            self.diff_2_sum / (self.n_vals as f64 - 1.0)
        } else {
            f64::NAN
        }
    }

    pub fn report(&self) -> AccumulatorReport {
        AccumulatorReport {
            mean: if self.n_vals > 0 { self.mean } else { f64::NAN },
            std_dev: self.variance().sqrt(),
        }
    }
}
