mod analysis;
mod cities;
mod config;
mod disease;
mod environment;
mod event;
mod extensions;
mod generation;
mod manager;
mod person;
mod simulation;
mod stats;
mod world;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run {
        #[arg(long)]
        job: Option<String>,
    },

    Sample {
        #[arg(long)]
        job: String,

        #[arg(long)]
        sample_idx: usize,
    },

    Analyze,

    Compare {
        #[arg(required = true)]
        scenarios: Vec<String>,
    },

    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Run { job } => mgr.run_jobs(job.as_deref())?,
        Command::Sample { job, sample_idx } => mgr.run_single(&job, sample_idx)?,
        Command::Analyze => mgr.analyze_sim()?,
        Command::Compare { scenarios } => mgr.compare(&scenarios)?,
        Command::Clean => mgr.clean_sim()?,
    }

    Ok(())
}
