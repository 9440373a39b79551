//! Multi-slot training and testing orchestrator
//!
//! Trains and/or tests every slot of a run described by a JSON configuration.
//!
//! # Usage
//!
//! ```bash
//! polyslot \
//!   [--config run.json] \
//!   [--data-dir ./data] \
//!   [--checkpoint-dir ./checkpoints] \
//!   [--report-dir ./reports] \
//!   [--phase train|test|train-test] \
//!   [--start-epoch 0] \
//!   [--start-file 0] \
//!   [--quiet]
//! ```
//!
//! Exits with status 2 on an invalid configuration and 3 when a required
//! checkpoint is missing or incompatible.

use anyhow::{Context, Result};
use clap::Parser;
use polyslot_model::architecture;
use polyslot_train::{
    checkpoint::CheckpointManager,
    config::{Phase, RunConfig, RunConfigFile},
    dataloader::ShardSourceFactory,
    error::OrchestratorError,
    train::run,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Multi-slot training and testing orchestrator
#[derive(Parser, Debug)]
#[command(name = "polyslot")]
#[command(about = "Multi-slot training and testing orchestrator", long_about = None)]
struct Args {
    /// Path to run configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory containing token shards
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Directory holding one checkpoint per slot
    #[arg(long, value_name = "PATH")]
    checkpoint_dir: Option<PathBuf>,

    /// Directory for the test report
    #[arg(long, value_name = "PATH")]
    report_dir: Option<PathBuf>,

    /// Phases to run
    #[arg(long, value_enum)]
    phase: Option<Phase>,

    /// First epoch number; nonzero resumes from checkpoints
    #[arg(long)]
    start_epoch: Option<usize>,

    /// First training file; nonzero resumes from checkpoints
    #[arg(long)]
    start_file: Option<usize>,

    /// Suppress progress output
    #[arg(long)]
    quiet: bool,
}

impl Args {
    /// Apply command-line overrides on top of the configuration file
    fn merge_into(&self, file: &mut RunConfigFile) {
        if let Some(dir) = &self.data_dir {
            file.data.dir = dir.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            file.checkpoint.dir = dir.clone();
        }
        if let Some(dir) = &self.report_dir {
            file.metrics.report_dir = dir.clone();
        }
        if let Some(phase) = self.phase {
            file.run.phase = phase;
        }
        if let Some(epoch) = self.start_epoch {
            file.run.start_epoch = epoch;
        }
        if let Some(start_file) = self.start_file {
            file.run.start_file = start_file;
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                "polyslot=info"
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::INFO.into()),
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match execute(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<OrchestratorError>()
                .map(OrchestratorError::exit_code)
                .unwrap_or(1);
            error!("{e:#}");
            ExitCode::from(code as u8)
        }
    }
}

fn execute(args: &Args) -> Result<()> {
    let mut file = match &args.config {
        Some(path) => RunConfigFile::from_file(path).context("Failed to load config file")?,
        None => RunConfigFile::default(),
    };
    args.merge_into(&mut file);
    let config = RunConfig::new(file)?;

    let mut checkpoints = CheckpointManager::new(
        config.checkpoint.dir.clone(),
        architecture(config.unit_template()),
    );
    let factory = ShardSourceFactory::from_config(&config);

    let outcome = run(&config, &factory, &mut checkpoints, args.quiet)?;

    if !args.quiet {
        if let Some(last) = outcome.test.last() {
            println!("Average test accuracy: {:.6}", last.accuracy);
            println!("Average test loss: {:.6}", last.loss);
        }
        if let Some(path) = &outcome.report {
            println!("Test report written to {}", path.display());
        }
    }
    Ok(())
}
