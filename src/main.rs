//! Runs one of the bundled training experiments and prints its test misclassification
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- -x cifar10-mlp -w ~/data -e 10
//! cargo run -- -x mnist-multi-optimizer -d xor -e 5
//! ```
//!
//! MNIST is read from the uncompressed IDX files and CIFAR-10 from its binary batches. The
//! synthetic datasets (line, circle, xor, moon) need no files.

use std::{path::PathBuf, process::ExitCode};

use clap::{ArgAction, Parser};
use experiment_runner::{
    config::{ExperimentConfig, Overrides},
    datasets::DatasetKind,
    experiments::ExperimentKind,
    runner::{ExperimentRunner, RunReport, RunnerError},
};

#[derive(Parser)]
#[clap(version, about)]
struct Args {
    #[clap(short = 'x', long, default_value_t = ExperimentKind::Cifar10Mlp)]
    experiment: ExperimentKind,
    /// Dataset to train on, defaults to the experiment's own
    #[clap(short, long)]
    dataset: Option<DatasetKind>,
    #[clap(short = 'w', long, default_value = "data")]
    data_dir: PathBuf,
    #[clap(short, long, default_value_t = 10)]
    epochs: usize,
    #[clap(short, long, default_value_t = ExperimentConfig::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 0)]
    rng_seed: u64,
    /// Evaluate on the test set every N epochs while training
    #[clap(long)]
    eval_freq: Option<usize>,
    /// Examples per class for the synthetic datasets
    #[clap(long, default_value_t = ExperimentConfig::DEFAULT_CLASS_SIZE)]
    class_size: usize,
    /// Directory for the cost curve plot
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Learning rate of the default optimizer
    #[clap(long)]
    learning_rate: Option<f32>,
    /// Momentum of the default optimizer
    #[clap(long)]
    momentum: Option<f32>,
    /// More logging, repeat for more detail (RUST_LOG takes precedence)
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn into_config(self) -> Result<ExperimentConfig, RunnerError> {
        let config = ExperimentConfig::new(self.experiment, self.data_dir, self.epochs)?
            .with_dataset(self.dataset.unwrap_or(self.experiment.default_dataset()))
            .with_batch_size(self.batch_size)?
            .with_seed(self.rng_seed)
            .with_eval_freq(self.eval_freq)?
            .with_class_size(self.class_size)?
            .with_output_dir(self.output_dir)
            .with_overrides(Overrides {
                learning_rate: self.learning_rate,
                momentum: self.momentum,
            });
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(args: Args) -> Result<RunReport, RunnerError> {
    let config = args.into_config()?;
    ExperimentRunner::new(config).run_configured()
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
