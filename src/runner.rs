//! Experiment pipeline: configure, load data, build the model, pick optimizers, train, evaluate

use std::{
    fmt::{self, Display},
    fs, io,
    path::PathBuf,
};

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    callbacks::{Callbacks, CostCurvePlot, ProgressLogger},
    config::{ConfigError, ExperimentConfig},
    dataloader::{DataLoader, DataLoaderError},
    datasets::{DatasetError, load_dataset},
    experiments::Experiment,
    loss::Metric,
    nn::{Model, NNError},
    optim::OptimizerError,
    train::{TrainError, TrainSummary},
};

/// Failure of one pipeline stage
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("data iterator: {0}")]
    DataLoader(#[from] DataLoaderError),
    #[error("model assembly: {0}")]
    Model(#[source] NNError),
    #[error("optimizer selection: {0}")]
    Optimizer(#[source] OptimizerError),
    #[error("output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("training: {0}")]
    Training(#[from] TrainError),
    #[error("evaluation: {0}")]
    Evaluation(#[source] NNError),
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub experiment: String,
    /// Fraction of misclassified test examples
    pub misclassification: f32,
    pub summary: TrainSummary,
}

impl RunReport {
    pub fn misclassification_pct(&self) -> f32 {
        self.misclassification * 100.0
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Misclassification error = {:.1}%",
            self.misclassification_pct()
        )
    }
}

/// Runs one experiment from an explicit configuration
pub struct ExperimentRunner {
    config: ExperimentConfig,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Runs the experiment selected in the configuration
    pub fn run_configured(&self) -> Result<RunReport, RunnerError> {
        let experiment = self
            .config
            .experiment
            .build(self.config.dataset.n_classes());
        self.run(&experiment)
    }

    /// Runs `experiment` against the configured dataset. Stages run in order and the first
    /// failure aborts the run.
    pub fn run(&self, experiment: &Experiment) -> Result<RunReport, RunnerError> {
        let config = &self.config;
        log::info!(
            "running {} on {} for {} epochs (batch size {}, seed {})",
            experiment.name,
            config.dataset,
            config.epochs,
            config.batch_size,
            config.seed
        );

        // configuration errors surface before any data is read
        let plan = experiment.plan(config.overrides)?;

        let dataset = load_dataset(
            config.dataset,
            &config.data_dir,
            config.class_size,
            config.seed,
        )?;

        let mut rng = Pcg64Mcg::seed_from_u64(config.seed);
        let mut model = Model::new(&plan.layers, dataset.train.features.cols(), &mut rng)
            .map_err(RunnerError::Model)?;
        if model.n_outputs() != dataset.n_classes {
            return Err(RunnerError::Model(NNError::OutputWidthMismatch {
                width: model.n_outputs(),
                n_classes: dataset.n_classes,
            }));
        }
        log::info!(
            "model: {}",
            model
                .layers()
                .iter()
                .map(|l| format!("{}({} -> {})", l.name(), l.nin(), l.nout()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut optimizer = plan
            .optimizer
            .bind(&model)
            .map_err(RunnerError::Optimizer)?;

        let n_classes = dataset.n_classes;
        let batch_size = config.batch_size.get();
        let train = DataLoader::new(dataset.train, n_classes, batch_size, Some(config.seed))?;
        let test = DataLoader::new(dataset.test, n_classes, batch_size, None)?;

        let mut callbacks = match config.eval_freq {
            Some(freq) => Callbacks::new().with_eval(&test, freq),
            None => Callbacks::new(),
        };
        callbacks.add(ProgressLogger);
        if let Some(dir) = &config.output_dir {
            fs::create_dir_all(dir).map_err(|source| RunnerError::OutputDir {
                path: dir.clone(),
                source,
            })?;
            callbacks.add(CostCurvePlot::new(
                dir.join(format!("cost_{}_{}.png", experiment.name, config.dataset)),
            ));
        }

        let summary = model.fit(
            &train,
            &mut optimizer,
            config.epochs.get(),
            plan.cost,
            &mut callbacks,
        )?;

        let misclassification = model
            .eval(&test, Metric::Misclassification)
            .map_err(RunnerError::Evaluation)?;
        Ok(RunReport {
            experiment: experiment.name.clone(),
            misclassification,
            summary,
        })
    }
}
