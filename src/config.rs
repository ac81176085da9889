//! Run configuration, built once from the command line and passed by value into the runner

use std::{num::NonZeroUsize, path::PathBuf};

use thiserror::Error;

use crate::{
    datasets::DatasetKind, experiments::ExperimentKind, nn::NNError, optim::OptimizerError,
};

/// Errors raised while configuring a run, before any data is read
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("epochs must be at least 1")]
    ZeroEpochs,
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("class size must be at least 1")]
    ZeroClassSize,
    #[error("eval frequency must be at least 1")]
    ZeroEvalFreq,
    #[error("invalid layers: {0}")]
    Layers(#[from] NNError),
    #[error("invalid optimizer: {0}")]
    Optimizer(#[from] OptimizerError),
}

/// Per-run changes to the experiment's default optimizer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Overrides {
    pub learning_rate: Option<f32>,
    pub momentum: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub experiment: ExperimentKind,
    pub dataset: DatasetKind,
    pub data_dir: PathBuf,
    pub epochs: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    /// Seeds initialization, shuffling and synthetic data
    pub seed: u64,
    /// Evaluate on the test set every this many epochs while training
    pub eval_freq: Option<NonZeroUsize>,
    /// Examples per class for synthetic datasets
    pub class_size: usize,
    /// Where plots go, nothing is written when unset
    pub output_dir: Option<PathBuf>,
    pub overrides: Overrides,
}

impl ExperimentConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 128;
    pub const DEFAULT_CLASS_SIZE: usize = 500;

    /// Config with the experiment's own dataset and default settings
    pub fn new(
        experiment: ExperimentKind,
        data_dir: impl Into<PathBuf>,
        epochs: usize,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            experiment,
            dataset: experiment.default_dataset(),
            data_dir: data_dir.into(),
            epochs: NonZeroUsize::new(epochs).ok_or(ConfigError::ZeroEpochs)?,
            batch_size: NonZeroUsize::new(Self::DEFAULT_BATCH_SIZE)
                .ok_or(ConfigError::ZeroBatchSize)?,
            seed: 0,
            eval_freq: None,
            class_size: Self::DEFAULT_CLASS_SIZE,
            output_dir: None,
            overrides: Overrides::default(),
        })
    }

    pub fn with_dataset(mut self, dataset: DatasetKind) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, ConfigError> {
        self.batch_size = NonZeroUsize::new(batch_size).ok_or(ConfigError::ZeroBatchSize)?;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_eval_freq(mut self, eval_freq: Option<usize>) -> Result<Self, ConfigError> {
        self.eval_freq = eval_freq
            .map(|f| NonZeroUsize::new(f).ok_or(ConfigError::ZeroEvalFreq))
            .transpose()?;
        Ok(self)
    }

    pub fn with_class_size(mut self, class_size: usize) -> Result<Self, ConfigError> {
        if class_size == 0 {
            return Err(ConfigError::ZeroClassSize);
        }
        self.class_size = class_size;
        Ok(self)
    }

    pub fn with_output_dir(mut self, output_dir: Option<PathBuf>) -> Self {
        self.output_dir = output_dir;
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }
}
