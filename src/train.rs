//! Training loop and evaluation

use thiserror::Error;

use crate::{
    callbacks::Callbacks,
    dataloader::DataLoader,
    loss::{Cost, Metric},
    nn::{Model, NNError},
    optim::{MultiOptimizer, OptimizerError},
};

/// Errors raised while fitting a model
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] NNError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

/// What happened in one pass over the training set
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// 1-based
    pub epoch: usize,
    pub num_epochs: usize,
    /// Mean per-example training cost over the pass
    pub train_cost: f32,
    /// Misclassification on the eval set, when an evaluation was due this epoch
    pub eval_misclassification: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrainSummary {
    pub epochs: Vec<EpochReport>,
}

impl TrainSummary {
    pub fn final_cost(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.train_cost)
    }
}

impl Model {
    /// Runs exactly `num_epochs` passes over `train`, stepping the optimizer once per batch
    pub fn fit(
        &mut self,
        train: &DataLoader,
        optimizer: &mut MultiOptimizer,
        num_epochs: usize,
        cost: Cost,
        callbacks: &mut Callbacks<'_>,
    ) -> Result<TrainSummary, TrainError> {
        let output_activation = self.output_activation();
        let shortcut = cost.shortcut(output_activation);
        log::debug!(
            "fitting {} layers for {} epochs, {} batches per epoch, cost shortcut: {}",
            self.len(),
            num_epochs,
            train.n_batches(),
            shortcut
        );
        callbacks.on_train_begin(num_epochs);

        let mut summary = TrainSummary::default();
        for epoch in 0..num_epochs {
            let mut epoch_cost = 0.0;
            let mut n_seen = 0;
            for (i, batch) in train.iter(epoch).enumerate() {
                let y = self.forward(&batch.inputs)?;
                let batch_cost = cost.call(&y, &batch.targets);
                log::trace!("epoch {} batch {}: cost {}", epoch + 1, i, batch_cost);
                epoch_cost += batch_cost * batch.labels.len() as f32;
                n_seen += batch.labels.len();

                let delta = cost.delta(&y, &batch.targets, output_activation);
                self.backward(&delta, shortcut);
                optimizer.step(self)?;
            }
            let train_cost = epoch_cost / n_seen.max(1) as f32;
            if !train_cost.is_finite() {
                log::warn!("training cost is {} after epoch {}", train_cost, epoch + 1);
            }

            let eval_misclassification = match callbacks.eval_set_due(epoch) {
                Some(eval_set) => Some(self.eval(eval_set, Metric::Misclassification)?),
                None => None,
            };
            let report = EpochReport {
                epoch: epoch + 1,
                num_epochs,
                train_cost,
                eval_misclassification,
            };
            callbacks.on_epoch_end(&report);
            summary.epochs.push(report);
        }

        callbacks.on_train_end(&summary);
        Ok(summary)
    }

    /// Computes `metric` over every example of `loader`, as a fraction in [0, 1]
    pub fn eval(&self, loader: &DataLoader, metric: Metric) -> Result<f32, NNError> {
        let mut count = 0;
        for batch in loader.iter(0) {
            let y = self.predict(&batch.inputs)?;
            count += metric.count(&y, &batch.labels);
        }
        Ok(count as f32 / loader.len().max(1) as f32)
    }
}
