//! Hooks invoked by the training loop for reporting
//!
//! Callbacks only observe training, they never change its control flow.

use std::{error::Error as StdError, num::NonZeroUsize, path::PathBuf};

use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, IntoDrawingArea, LineSeries},
    style::{BLUE, RED, WHITE},
};
use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    train::{EpochReport, TrainSummary},
};

/// Errors for callbacks
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to draw {}: {message}", path.display())]
    Plot { path: PathBuf, message: String },
}

/// Side-effect-only hook into `Model::fit`. Errors are logged by `Callbacks`, they never stop
/// training.
pub trait Callback {
    fn on_train_begin(&mut self, _num_epochs: usize) -> Result<(), CallbackError> {
        Ok(())
    }

    fn on_epoch_end(&mut self, report: &EpochReport) -> Result<(), CallbackError>;

    fn on_train_end(&mut self, _summary: &TrainSummary) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// The callbacks of one run plus the optional periodic evaluation schedule
#[derive(Default)]
pub struct Callbacks<'a> {
    eval_set: Option<&'a DataLoader>,
    eval_freq: usize,
    callbacks: Vec<Box<dyn Callback + 'a>>,
}

impl<'a> Callbacks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates misclassification on `eval_set` after every `eval_freq` epochs
    pub fn with_eval(mut self, eval_set: &'a DataLoader, eval_freq: NonZeroUsize) -> Self {
        self.eval_set = Some(eval_set);
        self.eval_freq = eval_freq.get();
        self
    }

    pub fn add<C: Callback + 'a>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// The eval set when an evaluation is due after the (0-based) `epoch`
    pub(crate) fn eval_set_due(&self, epoch: usize) -> Option<&'a DataLoader> {
        self.eval_set
            .filter(|_| self.eval_freq > 0 && (epoch + 1) % self.eval_freq == 0)
    }

    // A failing callback is logged and skipped, training carries on.

    pub(crate) fn on_train_begin(&mut self, num_epochs: usize) {
        for callback in &mut self.callbacks {
            if let Err(e) = callback.on_train_begin(num_epochs) {
                log::warn!("callback failed at train begin: {e}");
            }
        }
    }

    pub(crate) fn on_epoch_end(&mut self, report: &EpochReport) {
        for callback in &mut self.callbacks {
            if let Err(e) = callback.on_epoch_end(report) {
                log::warn!("callback failed after epoch {}: {e}", report.epoch);
            }
        }
    }

    pub(crate) fn on_train_end(&mut self, summary: &TrainSummary) {
        for callback in &mut self.callbacks {
            if let Err(e) = callback.on_train_end(summary) {
                log::warn!("callback failed at train end: {e}");
            }
        }
    }
}

/// Logs the training cost (and evaluation result, when present) after every epoch
#[derive(Default)]
pub struct ProgressLogger;

impl Callback for ProgressLogger {
    fn on_train_begin(&mut self, num_epochs: usize) -> Result<(), CallbackError> {
        log::info!("training for {} epochs", num_epochs);
        Ok(())
    }

    fn on_epoch_end(&mut self, report: &EpochReport) -> Result<(), CallbackError> {
        match report.eval_misclassification {
            Some(misclassification) => log::info!(
                "epoch: {}/{}, train cost: {:.4}, eval misclassification: {:.1}%",
                report.epoch,
                report.num_epochs,
                report.train_cost,
                misclassification * 100.0
            ),
            None => log::info!(
                "epoch: {}/{}, train cost: {:.4}",
                report.epoch,
                report.num_epochs,
                report.train_cost
            ),
        }
        Ok(())
    }
}

/// Saves a PNG of the training cost per epoch when training ends. Evaluation results, when
/// present, are drawn as a second series.
pub struct CostCurvePlot {
    path: PathBuf,
    costs: Vec<(usize, f32)>,
    evals: Vec<(usize, f32)>,
}

impl CostCurvePlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            costs: Vec::new(),
            evals: Vec::new(),
        }
    }

    fn draw(&self) -> Result<(), Box<dyn StdError>> {
        let root_area = BitMapBackend::new(&self.path, (640, 480)).into_drawing_area();
        root_area.fill(&WHITE)?;

        let n_epochs = self.costs.len().max(2);
        let y_max = self
            .costs
            .iter()
            .chain(&self.evals)
            .map(|&(_, v)| v)
            .filter(|v| v.is_finite())
            .fold(1.0f32, f32::max);

        let mut chart = ChartBuilder::on(&root_area)
            .caption("Training cost", ("sans-serif", 40))
            .margin(20)
            .x_label_area_size(30)
            .y_label_area_size(40)
            .build_cartesian_2d(1usize..n_epochs, 0f32..y_max * 1.05)?;

        chart.configure_mesh().x_desc("epoch").draw()?;
        chart.draw_series(LineSeries::new(self.costs.iter().copied(), &BLUE))?;
        if !self.evals.is_empty() {
            chart.draw_series(LineSeries::new(self.evals.iter().copied(), &RED))?;
        }

        root_area.present()?;
        log::info!("Cost curve saved to '{}'.", self.path.display());
        Ok(())
    }
}

impl Callback for CostCurvePlot {
    fn on_epoch_end(&mut self, report: &EpochReport) -> Result<(), CallbackError> {
        self.costs.push((report.epoch, report.train_cost));
        if let Some(misclassification) = report.eval_misclassification {
            self.evals.push((report.epoch, misclassification));
        }
        Ok(())
    }

    fn on_train_end(&mut self, _summary: &TrainSummary) -> Result<(), CallbackError> {
        self.draw().map_err(|e| CallbackError::Plot {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}
