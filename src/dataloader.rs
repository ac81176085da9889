//! Data loader

use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{datasets::Split, tensor::Matrix};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("label {label} at index {index} is not below the class count {n_classes}")]
    LabelOutOfRange {
        index: usize,
        label: usize,
        n_classes: usize,
    },
    #[error("cannot iterate over an empty split")]
    Empty,
    #[error("batch size must be positive")]
    ZeroBatchSize,
}

/// One mini batch, a row per example
#[derive(Debug, PartialEq)]
pub struct Batch {
    pub inputs: Matrix,
    /// one hot encoded labels
    pub targets: Matrix,
    pub labels: Vec<usize>,
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    features: Matrix,
    labels: Vec<usize>,
    n_classes: usize,
    batch_size: usize,
    // shuffling is reseeded every epoch from this seed, `None` keeps the stored order
    shuffle_seed: Option<u64>,
}

impl DataLoader {
    pub fn new(
        split: Split,
        n_classes: usize,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Result<Self, DataLoaderError> {
        let Split { features, labels } = split;
        if features.rows() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: features.rows(),
            });
        }
        if labels.is_empty() {
            return Err(DataLoaderError::Empty);
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if let Some((index, &label)) = labels.iter().enumerate().find(|(_, l)| **l >= n_classes) {
            return Err(DataLoaderError::LabelOutOfRange {
                index,
                label,
                n_classes,
            });
        }
        Ok(Self {
            features,
            labels,
            n_classes,
            batch_size,
            shuffle_seed,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.cols()
    }

    pub fn n_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Iterates over one epoch. The final batch is short when the batch size does not divide
    /// the number of examples.
    pub fn iter(&self, epoch: usize) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.len()).collect::<Vec<_>>();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = Pcg64Mcg::seed_from_u64(seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.loader.batch_size).min(self.indices.len());
        let rows = &self.indices[self.curr_iter..end];
        self.curr_iter = end;

        let labels: Vec<usize> = rows.iter().map(|&i| self.loader.labels[i]).collect();
        let targets = Matrix::from_fn(labels.len(), self.loader.n_classes, |r, c| {
            if labels[r] == c { 1.0 } else { 0.0 }
        });
        Some(Batch {
            inputs: self.loader.features.select_rows(rows),
            targets,
            labels,
        })
    }
}
