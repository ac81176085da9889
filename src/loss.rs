//! Cost functions and evaluation metrics

use std::fmt::{self, Display};

use crate::{activations::Activation, tensor::Matrix};

// keeps `ln` finite for saturated outputs
const EPSILON: f32 = 1e-7;

/// Scalar objective minimized during training
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cost {
    CrossEntropyBinary,
    CrossEntropyMulti,
    /// Mean squared error over the outputs of an example
    MeanSquared,
}

impl Cost {
    /// Mean per-example cost of a batch
    pub fn call(&self, y: &Matrix, t: &Matrix) -> f32 {
        if y.rows() == 0 {
            return 0.0;
        }
        let total: f32 = y
            .as_slice()
            .iter()
            .zip(t.as_slice())
            .map(|(&y, &t)| match self {
                Cost::CrossEntropyBinary => {
                    -(t * (y + EPSILON).ln() + (1.0 - t) * (1.0 - y + EPSILON).ln())
                }
                Cost::CrossEntropyMulti => -t * (y + EPSILON).ln(),
                Cost::MeanSquared => (y - t).powi(2),
            })
            .sum();
        let total = if matches!(self, Cost::MeanSquared) {
            total / y.cols() as f32
        } else {
            total
        };
        total / y.rows() as f32
    }

    /// Whether this cost hands `y - t` straight to the linear part of a layer using `activation`
    pub fn shortcut(&self, activation: Activation) -> bool {
        matches!(
            (self, activation),
            (Cost::CrossEntropyBinary, Activation::Logistic { shortcut: true })
                | (Cost::CrossEntropyMulti, Activation::Softmax)
        )
    }

    /// Delta of the batch cost with respect to the network output, already divided by the
    /// batch size. With the shortcut this is the delta before the output activation.
    pub fn delta(&self, y: &Matrix, t: &Matrix, activation: Activation) -> Matrix {
        let scale = 1.0 / y.rows().max(1) as f32;
        if self.shortcut(activation) {
            return y.zip_map(t, |y, t| (y - t) * scale);
        }
        let n_outputs = y.cols().max(1) as f32;
        y.zip_map(t, |y, t| {
            let d = match self {
                Cost::CrossEntropyBinary => (y - t) / (y * (1.0 - y) + EPSILON),
                Cost::CrossEntropyMulti => -t / (y + EPSILON),
                Cost::MeanSquared => 2.0 * (y - t) / n_outputs,
            };
            d * scale
        })
    }
}

/// Metric computed over a whole evaluation set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Fraction of examples whose arg max output is not the label
    Misclassification,
    Accuracy,
}

impl Metric {
    /// Number of examples this metric counts in a batch
    pub(crate) fn count(&self, y: &Matrix, labels: &[usize]) -> usize {
        let preds = y.argmax_rows();
        let wrong = preds.iter().zip(labels).filter(|(p, l)| p != l).count();
        match self {
            Metric::Misclassification => wrong,
            Metric::Accuracy => labels.len() - wrong,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Misclassification => write!(f, "misclassification"),
            Metric::Accuracy => write!(f, "accuracy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    fn m(rows: &[Vec<f32>]) -> Matrix {
        Matrix::from_rows(rows).unwrap()
    }

    #[test]
    fn test_mean_squared() {
        let y_pred = m(&[vec![2.0, 3.0]]);
        let y_true = m(&[vec![1.0, 5.0]]);
        assert_eq_float!(Cost::MeanSquared.call(&y_pred, &y_true), 2.5);

        // dloss / dy_pred = 1/N * 2 * (y_pred - y_true)
        let d = Cost::MeanSquared.delta(&y_pred, &y_true, Activation::Identity);
        assert_eq_float!(d.get(0, 0), 1.0);
        assert_eq_float!(d.get(0, 1), -2.0);
    }

    #[test]
    fn test_cross_entropy_shortcut() {
        let y = m(&[vec![0.8, 0.2], vec![0.4, 0.6]]);
        let t = m(&[vec![1.0, 0.0], vec![1.0, 0.0]]);
        let logistic = Activation::Logistic { shortcut: true };
        assert!(Cost::CrossEntropyBinary.shortcut(logistic));
        assert!(!Cost::CrossEntropyBinary.shortcut(Activation::Logistic { shortcut: false }));
        assert!(Cost::CrossEntropyMulti.shortcut(Activation::Softmax));

        let d = Cost::CrossEntropyBinary.delta(&y, &t, logistic);
        assert_eq_float!(d.get(0, 0), -0.1);
        assert_eq_float!(d.get(1, 1), 0.3);
    }

    #[test]
    fn test_cross_entropy_value() {
        let y = m(&[vec![0.5, 0.5]]);
        let t = m(&[vec![1.0, 0.0]]);
        assert!((Cost::CrossEntropyMulti.call(&y, &t) - 0.5f32.ln().abs()).abs() < 1e-5);
        assert!((Cost::CrossEntropyBinary.call(&y, &t) - 2.0 * 0.5f32.ln().abs()).abs() < 1e-5);
    }

    #[test]
    fn test_metrics() {
        let y = m(&[vec![0.9, 0.1], vec![0.3, 0.7], vec![0.6, 0.4]]);
        let labels = [0, 0, 0];
        assert_eq!(Metric::Misclassification.count(&y, &labels), 1);
        assert_eq!(Metric::Accuracy.count(&y, &labels), 2);
    }
}
