//! Element-wise (and row-wise for softmax) activation functions
//!
//! Each activation knows its forward transform and how to push a delta back through it, given
//! the output it produced in the forward pass.

use crate::tensor::Matrix;

/// Activation applied after the linear part of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Identity,
    /// Rectified linear unit
    Rectlin,
    /// Sigmoid. With `shortcut` set, a matching cross entropy cost hands its delta straight to
    /// the linear part instead of going through the sigmoid derivative.
    Logistic { shortcut: bool },
    /// Row-wise softmax, always eligible for the multi-class cross entropy shortcut
    Softmax,
    Tanh,
}

impl Activation {
    pub fn forward(&self, z: &Matrix) -> Matrix {
        match self {
            Activation::Identity => z.clone(),
            Activation::Rectlin => z.map(|v| v.max(0.0)),
            Activation::Logistic { .. } => z.map(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Tanh => z.map(f32::tanh),
            Activation::Softmax => softmax(z),
        }
    }

    /// Backprop `delta` (d cost / d output) through the activation, `out` is the forward output
    pub fn backward(&self, out: &Matrix, delta: &Matrix) -> Matrix {
        match self {
            Activation::Identity => delta.clone(),
            Activation::Rectlin => out.zip_map(delta, |y, d| if y > 0.0 { d } else { 0.0 }),
            Activation::Logistic { .. } => out.zip_map(delta, |y, d| y * (1.0 - y) * d),
            Activation::Tanh => out.zip_map(delta, |y, d| (1.0 - y * y) * d),
            Activation::Softmax => {
                // d z_i = s_i * (d_i - sum_j d_j s_j)
                Matrix::from_fn(out.rows(), out.cols(), |r, c| {
                    let dot: f32 = out
                        .row(r)
                        .iter()
                        .zip(delta.row(r))
                        .map(|(s, d)| s * d)
                        .sum();
                    out.get(r, c) * (delta.get(r, c) - dot)
                })
            }
        }
    }
}

fn softmax(z: &Matrix) -> Matrix {
    let mut out = Matrix::zeros(z.rows(), z.cols());
    let cols = z.cols();
    for r in 0..z.rows() {
        // subtract the row max so large logits do not overflow `exp`
        let max = z.row(r).iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = z.row(r).iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        let dst = &mut out.as_mut_slice()[r * cols..(r + 1) * cols];
        for (o, e) in dst.iter_mut().zip(exps) {
            *o = e / sum;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    fn row(values: &[f32]) -> Matrix {
        Matrix::from_vec(1, values.len(), values.to_vec()).unwrap()
    }

    #[test]
    fn test_rectlin() {
        let z = row(&[-1.0, 0.0, 2.0]);
        let y = Activation::Rectlin.forward(&z);
        assert_eq!(y.as_slice(), &[0.0, 0.0, 2.0]);
        let d = Activation::Rectlin.backward(&y, &row(&[1.0, 1.0, 1.0]));
        assert_eq!(d.as_slice(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_logistic() {
        let act = Activation::Logistic { shortcut: false };
        let y = act.forward(&row(&[0.0]));
        assert_eq_float!(y.get(0, 0), 0.5);
        let d = act.backward(&y, &row(&[1.0]));
        assert_eq_float!(d.get(0, 0), 0.25);
    }

    #[test]
    fn test_softmax() {
        let y = Activation::Softmax.forward(&row(&[1.0, 2.0]));
        assert_eq_float!(y.get(0, 0), 0.2689414);
        assert_eq_float!(y.get(0, 1), 0.7310585);

        // d s1 / dx1 = s1 * (1 - s1), d s1 / dx2 = -s1 * s2
        let d = Activation::Softmax.backward(&y, &row(&[1.0, 0.0]));
        let (s1, s2) = (y.get(0, 0), y.get(0, 1));
        assert_eq_float!(d.get(0, 0), s1 * (1.0 - s1));
        assert_eq_float!(d.get(0, 1), -s1 * s2);
    }

    #[test]
    fn test_softmax_large_logits() {
        let y = Activation::Softmax.forward(&row(&[1000.0, 1000.0]));
        assert_eq_float!(y.get(0, 0), 0.5);
        assert_eq!(y.count_nans(), 0);
    }
}
