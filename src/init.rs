//! Parameter initializers

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform as UniformDist};
use thiserror::Error;

use crate::tensor::Matrix;

/// Errors for initializer configuration
#[derive(Debug, Error, PartialEq)]
pub enum InitError {
    #[error("uniform initializer needs low < high, got [{low}, {high})")]
    EmptyRange { low: f32, high: f32 },
    #[error("gaussian initializer needs a finite, non-negative scale, got {scale}")]
    InvalidScale { scale: f32 },
    #[error("initializer parameters must be finite")]
    NonFinite,
}

/// Policy producing the initial values of a parameter tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Uniform { low: f32, high: f32 },
    Gaussian { loc: f32, scale: f32 },
    Constant(f32),
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`
    GlorotUniform,
}

impl Initializer {
    pub fn validate(&self) -> Result<(), InitError> {
        match *self {
            Initializer::Uniform { low, high } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(InitError::NonFinite);
                }
                if low >= high {
                    return Err(InitError::EmptyRange { low, high });
                }
            }
            Initializer::Gaussian { loc, scale } => {
                if !loc.is_finite() {
                    return Err(InitError::NonFinite);
                }
                if !scale.is_finite() || scale < 0.0 {
                    return Err(InitError::InvalidScale { scale });
                }
            }
            Initializer::Constant(val) => {
                if !val.is_finite() {
                    return Err(InitError::NonFinite);
                }
            }
            Initializer::GlorotUniform => {}
        }
        Ok(())
    }

    /// Fills a `rows x cols` matrix. For weights `rows` is the fan in and `cols` the fan out.
    pub fn fill<R: Rng + ?Sized>(
        &self,
        rows: usize,
        cols: usize,
        rng: &mut R,
    ) -> Result<Matrix, InitError> {
        self.validate()?;
        let matrix = match *self {
            Initializer::Uniform { low, high } => sample_uniform(low, high, rows, cols, rng)?,
            Initializer::Gaussian { loc, scale } => {
                let normal = Normal::new(loc, scale).map_err(|_| InitError::InvalidScale { scale })?;
                Matrix::from_fn(rows, cols, |_, _| normal.sample(rng))
            }
            Initializer::Constant(val) => Matrix::from_fn(rows, cols, |_, _| val),
            Initializer::GlorotUniform => {
                let limit = (6.0 / (rows + cols).max(1) as f32).sqrt();
                sample_uniform(-limit, limit, rows, cols, rng)?
            }
        };
        Ok(matrix)
    }
}

fn sample_uniform<R: Rng + ?Sized>(
    low: f32,
    high: f32,
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> Result<Matrix, InitError> {
    let dist = UniformDist::new(low, high).map_err(|_| InitError::EmptyRange { low, high })?;
    Ok(Matrix::from_fn(rows, cols, |_, _| dist.sample(rng)))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    #[test]
    fn test_uniform_bounds() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let init = Initializer::Uniform {
            low: -0.1,
            high: 0.1,
        };
        let w = init.fill(30, 20, &mut rng).unwrap();
        assert_eq!((w.rows(), w.cols()), (30, 20));
        assert!(w.as_slice().iter().all(|v| (-0.1..0.1).contains(v)));
    }

    #[test]
    fn test_constant_and_seeded_gaussian() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let b = Initializer::Constant(0.0).fill(1, 4, &mut rng).unwrap();
        assert_eq!(b.as_slice(), &[0.0; 4]);

        let init = Initializer::Gaussian {
            loc: 0.0,
            scale: 0.01,
        };
        let w1 = init.fill(5, 5, &mut Pcg64Mcg::seed_from_u64(3)).unwrap();
        let w2 = init.fill(5, 5, &mut Pcg64Mcg::seed_from_u64(3)).unwrap();
        assert_eq!(w1, w2);
    }

    #[test]
    fn test_invalid_initializers() {
        assert_eq!(
            Initializer::Uniform {
                low: 1.0,
                high: 1.0
            }
            .validate(),
            Err(InitError::EmptyRange {
                low: 1.0,
                high: 1.0
            })
        );
        assert!(matches!(
            Initializer::Gaussian {
                loc: 0.0,
                scale: -1.0
            }
            .validate(),
            Err(InitError::InvalidScale { .. })
        ));
        assert_eq!(
            Initializer::Constant(f32::NAN).validate(),
            Err(InitError::NonFinite)
        );
    }
}
