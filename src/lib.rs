//! Configure-and-run pipeline for small feed-forward classification experiments,
//! together with the minimal dense training core it runs on.

pub mod activations;
pub mod callbacks;
pub mod config;
pub mod dataloader;
pub mod datasets;
pub mod experiments;
pub mod init;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod runner;
pub mod tensor;
pub mod train;

#[cfg(test)]
#[macro_export]
macro_rules! assert_eq_float {
    ($a:expr, $b:expr) => {
        assert!((($a) - ($b)).abs() < 1e-6);
    };
}
