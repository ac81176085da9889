//! The experiments the runner knows how to set up

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use clap::ValueEnum;

use crate::{
    activations::Activation,
    config::{ConfigError, Overrides},
    datasets::DatasetKind,
    init::Initializer,
    loss::Cost,
    nn::LayerSpec,
    optim::{DEFAULT_KEY, OptimizerAssignment, OptimizerChoice, OptimizerSpec},
};

/// Toggles between the bundled experiments
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentKind {
    /// Small CIFAR-10 MLP with fully connected layers and one optimizer
    Cifar10Mlp,
    /// MNIST MLP mixing optimizers across layers and parameter classes
    MnistMultiOptimizer,
}

impl ExperimentKind {
    pub fn default_dataset(&self) -> DatasetKind {
        match self {
            ExperimentKind::Cifar10Mlp => DatasetKind::Cifar10,
            ExperimentKind::MnistMultiOptimizer => DatasetKind::Mnist,
        }
    }

    /// Builds the experiment with an output layer as wide as `n_classes`
    pub fn build(&self, n_classes: usize) -> Experiment {
        match self {
            ExperimentKind::Cifar10Mlp => Experiment::cifar10_mlp(n_classes),
            ExperimentKind::MnistMultiOptimizer => Experiment::mnist_multi_optimizer(n_classes),
        }
    }
}

impl Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentKind::Cifar10Mlp => write!(f, "cifar10-mlp"),
            ExperimentKind::MnistMultiOptimizer => write!(f, "mnist-multi-optimizer"),
        }
    }
}

/// Layers, optimizers and cost of one experiment, as written before validation
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub layers: Vec<LayerSpec>,
    pub optimizer: OptimizerChoice,
    pub cost: Cost,
}

/// A validated experiment, ready to be built once the data is loaded
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub layers: Vec<LayerSpec>,
    pub optimizer: OptimizerAssignment,
    pub cost: Cost,
}

impl Experiment {
    pub fn cifar10_mlp(n_classes: usize) -> Self {
        let init_uni = Initializer::Uniform {
            low: -0.1,
            high: 0.1,
        };
        Self {
            name: ExperimentKind::Cifar10Mlp.to_string(),
            layers: vec![
                LayerSpec::new(200, init_uni, Activation::Rectlin),
                LayerSpec::new(
                    n_classes,
                    init_uni,
                    Activation::Logistic { shortcut: true },
                ),
            ],
            optimizer: OptimizerChoice::Single(OptimizerSpec::gradient_descent_momentum(
                0.01, 0.9,
            )),
            cost: Cost::CrossEntropyBinary,
        }
    }

    /// All bias parameters and the last linear layer use RMSProp, everything else uses
    /// gradient descent with momentum
    pub fn mnist_multi_optimizer(n_classes: usize) -> Self {
        let init_norm = Initializer::Gaussian {
            loc: 0.0,
            scale: 0.01,
        };
        let optimizer_one = OptimizerSpec::gradient_descent_momentum(0.1, 0.9);
        let optimizer_two = OptimizerSpec::rms_prop();
        Self {
            name: ExperimentKind::MnistMultiOptimizer.to_string(),
            layers: vec![
                LayerSpec::new(100, init_norm, Activation::Rectlin)
                    .with_bias(Initializer::Constant(0.0)),
                LayerSpec::new(
                    n_classes,
                    init_norm,
                    Activation::Logistic { shortcut: true },
                )
                .with_bias(Initializer::Constant(0.0))
                .with_name("special_linear"),
            ],
            optimizer: OptimizerChoice::Groups(BTreeMap::from([
                (DEFAULT_KEY.to_string(), optimizer_one),
                ("Bias".to_string(), optimizer_two),
                ("special_linear".to_string(), optimizer_two),
            ])),
            cost: Cost::CrossEntropyBinary,
        }
    }

    /// Validates layers and optimizers and applies per-run overrides to the default optimizer.
    /// Needs no data, so every configuration error surfaces before loading starts.
    pub fn plan(&self, overrides: Overrides) -> Result<Plan, ConfigError> {
        LayerSpec::validate_all(&self.layers)?;
        let layer_names: Vec<String> = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| l.resolved_name(i))
            .collect();
        let mut optimizer = OptimizerAssignment::from_choice(&self.optimizer, &layer_names)?;

        let default = optimizer.default_spec_mut();
        if let Some(lr) = overrides.learning_rate {
            *default = default.with_learning_rate(lr);
        }
        if let Some(momentum) = overrides.momentum {
            *default = default.with_momentum(momentum)?;
        }
        default.validate()?;

        Ok(Plan {
            layers: self.layers.clone(),
            optimizer,
            cost: self.cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{GroupKey, OptimizerError};

    #[test]
    fn test_cifar10_mlp_plan() {
        let plan = Experiment::cifar10_mlp(10)
            .plan(Overrides::default())
            .unwrap();
        let widths: Vec<_> = plan.layers.iter().map(|l| l.nout).collect();
        assert_eq!(widths, vec![200, 10]);
        assert!(plan.layers.iter().all(|l| l.bias.is_none()));
        assert_eq!(
            plan.optimizer,
            OptimizerAssignment::Single(OptimizerSpec::gradient_descent_momentum(0.01, 0.9))
        );
    }

    #[test]
    fn test_mnist_multi_optimizer_plan() {
        let plan = Experiment::mnist_multi_optimizer(10)
            .plan(Overrides::default())
            .unwrap();
        let OptimizerAssignment::Groups { default, overrides } = plan.optimizer else {
            panic!("expected a group assignment");
        };
        assert_eq!(default, OptimizerSpec::gradient_descent_momentum(0.1, 0.9));
        assert!(overrides.contains(&(
            GroupKey::Class(crate::nn::ParamClass::Bias),
            OptimizerSpec::rms_prop()
        )));
        assert!(overrides.contains(&(
            GroupKey::Layer("special_linear".to_string()),
            OptimizerSpec::rms_prop()
        )));
    }

    #[test]
    fn test_overrides_apply_to_default() {
        let overrides = Overrides {
            learning_rate: Some(0.5),
            momentum: Some(0.0),
        };
        let plan = Experiment::mnist_multi_optimizer(10)
            .plan(overrides)
            .unwrap();
        let OptimizerAssignment::Groups { default, overrides } = plan.optimizer else {
            panic!("expected a group assignment");
        };
        assert_eq!(default, OptimizerSpec::gradient_descent_momentum(0.5, 0.0));
        // non-default entries keep their own settings
        assert!(overrides.iter().all(|(_, s)| *s == OptimizerSpec::rms_prop()));
    }

    #[test]
    fn test_invalid_override() {
        let overrides = Overrides {
            learning_rate: Some(-1.0),
            momentum: None,
        };
        assert!(matches!(
            Experiment::cifar10_mlp(10).plan(overrides),
            Err(ConfigError::Optimizer(
                OptimizerError::InvalidHyperparameter {
                    name: "learning_rate",
                    ..
                }
            ))
        ));

        let mut experiment = Experiment::cifar10_mlp(10);
        experiment.optimizer = OptimizerChoice::Single(OptimizerSpec::adam());
        let overrides = Overrides {
            learning_rate: None,
            momentum: Some(0.5),
        };
        assert!(matches!(
            experiment.plan(overrides),
            Err(ConfigError::Optimizer(
                OptimizerError::UnsupportedOverride { .. }
            ))
        ));
    }
}
