//! Optimizers and their assignment to parameter groups
//!
//! An experiment either uses one optimizer for every parameter tensor or maps groups to
//! optimizers. Group keys are layer names or parameter classes (`Linear`, `Bias`) and a
//! `"default"` entry is mandatory. Lookup for a parameter tensor tries its layer name, then its
//! class, then falls back to the default.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use thiserror::Error;

use crate::nn::{Model, ParamClass, ParamGroup};

/// Key that must be present in every optimizer map
pub const DEFAULT_KEY: &str = "default";

/// Errors for optimizer configuration and updates
#[derive(Debug, Error, PartialEq)]
pub enum OptimizerError {
    #[error("optimizer map has no `default` entry")]
    MissingDefault,
    #[error("optimizer map key `{0}` names no layer or parameter class")]
    UnknownGroup(String),
    #[error("layer name `{0}` collides with a reserved optimizer key")]
    ReservedName(String),
    #[error("invalid {optimizer} hyperparameter `{name}` = {value}")]
    InvalidHyperparameter {
        optimizer: &'static str,
        name: &'static str,
        value: f32,
    },
    #[error("override `{name}` does not apply to {optimizer}")]
    UnsupportedOverride {
        optimizer: &'static str,
        name: &'static str,
    },
    #[error("parameter group has {params} values but {grads} gradients (optimizer sized for {state})")]
    SizeMismatch {
        params: usize,
        grads: usize,
        state: usize,
    },
}

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step on one parameter tensor with its accumulated gradients
    fn update(&mut self, params: &mut [f32], grads: &[f32]) -> Result<(), OptimizerError>;
}

fn check_sizes(params: &[f32], grads: &[f32], state: usize) -> Result<(), OptimizerError> {
    if params.len() != grads.len() || params.len() != state {
        return Err(OptimizerError::SizeMismatch {
            params: params.len(),
            grads: grads.len(),
            state,
        });
    }
    Ok(())
}

/// SGD with momentum and optional weight decay
pub struct GradientDescentMomentum {
    learning_rate: f32,
    momentum_coef: f32,
    wdecay: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl GradientDescentMomentum {
    pub fn new(len: usize, learning_rate: f32, momentum_coef: f32, wdecay: f32) -> Self {
        Self {
            learning_rate,
            momentum_coef,
            wdecay,
            velocity: vec![0.0; len],
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for GradientDescentMomentum {
    fn update(&mut self, params: &mut [f32], grads: &[f32]) -> Result<(), OptimizerError> {
        check_sizes(params, grads, self.velocity.len())?;
        for ((param, grad), velocity) in params.iter_mut().zip(grads).zip(self.velocity.iter_mut())
        {
            *velocity =
                self.momentum_coef * *velocity - self.learning_rate * (grad + self.wdecay * *param);
            *param += *velocity;
        }
        Ok(())
    }
}

/// RMSProp with a running average of squared gradients
pub struct RMSProp {
    learning_rate: f32,
    decay_rate: f32,
    epsilon: f32,
    state: Vec<f32>,
}

impl RMSProp {
    pub fn new(len: usize, learning_rate: f32, decay_rate: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            decay_rate,
            epsilon,
            state: vec![0.0; len],
        }
    }
}

impl Optim for RMSProp {
    fn update(&mut self, params: &mut [f32], grads: &[f32]) -> Result<(), OptimizerError> {
        check_sizes(params, grads, self.state.len())?;
        let Self {
            learning_rate: lr,
            decay_rate: decay,
            epsilon: eps,
            ..
        } = *self;
        for ((param, grad), state) in params.iter_mut().zip(grads).zip(self.state.iter_mut()) {
            *state = decay * *state + (1.0 - decay) * grad * grad;
            *param -= lr * grad / ((*state + eps).sqrt() + eps);
        }
        Ok(())
    }
}

/// Adam with bias corrected step size
pub struct Adam {
    learning_rate: f32,
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
    beta_1_t: f32,
    beta_2_t: f32,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(len: usize, learning_rate: f32, beta_1: f32, beta_2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta_1,
            beta_2,
            epsilon,
            beta_1_t: 1.0,
            beta_2_t: 1.0,
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }
}

impl Optim for Adam {
    fn update(&mut self, params: &mut [f32], grads: &[f32]) -> Result<(), OptimizerError> {
        check_sizes(params, grads, self.m.len())?;
        let Self {
            learning_rate: lr,
            beta_1: b1,
            beta_2: b2,
            epsilon: eps,
            ..
        } = *self;
        self.beta_1_t *= b1;
        self.beta_2_t *= b2;
        let step_size = lr * (1.0 - self.beta_2_t).sqrt() / (1.0 - self.beta_1_t);

        for (((param, grad), m), v) in params
            .iter_mut()
            .zip(grads)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            *m = b1 * *m + (1.0 - b1) * grad;
            *v = b2 * *v + (1.0 - b2) * grad * grad;
            *param -= step_size * *m / (v.sqrt() + eps);
        }
        Ok(())
    }
}

/// Hyperparameters of an optimizer, validated before any state is allocated
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerSpec {
    GradientDescentMomentum {
        learning_rate: f32,
        momentum_coef: f32,
        wdecay: f32,
    },
    RMSProp {
        learning_rate: f32,
        decay_rate: f32,
        epsilon: f32,
    },
    Adam {
        learning_rate: f32,
        beta_1: f32,
        beta_2: f32,
        epsilon: f32,
    },
}

impl OptimizerSpec {
    pub fn gradient_descent_momentum(learning_rate: f32, momentum_coef: f32) -> Self {
        OptimizerSpec::GradientDescentMomentum {
            learning_rate,
            momentum_coef,
            wdecay: 0.0,
        }
    }

    pub fn rms_prop() -> Self {
        OptimizerSpec::RMSProp {
            learning_rate: 2e-3,
            decay_rate: 0.95,
            epsilon: 1e-6,
        }
    }

    pub fn adam() -> Self {
        OptimizerSpec::Adam {
            learning_rate: 1e-3,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OptimizerSpec::GradientDescentMomentum { .. } => "GradientDescentMomentum",
            OptimizerSpec::RMSProp { .. } => "RMSProp",
            OptimizerSpec::Adam { .. } => "Adam",
        }
    }

    pub fn validate(&self) -> Result<(), OptimizerError> {
        let optimizer = self.kind();
        let check = |name: &'static str, value: f32, ok: bool| {
            if ok && value.is_finite() {
                Ok(())
            } else {
                Err(OptimizerError::InvalidHyperparameter {
                    optimizer,
                    name,
                    value,
                })
            }
        };
        match *self {
            OptimizerSpec::GradientDescentMomentum {
                learning_rate,
                momentum_coef,
                wdecay,
            } => {
                check("learning_rate", learning_rate, learning_rate > 0.0)?;
                check(
                    "momentum_coef",
                    momentum_coef,
                    (0.0..1.0).contains(&momentum_coef),
                )?;
                check("wdecay", wdecay, wdecay >= 0.0)
            }
            OptimizerSpec::RMSProp {
                learning_rate,
                decay_rate,
                epsilon,
            } => {
                check("learning_rate", learning_rate, learning_rate > 0.0)?;
                check(
                    "decay_rate",
                    decay_rate,
                    decay_rate > 0.0 && decay_rate < 1.0,
                )?;
                check("epsilon", epsilon, epsilon > 0.0)
            }
            OptimizerSpec::Adam {
                learning_rate,
                beta_1,
                beta_2,
                epsilon,
            } => {
                check("learning_rate", learning_rate, learning_rate > 0.0)?;
                check("beta_1", beta_1, (0.0..1.0).contains(&beta_1))?;
                check("beta_2", beta_2, (0.0..1.0).contains(&beta_2))?;
                check("epsilon", epsilon, epsilon > 0.0)
            }
        }
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        match &mut self {
            OptimizerSpec::GradientDescentMomentum { learning_rate, .. }
            | OptimizerSpec::RMSProp { learning_rate, .. }
            | OptimizerSpec::Adam { learning_rate, .. } => *learning_rate = lr,
        }
        self
    }

    /// Momentum only exists for gradient descent
    pub fn with_momentum(self, momentum: f32) -> Result<Self, OptimizerError> {
        match self {
            OptimizerSpec::GradientDescentMomentum {
                learning_rate,
                wdecay,
                ..
            } => Ok(OptimizerSpec::GradientDescentMomentum {
                learning_rate,
                momentum_coef: momentum,
                wdecay,
            }),
            other => Err(OptimizerError::UnsupportedOverride {
                optimizer: other.kind(),
                name: "momentum",
            }),
        }
    }

    /// Allocates an optimizer with state for `len` parameters
    pub fn build(&self, len: usize) -> Result<Box<dyn Optim>, OptimizerError> {
        self.validate()?;
        let optim: Box<dyn Optim> = match *self {
            OptimizerSpec::GradientDescentMomentum {
                learning_rate,
                momentum_coef,
                wdecay,
            } => Box::new(GradientDescentMomentum::new(
                len,
                learning_rate,
                momentum_coef,
                wdecay,
            )),
            OptimizerSpec::RMSProp {
                learning_rate,
                decay_rate,
                epsilon,
            } => Box::new(RMSProp::new(len, learning_rate, decay_rate, epsilon)),
            OptimizerSpec::Adam {
                learning_rate,
                beta_1,
                beta_2,
                epsilon,
            } => Box::new(Adam::new(len, learning_rate, beta_1, beta_2, epsilon)),
        };
        Ok(optim)
    }
}

impl Display for OptimizerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerSpec::GradientDescentMomentum {
                learning_rate,
                momentum_coef,
                ..
            } => write!(
                f,
                "GradientDescentMomentum(lr={learning_rate}, momentum={momentum_coef})"
            ),
            OptimizerSpec::RMSProp { learning_rate, .. } => write!(f, "RMSProp(lr={learning_rate})"),
            OptimizerSpec::Adam { learning_rate, .. } => write!(f, "Adam(lr={learning_rate})"),
        }
    }
}

/// Optimizer configuration as an experiment writes it, before validation
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerChoice {
    Single(OptimizerSpec),
    /// Keyed by layer name, parameter class or `"default"`
    Groups(BTreeMap<String, OptimizerSpec>),
}

/// Target of an optimizer map entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    Class(ParamClass),
    Layer(String),
}

impl GroupKey {
    fn parse(key: &str) -> Self {
        match key {
            "Linear" => GroupKey::Class(ParamClass::Linear),
            "Bias" => GroupKey::Class(ParamClass::Bias),
            name => GroupKey::Layer(name.to_string()),
        }
    }
}

/// Validated optimizer configuration
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerAssignment {
    Single(OptimizerSpec),
    Groups {
        default: OptimizerSpec,
        overrides: Vec<(GroupKey, OptimizerSpec)>,
    },
}

impl OptimizerAssignment {
    /// Validates a choice against the names of the layers it will be applied to
    pub fn from_choice(
        choice: &OptimizerChoice,
        layer_names: &[String],
    ) -> Result<Self, OptimizerError> {
        match choice {
            OptimizerChoice::Single(spec) => {
                spec.validate()?;
                Ok(OptimizerAssignment::Single(*spec))
            }
            OptimizerChoice::Groups(map) => {
                let default = *map.get(DEFAULT_KEY).ok_or(OptimizerError::MissingDefault)?;
                default.validate()?;
                if let Some(name) = layer_names
                    .iter()
                    .find(|n| matches!(n.as_str(), DEFAULT_KEY | "Linear" | "Bias"))
                {
                    return Err(OptimizerError::ReservedName(name.clone()));
                }
                let mut overrides = Vec::new();
                for (key, spec) in map.iter().filter(|(k, _)| k.as_str() != DEFAULT_KEY) {
                    let group = GroupKey::parse(key);
                    if let GroupKey::Layer(name) = &group {
                        if !layer_names.contains(name) {
                            return Err(OptimizerError::UnknownGroup(name.clone()));
                        }
                    }
                    spec.validate()?;
                    overrides.push((group, *spec));
                }
                Ok(OptimizerAssignment::Groups { default, overrides })
            }
        }
    }

    /// The fallback optimizer, which per-run overrides apply to
    pub fn default_spec_mut(&mut self) -> &mut OptimizerSpec {
        match self {
            OptimizerAssignment::Single(spec) => spec,
            OptimizerAssignment::Groups { default, .. } => default,
        }
    }

    /// Picks the optimizer for a group: layer name, then parameter class, then default
    pub fn resolve(&self, group: &ParamGroup) -> &OptimizerSpec {
        match self {
            OptimizerAssignment::Single(spec) => spec,
            OptimizerAssignment::Groups { default, overrides } => {
                let by_name = overrides.iter().find(
                    |(key, _)| matches!(key, GroupKey::Layer(name) if *name == group.layer_name),
                );
                let by_class = || {
                    overrides
                        .iter()
                        .find(|(key, _)| *key == GroupKey::Class(group.class))
                };
                by_name
                    .or_else(by_class)
                    .map_or(default, |(_, spec)| spec)
            }
        }
    }

    /// Allocates one optimizer per parameter group of `model`
    pub fn bind(&self, model: &Model) -> Result<MultiOptimizer, OptimizerError> {
        let sizes: Vec<usize> = model
            .layers()
            .iter()
            .flat_map(|l| {
                let linear = l.nin() * l.nout();
                std::iter::once(linear).chain(l.has_bias().then_some(l.nout()))
            })
            .collect();
        let mut slots = Vec::new();
        for (group, len) in model.param_groups().into_iter().zip(sizes) {
            let spec = *self.resolve(&group);
            log::debug!(
                "layer {} ({}) {} -> {}",
                group.layer,
                group.layer_name,
                group.class,
                spec
            );
            slots.push(Slot {
                optim: spec.build(len)?,
                group,
                spec,
            });
        }
        if let OptimizerAssignment::Groups { overrides, .. } = self {
            for (key, _) in overrides {
                if let GroupKey::Class(class) = key {
                    if !slots.iter().any(|s| s.group.class == *class) {
                        log::warn!("optimizer map entry `{class}` matches no parameters");
                    }
                }
            }
        }
        Ok(MultiOptimizer { slots })
    }
}

struct Slot {
    group: ParamGroup,
    spec: OptimizerSpec,
    optim: Box<dyn Optim>,
}

/// Optimizers bound to the parameter groups of one model
pub struct MultiOptimizer {
    slots: Vec<Slot>,
}

impl MultiOptimizer {
    /// Applies every group's optimizer to the gradients accumulated in `model`
    pub fn step(&mut self, model: &mut Model) -> Result<(), OptimizerError> {
        for (slot, slice) in self.slots.iter_mut().zip(model.param_slices()) {
            slot.optim.update(slice.params, slice.grads)?;
        }
        Ok(())
    }

    /// Resolved optimizer per parameter group, in model order
    pub fn assignments(&self) -> impl Iterator<Item = (&ParamGroup, &OptimizerSpec)> {
        self.slots.iter().map(|s| (&s.group, &s.spec))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{activations::Activation, init::Initializer, nn::LayerSpec};

    fn gdm() -> OptimizerSpec {
        OptimizerSpec::gradient_descent_momentum(0.1, 0.9)
    }

    fn model() -> Model {
        let specs = [
            LayerSpec::new(4, Initializer::Constant(0.1), Activation::Rectlin)
                .with_bias(Initializer::Constant(0.0)),
            LayerSpec::new(3, Initializer::Constant(0.1), Activation::Rectlin),
            LayerSpec::new(2, Initializer::Constant(0.1), Activation::Softmax)
                .with_bias(Initializer::Constant(0.0))
                .with_name("special_linear"),
        ];
        Model::new(&specs, 5, &mut Pcg64Mcg::seed_from_u64(0)).unwrap()
    }

    fn names() -> Vec<String> {
        vec!["affine_0".into(), "affine_1".into(), "special_linear".into()]
    }

    #[test]
    fn test_sgd_no_momentum() {
        let mut params = vec![1.0, 2.0, 3.0];
        let mut optim = GradientDescentMomentum::new(3, 0.1, 0.0, 0.0);
        optim.update(&mut params, &[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(params, vec![0.9, 1.9, 2.9]);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let mut params = vec![1.0, 2.0, 3.0];
        let grads = [1.0, 1.0, 1.0];
        let mut optim = GradientDescentMomentum::new(3, 0.1, 0.9, 0.0);
        optim.update(&mut params, &grads).unwrap();
        assert_eq!(params, vec![0.9, 1.9, 2.9]);
        assert_eq!(optim.velocities(), &[-0.1, -0.1, -0.1]);
        optim.update(&mut params, &grads).unwrap();
        assert_eq!(params, vec![0.71, 1.71, 2.71]);
        assert_eq!(optim.velocities(), &[-0.19, -0.19, -0.19]);
    }

    #[test]
    fn test_rmsprop_and_adam_descend() {
        for spec in [OptimizerSpec::rms_prop(), OptimizerSpec::adam()] {
            let mut optim = spec.build(2).unwrap();
            let mut params = vec![1.0, -1.0];
            optim.update(&mut params, &[0.5, -0.5]).unwrap();
            assert!(params[0] < 1.0, "{spec} did not descend");
            assert!(params[1] > -1.0, "{spec} did not descend");
        }
    }

    #[test]
    fn test_size_mismatch() {
        let mut optim = OptimizerSpec::adam().build(2).unwrap();
        let err = optim.update(&mut [0.0; 3], &[0.0; 3]).unwrap_err();
        assert_eq!(
            err,
            OptimizerError::SizeMismatch {
                params: 3,
                grads: 3,
                state: 2
            }
        );
    }

    #[test]
    fn test_invalid_hyperparameters() {
        assert!(matches!(
            OptimizerSpec::gradient_descent_momentum(0.0, 0.9).validate(),
            Err(OptimizerError::InvalidHyperparameter {
                name: "learning_rate",
                ..
            })
        ));
        assert!(matches!(
            OptimizerSpec::gradient_descent_momentum(0.1, 1.0).build(1),
            Err(OptimizerError::InvalidHyperparameter {
                name: "momentum_coef",
                ..
            })
        ));
        assert_eq!(
            OptimizerSpec::rms_prop().with_momentum(0.5).unwrap_err(),
            OptimizerError::UnsupportedOverride {
                optimizer: "RMSProp",
                name: "momentum"
            }
        );
    }

    #[test]
    fn test_missing_default() {
        let map = BTreeMap::from([("Bias".to_string(), OptimizerSpec::rms_prop())]);
        let err = OptimizerAssignment::from_choice(&OptimizerChoice::Groups(map), &names());
        assert_eq!(err, Err(OptimizerError::MissingDefault));
    }

    #[test]
    fn test_unknown_group_name() {
        let map = BTreeMap::from([
            (DEFAULT_KEY.to_string(), gdm()),
            ("special_linaer".to_string(), OptimizerSpec::rms_prop()),
        ]);
        let err = OptimizerAssignment::from_choice(&OptimizerChoice::Groups(map), &names());
        assert_eq!(
            err,
            Err(OptimizerError::UnknownGroup("special_linaer".to_string()))
        );
    }

    #[test]
    fn test_bias_groups_use_their_optimizer() {
        let map = BTreeMap::from([
            (DEFAULT_KEY.to_string(), gdm()),
            ("Bias".to_string(), OptimizerSpec::rms_prop()),
        ]);
        let assignment =
            OptimizerAssignment::from_choice(&OptimizerChoice::Groups(map), &names()).unwrap();
        let model = model();
        let bound = assignment.bind(&model).unwrap();
        let resolved: Vec<_> = bound.assignments().map(|(g, s)| (g.class, *s)).collect();
        assert_eq!(resolved.len(), 5);
        for (class, spec) in resolved {
            match class {
                ParamClass::Bias => assert_eq!(spec, OptimizerSpec::rms_prop()),
                ParamClass::Linear => assert_eq!(spec, gdm()),
            }
        }
    }

    #[test]
    fn test_layer_name_beats_class() {
        let map = BTreeMap::from([
            (DEFAULT_KEY.to_string(), gdm()),
            ("Linear".to_string(), OptimizerSpec::adam()),
            ("special_linear".to_string(), OptimizerSpec::rms_prop()),
        ]);
        let assignment =
            OptimizerAssignment::from_choice(&OptimizerChoice::Groups(map), &names()).unwrap();
        let bound = assignment.bind(&model()).unwrap();
        let resolved: Vec<_> = bound
            .assignments()
            .map(|(g, s)| (g.layer_name.clone(), g.class, s.kind()))
            .collect();
        assert_eq!(
            resolved,
            vec![
                ("affine_0".to_string(), ParamClass::Linear, "Adam"),
                ("affine_0".to_string(), ParamClass::Bias, "GradientDescentMomentum"),
                ("affine_1".to_string(), ParamClass::Linear, "Adam"),
                ("special_linear".to_string(), ParamClass::Linear, "RMSProp"),
                ("special_linear".to_string(), ParamClass::Bias, "RMSProp"),
            ]
        );
    }

    #[test]
    fn test_step_updates_model() {
        let mut model = model();
        let before = model.layers()[2].weights().clone();
        let x = crate::tensor::Matrix::from_rows(&[vec![1.0; 5]]).unwrap();
        let out = model.forward(&x).unwrap();
        let t = crate::tensor::Matrix::from_rows(&[vec![1.0, 0.0]]).unwrap();
        model.backward(&out.zip_map(&t, |y, t| y - t), true);

        let mut optim = OptimizerAssignment::Single(gdm()).bind(&model).unwrap();
        optim.step(&mut model).unwrap();
        assert_ne!(model.layers()[2].weights(), &before);
    }
}
