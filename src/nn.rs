//! Components to build a feed-forward network

use std::collections::HashSet;
use std::fmt::{self, Display};

use rand::Rng;
use thiserror::Error;

use crate::{
    activations::Activation,
    init::{InitError, Initializer},
    tensor::Matrix,
};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("layer {index} must have a positive output width")]
    ZeroWidth { index: usize },
    #[error("a model needs at least one layer")]
    Empty,
    #[error("layer name `{0}` is used more than once")]
    DuplicateName(String),
    #[error("final layer has {width} outputs but the dataset has {n_classes} classes")]
    OutputWidthMismatch { width: usize, n_classes: usize },
    #[error("layer {index}: {source}")]
    Init {
        index: usize,
        #[source]
        source: InitError,
    },
}

/// Explicit description of one affine layer. Order in a `&[LayerSpec]` defines the topology.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub nout: usize,
    pub init: Initializer,
    /// `None` builds a layer without a bias term
    pub bias: Option<Initializer>,
    pub activation: Activation,
    /// Name used to target this layer's parameters with a dedicated optimizer. An optimizer
    /// keyed by this name updates both the weights and the bias of the layer.
    pub name: Option<String>,
}

impl LayerSpec {
    pub fn new(nout: usize, init: Initializer, activation: Activation) -> Self {
        Self {
            nout,
            init,
            bias: None,
            activation,
            name: None,
        }
    }

    pub fn with_bias(mut self, bias: Initializer) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name of the layer at `index`, unnamed layers are called `affine_<index>`
    pub fn resolved_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("affine_{index}"))
    }

    /// Checks everything that can be checked without knowing the input width
    pub fn validate_all(specs: &[LayerSpec]) -> Result<(), NNError> {
        if specs.is_empty() {
            return Err(NNError::Empty);
        }
        let mut names = HashSet::new();
        for (index, spec) in specs.iter().enumerate() {
            if spec.nout == 0 {
                return Err(NNError::ZeroWidth { index });
            }
            spec.init
                .validate()
                .and_then(|_| spec.bias.map_or(Ok(()), |b| b.validate()))
                .map_err(|source| NNError::Init { index, source })?;
            let name = spec.resolved_name(index);
            if names.contains(&name) {
                return Err(NNError::DuplicateName(name));
            }
            names.insert(name);
        }
        Ok(())
    }
}

/// Class of a parameter tensor inside a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamClass {
    Linear,
    Bias,
}

impl Display for ParamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamClass::Linear => write!(f, "Linear"),
            ParamClass::Bias => write!(f, "Bias"),
        }
    }
}

/// Identifies one parameter tensor of the model for optimizer assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamGroup {
    pub layer: usize,
    pub layer_name: String,
    pub class: ParamClass,
}

/// Parameters and their accumulated gradients, handed to an optimizer
pub struct ParamSlice<'a> {
    pub class: ParamClass,
    pub params: &'a mut [f32],
    pub grads: &'a [f32],
}

/// Fully connected layer: `act(x · W + b)`
pub struct Affine {
    name: String,
    weights: Matrix,
    weight_grad: Matrix,
    bias: Option<Vec<f32>>,
    bias_grad: Vec<f32>,
    activation: Activation,
    // cached by the training forward pass
    input: Option<Matrix>,
    output: Option<Matrix>,
}

impl Affine {
    fn new<R: Rng + ?Sized>(
        index: usize,
        spec: &LayerSpec,
        nin: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        let init_err = |source: InitError| NNError::Init { index, source };
        let weights = spec.init.fill(nin, spec.nout, rng).map_err(init_err)?;
        let bias = spec
            .bias
            .map(|b| b.fill(1, spec.nout, rng).map(|m| m.as_slice().to_vec()))
            .transpose()
            .map_err(init_err)?;
        Ok(Self {
            name: spec.resolved_name(index),
            weight_grad: Matrix::zeros(nin, spec.nout),
            bias_grad: vec![0.0; spec.nout],
            weights,
            bias,
            activation: spec.activation,
            input: None,
            output: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nin(&self) -> usize {
        self.weights.rows()
    }

    pub fn nout(&self) -> usize {
        self.weights.cols()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn weights(&self) -> &Matrix {
        &self.weights
    }

    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    fn check_input(&self, x: &Matrix) -> Result<(), NNError> {
        if x.cols() != self.nin() {
            return Err(NNError::InputSizeMismatch {
                expected: self.nin(),
                got: x.cols(),
            });
        }
        Ok(())
    }

    /// Forward pass without caching
    pub fn predict(&self, x: &Matrix) -> Result<Matrix, NNError> {
        self.check_input(x)?;
        let mut z = x.matmul(&self.weights);
        if let Some(bias) = &self.bias {
            z.add_row(bias);
        }
        Ok(self.activation.forward(&z))
    }

    /// Forward pass that keeps what the backward pass needs
    fn forward(&mut self, x: Matrix) -> Result<Matrix, NNError> {
        let out = self.predict(&x)?;
        let n_output_nans = out.count_nans();
        if n_output_nans > 0 {
            log::debug!("layer {}: n_output_nans: {}", self.name, n_output_nans);
        }
        self.input = Some(x);
        self.output = Some(out.clone());
        Ok(out)
    }

    /// Accumulates gradients and returns the delta for the previous layer.
    /// `skip_activation` is set when the cost already produced the pre-activation delta.
    fn backward(&mut self, delta: &Matrix, skip_activation: bool) -> Matrix {
        let (Some(input), Some(output)) = (&self.input, &self.output) else {
            // backward without a forward pass has nothing to propagate
            return Matrix::zeros(delta.rows(), self.nin());
        };
        let dz = if skip_activation {
            delta.clone()
        } else {
            self.activation.backward(output, delta)
        };
        self.weight_grad = input.t_matmul(&dz);
        if self.bias.is_some() {
            self.bias_grad = dz.sum_rows();
        }
        dz.matmul_t(&self.weights)
    }

    fn param_slices(&mut self) -> Vec<ParamSlice<'_>> {
        let mut slices = vec![ParamSlice {
            class: ParamClass::Linear,
            params: self.weights.as_mut_slice(),
            grads: self.weight_grad.as_slice(),
        }];
        if let Some(bias) = self.bias.as_mut() {
            slices.push(ParamSlice {
                class: ParamClass::Bias,
                params: bias,
                grads: &self.bias_grad,
            });
        }
        slices
    }
}

/// Ordered stack of affine layers
pub struct Model {
    layers: Vec<Affine>,
}

impl Model {
    /// Builds the layers in order, the first layer takes `n_inputs` features
    pub fn new<R: Rng + ?Sized>(
        specs: &[LayerSpec],
        n_inputs: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        LayerSpec::validate_all(specs)?;
        let mut nin = n_inputs;
        let mut layers = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            layers.push(Affine::new(index, spec, nin, rng)?);
            nin = spec.nout;
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Affine] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn n_outputs(&self) -> usize {
        self.layers.last().map_or(0, |l| l.nout())
    }

    pub fn output_activation(&self) -> Activation {
        self.layers
            .last()
            .map_or(Activation::Identity, |l| l.activation())
    }

    /// Every parameter tensor, in layer order with the linear part first
    pub fn param_groups(&self) -> Vec<ParamGroup> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(layer, l)| {
                let linear = std::iter::once(ParamGroup {
                    layer,
                    layer_name: l.name.clone(),
                    class: ParamClass::Linear,
                });
                let bias = l.has_bias().then(|| ParamGroup {
                    layer,
                    layer_name: l.name.clone(),
                    class: ParamClass::Bias,
                });
                linear.chain(bias)
            })
            .collect()
    }

    /// Mutable views matching `param_groups` one to one
    pub(crate) fn param_slices(&mut self) -> Vec<ParamSlice<'_>> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.param_slices())
            .collect()
    }

    pub fn predict(&self, x: &Matrix) -> Result<Matrix, NNError> {
        let mut layers = self.layers.iter();
        let Some(first) = layers.next() else {
            return Err(NNError::Empty);
        };
        let mut out = first.predict(x)?;
        for layer in layers {
            out = layer.predict(&out)?;
        }
        Ok(out)
    }

    pub(crate) fn forward(&mut self, x: &Matrix) -> Result<Matrix, NNError> {
        let mut out = x.clone();
        for layer in self.layers.iter_mut() {
            out = layer.forward(out)?;
        }
        Ok(out)
    }

    pub(crate) fn backward(&mut self, delta: &Matrix, shortcut: bool) {
        let mut delta = delta.clone();
        let n_layers = self.layers.len();
        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            delta = layer.backward(&delta, shortcut && i == n_layers - 1);
        }
    }
}
