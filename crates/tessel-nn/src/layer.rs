// Layer — The interface every operator implements
//
// A layer goes through a small lifecycle:
//
//   Uninitialized --init(shape)--> Initialized --forward--> ForwardComplete
//                                       ^                     |      ^
//                                       |                 backward   | forward
//                                     init                   v      |
//                                       +----------------- BackwardComplete
//
// `init` validates the input shape, creates parameters (unless they were
// supplied through the config) and allocates every buffer the layer will
// ever write: its output, its input gradient and any private scratch.
// After that, `forward` and `backward` only overwrite those buffers and
// hand back a borrow of them. Nothing is allocated on the steady-state path.
//
// SHARED STATE:
//
// Everything common to all layers lives in `LayerBase`: the name, the kind,
// the dtype, the lifecycle state, the parameter map and the output /
// input-gradient buffers. Concrete layers embed a base and add their own
// scratch; the `Layer` trait's provided methods read through `base()`.
//
// ERRORS:
//
// Each layer wraps the errors raised by its kernels with its own name
// (`Error::Layer`), so a failure deep inside a model still says which layer
// it came from.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tessel_core::{DType, Error, Result, Shape, Tensor};

use crate::parameter::Parameter;

static NEXT_LAYER_ID: AtomicUsize = AtomicUsize::new(0);

/// Which learnable tensor of a layer a parameter is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKind {
    Weights,
    Biases,
}

impl ParamKind {
    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::Weights => "weights",
            ParamKind::Biases => "biases",
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The operator a layer implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Dense,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    Dropout,
    MaxPool2d,
    AvgPool2d,
    GlobalAvgPool2d,
    Conv1d,
    Conv2d,
    Lstm,
    Flatten,
    Reshape,
    Squeeze,
    Unsqueeze,
    Transpose,
    Model,
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Dense => "dense",
            LayerKind::Relu => "relu",
            LayerKind::Sigmoid => "sigmoid",
            LayerKind::Tanh => "tanh",
            LayerKind::Softmax => "softmax",
            LayerKind::Dropout => "dropout",
            LayerKind::MaxPool2d => "max_pool2d",
            LayerKind::AvgPool2d => "avg_pool2d",
            LayerKind::GlobalAvgPool2d => "global_avg_pool2d",
            LayerKind::Conv1d => "conv1d",
            LayerKind::Conv2d => "conv2d",
            LayerKind::Lstm => "lstm",
            LayerKind::Flatten => "flatten",
            LayerKind::Reshape => "reshape",
            LayerKind::Squeeze => "squeeze",
            LayerKind::Unsqueeze => "unsqueeze",
            LayerKind::Transpose => "transpose",
            LayerKind::Model => "model",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerState {
    Uninitialized,
    Initialized,
    ForwardComplete,
    BackwardComplete,
}

/// Construction-time options shared by every layer.
///
/// ```
/// use tessel_nn::LayerConfig;
/// let cfg = LayerConfig::default().name("fc1").bias(false).seed(7);
/// assert_eq!(cfg.name.as_deref(), Some("fc1"));
/// ```
#[derive(Debug, Clone)]
pub struct LayerConfig {
    /// Layer name; generated from the kind when absent.
    pub name: Option<String>,
    /// Whether parameters track gradients.
    pub can_learn: bool,
    pub dtype: DType,
    /// Whether layers that support a bias create one.
    pub bias: bool,
    /// Seed for parameter initialization. Entropy-seeded when absent.
    pub seed: Option<u64>,
    /// Pre-trained values used instead of random initialization.
    pub parameters: BTreeMap<ParamKind, Tensor>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            name: None,
            can_learn: true,
            dtype: DType::F32,
            bias: true,
            seed: None,
            parameters: BTreeMap::new(),
        }
    }
}

impl LayerConfig {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn can_learn(mut self, can_learn: bool) -> Self {
        self.can_learn = can_learn;
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Supply the value of one parameter. It is checked against the
    /// expected shape at `init` and converted to the layer's dtype.
    pub fn with_parameter(mut self, kind: ParamKind, data: Tensor) -> Self {
        self.parameters.insert(kind, data);
        self
    }
}

/// The named parameters of a layer, in `ParamKind` order.
#[derive(Debug, Clone, Default)]
pub struct Params(BTreeMap<ParamKind, Parameter>);

impl Params {
    pub fn get(&self, kind: ParamKind) -> Option<&Parameter> {
        self.0.get(&kind)
    }

    pub fn get_mut(&mut self, kind: ParamKind) -> Option<&mut Parameter> {
        self.0.get_mut(&kind)
    }

    /// The values of a parameter the layer cannot work without.
    pub fn data(&self, kind: ParamKind) -> Result<&Tensor> {
        self.get(kind)
            .map(Parameter::data)
            .ok_or_else(|| Error::msg(format!("missing {kind} parameter")))
    }

    /// The gradient buffer of `kind`, if the parameter exists and tracks one.
    pub fn grad_mut(&mut self, kind: ParamKind) -> Option<&mut Tensor> {
        self.get_mut(kind).and_then(Parameter::grad_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamKind, &Parameter)> {
        self.0.iter().map(|(k, p)| (*k, p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamKind, &mut Parameter)> {
        self.0.iter_mut().map(|(k, p)| (*k, p))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// State shared by all layers.
#[derive(Debug)]
pub struct LayerBase {
    name: String,
    kind: LayerKind,
    can_learn: bool,
    dtype: DType,
    seed: Option<u64>,
    state: LayerState,
    input_shape: Option<Shape>,
    preset: BTreeMap<ParamKind, Tensor>,
    pub(crate) params: Params,
    pub(crate) output: Tensor,
    pub(crate) grad_input: Tensor,
}

impl LayerBase {
    pub fn new(kind: LayerKind, config: LayerConfig) -> Self {
        let name = config.name.unwrap_or_else(|| {
            let id = NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed);
            format!("{}_{id}", kind.name())
        });
        LayerBase {
            name,
            kind,
            can_learn: config.can_learn,
            dtype: config.dtype,
            seed: config.seed,
            state: LayerState::Uninitialized,
            input_shape: None,
            preset: config.parameters,
            params: Params::default(),
            output: Tensor::empty(config.dtype),
            grad_input: Tensor::empty(config.dtype),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn can_learn(&self) -> bool {
        self.can_learn
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn input_shape(&self) -> Option<&Shape> {
        self.input_shape.as_ref()
    }

    /// The shape `forward` produces; `None` before `init`.
    pub fn output_shape(&self) -> Option<&Shape> {
        self.input_shape.as_ref().map(|_| self.output.shape())
    }

    pub fn output(&self) -> &Tensor {
        &self.output
    }

    pub fn grad_input(&self) -> &Tensor {
        &self.grad_input
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub(crate) fn set_state(&mut self, state: LayerState) {
        self.state = state;
    }

    /// Fresh generator for initialization, from the configured seed.
    pub(crate) fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub(crate) fn context(&self, e: Error) -> Error {
        e.in_layer(&self.name)
    }

    /// Reject empty shapes and ranks outside `ranks`.
    pub(crate) fn validate_input(&self, input: &Shape, ranks: &[usize]) -> Result<()> {
        if input.is_empty() {
            return Err(self.context(Error::EmptyShape {
                shape: input.clone(),
            }));
        }
        if !ranks.is_empty() && !ranks.contains(&input.rank()) {
            return Err(self.context(Error::RankMismatch {
                expected: ranks[0],
                got: input.rank(),
            }));
        }
        Ok(())
    }

    /// Create parameter `kind` unless it already exists with `shape`.
    ///
    /// A value supplied through `LayerConfig::with_parameter` wins over
    /// `fill`; it must have exactly `shape`.
    pub(crate) fn init_param(
        &mut self,
        kind: ParamKind,
        shape: impl Into<Shape>,
        fill: impl FnOnce(&Shape, DType) -> Result<Tensor>,
    ) -> Result<()> {
        let shape = shape.into();
        if self.params.get(kind).is_some_and(|p| p.shape() == &shape) {
            return Ok(());
        }
        let data = match self.preset.remove(&kind) {
            Some(t) => {
                shape
                    .expect_eq(t.shape())
                    .map_err(|e| self.context(e))?;
                if t.dtype() == self.dtype {
                    t
                } else {
                    t.to_dtype(self.dtype)?
                }
            }
            None => fill(&shape, self.dtype)?,
        };
        self.params
            .0
            .insert(kind, Parameter::new(data, self.can_learn));
        Ok(())
    }

    /// Allocate the output and input-gradient buffers and enter
    /// `Initialized`.
    pub(crate) fn finish_init(&mut self, input: &Shape, output: Shape) {
        tracing::debug!(
            layer = %self.name,
            kind = %self.kind,
            input = %input,
            output = %output,
            params = self.params.iter().map(|(_, p)| p.elem_count()).sum::<usize>(),
            "layer initialized"
        );
        self.output = Tensor::zeros(output, self.dtype);
        self.grad_input = Tensor::zeros(input.clone(), self.dtype);
        self.input_shape = Some(input.clone());
        self.state = LayerState::Initialized;
    }

    /// Guard for `forward`: initialized, and `input` matches the init shape
    /// and dtype.
    pub(crate) fn begin_forward(&self, input: &Tensor) -> Result<()> {
        let expected = self.input_shape.as_ref().ok_or_else(|| Error::NotInitialized {
            layer: self.name.clone(),
        })?;
        expected
            .expect_eq(input.shape())
            .map_err(|e| self.context(e))?;
        if input.dtype() != self.dtype {
            return Err(self.context(Error::DTypeMismatch {
                expected: self.dtype,
                got: input.dtype(),
            }));
        }
        Ok(())
    }

    /// Guard for `backward`: a forward pass happened since the last `init`
    /// and `grad` matches the output.
    pub(crate) fn begin_backward(&self, grad: &Tensor) -> Result<()> {
        match self.state {
            LayerState::Uninitialized => {
                return Err(Error::NotInitialized {
                    layer: self.name.clone(),
                })
            }
            LayerState::Initialized => {
                return Err(Error::BackwardBeforeForward {
                    layer: self.name.clone(),
                })
            }
            LayerState::ForwardComplete | LayerState::BackwardComplete => {}
        }
        self.output
            .shape()
            .expect_eq(grad.shape())
            .map_err(|e| self.context(e))?;
        if grad.dtype() != self.dtype {
            return Err(self.context(Error::DTypeMismatch {
                expected: self.dtype,
                got: grad.dtype(),
            }));
        }
        Ok(())
    }
}

/// The contract every operator implements.
///
/// Implementors provide the six required methods; everything else reads
/// through [`LayerBase`].
///
/// ```
/// use tessel_core::{DType, Shape, Tensor};
/// use tessel_nn::{Layer, Relu};
///
/// let mut relu = Relu::new(Default::default());
/// relu.init(&Shape::from(3))?;
/// let x = Tensor::from_slice(&[-1.0f32, 0.5, 2.0], 3)?;
/// assert_eq!(relu.forward(&x)?.to_vec::<f32>()?, vec![0.0, 0.5, 2.0]);
/// # Ok::<(), tessel_core::Error>(())
/// ```
pub trait Layer: Send {
    fn base(&self) -> &LayerBase;

    fn base_mut(&mut self) -> &mut LayerBase;

    /// Validate `input`, create parameters and allocate every buffer.
    /// Calling it again re-sizes the buffers and keeps parameters whose
    /// shape did not change.
    fn init(&mut self, input: &Shape) -> Result<()>;

    /// The shape `forward` produces for `input`. Does not touch the layer.
    fn output_shape(&self, input: &Shape) -> Result<Shape>;

    /// Compute the output into the layer's buffer and return it.
    fn forward(&mut self, input: &Tensor) -> Result<&Tensor>;

    /// Compute the input gradient (and parameter gradients) from the
    /// gradient of the output, and return the input gradient.
    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn kind(&self) -> LayerKind {
        self.base().kind()
    }

    fn can_learn(&self) -> bool {
        self.base().can_learn()
    }

    fn state(&self) -> LayerState {
        self.base().state()
    }

    fn input_shape(&self) -> Option<&Shape> {
        self.base().input_shape()
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.base().params().iter().map(|(_, p)| p).collect()
    }

    /// Parameters keyed `"<layer name>.<param kind>"`.
    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let name = self.name();
        self.base()
            .params()
            .iter()
            .map(|(k, p)| (format!("{name}.{k}"), p))
            .collect()
    }

    fn parameter(&self, kind: ParamKind) -> Option<&Parameter> {
        self.base().params().get(kind)
    }

    fn parameter_mut(&mut self, kind: ParamKind) -> Option<&mut Parameter> {
        self.base_mut().params_mut().get_mut(kind)
    }

    fn zero_grad(&mut self) -> Result<()> {
        for (_, p) in self.base_mut().params_mut().iter_mut() {
            p.zero_grad()?;
        }
        Ok(())
    }

    /// Switch between training and inference behaviour. Only layers that
    /// behave differently (dropout) override this.
    fn set_training(&mut self, _training: bool) {}

    fn is_training(&self) -> bool {
        false
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }
}
