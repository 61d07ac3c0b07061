// Model — An ordered chain of layers
//
//   let mut model = Model::new()
//       .add(Dense::new(4, 8, LayerConfig::default()))
//       .add(Relu::new(LayerConfig::default()))
//       .add(Dense::new(8, 2, LayerConfig::default()));
//   model.init(&Shape::from((batch, 4)))?;
//   let y = model.forward(&x)?;
//
// `init` walks the chain, initializing each layer with the output shape of
// the previous one. `forward` feeds layer i's output buffer straight into
// layer i+1 (no copies between layers); `backward` runs the mirrored chain
// in reverse. The model's own output and input gradient are the borrows
// returned by its last and first layer.
//
// A Model is itself a Layer, so models nest.

use tessel_core::{Error, Result, Shape, Tensor};

use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState, ParamKind};
use crate::parameter::Parameter;

/// A sequence of layers executed in insertion order.
pub struct Model {
    base: LayerBase,
    layers: Vec<Box<dyn Layer>>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.base.name())
            .field(
                "layers",
                &self.layers.iter().map(|l| l.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Model {
    /// An empty model with a generated name.
    pub fn new() -> Self {
        Self::with_config(LayerConfig::default())
    }

    /// An empty model called `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_config(LayerConfig::default().name(name))
    }

    pub fn with_config(config: LayerConfig) -> Self {
        Model {
            base: LayerBase::new(LayerKind::Model, config),
            layers: Vec::new(),
        }
    }

    /// Append a layer. Returns self for chaining.
    #[allow(clippy::should_implement_trait)]
    pub fn add<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.push(Box::new(layer));
        self
    }

    /// Append an already boxed layer.
    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
        self.base.set_state(LayerState::Uninitialized);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layers in execution order.
    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&dyn Layer> {
        self.layers.get(index).map(|l| l.as_ref())
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut (dyn Layer + 'static)> {
        self.layers.get_mut(index).map(|l| l.as_mut())
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&dyn Layer> {
        self.layers
            .iter()
            .find(|l| l.name() == name)
            .map(|l| l.as_ref())
    }

    /// The parameter `kind` of the layer called `layer`.
    pub fn parameter_of(&self, layer: &str, kind: ParamKind) -> Option<&Parameter> {
        self.layer_by_name(layer).and_then(|l| l.parameter(kind))
    }
}

fn no_layers(base: &LayerBase) -> Error {
    base.context(Error::msg("model has no layers"))
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for Model {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if self.layers.is_empty() {
            return Err(no_layers(&self.base));
        }
        self.layers
            .iter()
            .try_fold(input.clone(), |shape, layer| layer.output_shape(&shape))
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        if self.layers.is_empty() {
            return Err(no_layers(&self.base));
        }
        let mut shape = input.clone();
        for layer in &mut self.layers {
            layer.init(&shape)?;
            shape = layer.output_shape(&shape)?;
        }
        tracing::debug!(
            model = %self.base.name(),
            layers = self.layers.len(),
            input = %input,
            output = %shape,
            params = self.num_parameters(),
            "model initialized"
        );
        self.base.finish_init(input, shape);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        let Some((first, rest)) = self.layers.split_first_mut() else {
            return Err(no_layers(&self.base));
        };
        let mut out = first.forward(input)?;
        for layer in rest {
            out = layer.forward(out)?;
        }
        self.base.set_state(LayerState::ForwardComplete);
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        let Some((last, rest)) = self.layers.split_last_mut() else {
            return Err(no_layers(&self.base));
        };
        let mut grad = last.backward(grad_output)?;
        for layer in rest.iter_mut().rev() {
            grad = layer.backward(grad)?;
        }
        self.base.set_state(LayerState::BackwardComplete);
        Ok(grad)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.layers
            .iter()
            .flat_map(|l| l.named_parameters())
            .collect()
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.layers.iter_mut().try_for_each(|l| l.zero_grad())
    }

    /// Propagate training mode to every layer.
    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    fn is_training(&self) -> bool {
        self.layers.iter().any(|l| l.is_training())
    }
}
