// Activation layers — Elementwise nonlinearities and softmax
//
// All four keep the input shape. Backward passes are computed from what
// forward left behind, never by re-running forward:
//
//   ReLU     grad ⊙ [x > 0]            mask written at forward time
//   Sigmoid  grad ⊙ y ⊙ (1 - y)        y = cached output
//   Tanh     grad ⊙ (1 - y²)           y = cached output
//   Softmax  y ⊙ (grad - Σ y ⊙ grad)   along the softmax dim, no Jacobian
//
// Sigmoid saturates to exactly 0/1 for |x| > 40, so its gradient there is 0.

use tessel_core::{CmpOp, Error, Result, Shape, Tensor};

use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState};

/// Shared forward/backward plumbing for the shape-preserving activations.
fn activation_init(base: &mut LayerBase, input: &Shape) -> Result<()> {
    base.validate_input(input, &[])?;
    base.finish_init(input, input.clone());
    Ok(())
}

/// ReLU: `max(0, x)`.
#[derive(Debug)]
pub struct Relu {
    base: LayerBase,
    mask: Tensor,
}

impl Relu {
    pub fn new(config: LayerConfig) -> Self {
        let base = LayerBase::new(LayerKind::Relu, config);
        let mask = Tensor::empty(base.dtype());
        Relu { base, mask }
    }
}

impl Layer for Relu {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[])?;
        Ok(input.clone())
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        activation_init(&mut self.base, input)?;
        self.mask = Tensor::zeros(input, self.base.dtype());
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        input
            .relu_to(&mut self.base.output)
            .and_then(|_| input.cmp_scalar_to(CmpOp::Gt, 0.0, &mut self.mask))
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        grad_output
            .mul_to(&self.mask, &mut self.base.grad_input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}

/// Logistic sigmoid.
#[derive(Debug)]
pub struct Sigmoid {
    base: LayerBase,
}

impl Sigmoid {
    pub fn new(config: LayerConfig) -> Self {
        Sigmoid {
            base: LayerBase::new(LayerKind::Sigmoid, config),
        }
    }
}

impl Layer for Sigmoid {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[])?;
        Ok(input.clone())
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        activation_init(&mut self.base, input)
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        input
            .sigmoid_to(&mut self.base.output)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        self.base
            .output
            .sigmoid_grad_to(grad_output, &mut self.base.grad_input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}

/// Hyperbolic tangent.
#[derive(Debug)]
pub struct Tanh {
    base: LayerBase,
}

impl Tanh {
    pub fn new(config: LayerConfig) -> Self {
        Tanh {
            base: LayerBase::new(LayerKind::Tanh, config),
        }
    }
}

impl Layer for Tanh {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[])?;
        Ok(input.clone())
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        activation_init(&mut self.base, input)
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        input
            .tanh_to(&mut self.base.output)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        self.base
            .output
            .tanh_grad_to(grad_output, &mut self.base.grad_input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}

/// Softmax along one dimension (the last one by default).
#[derive(Debug)]
pub struct Softmax {
    base: LayerBase,
    dim: Option<usize>,
}

impl Softmax {
    /// Softmax over the last dimension of whatever shape `init` receives.
    pub fn new(config: LayerConfig) -> Self {
        Softmax {
            base: LayerBase::new(LayerKind::Softmax, config),
            dim: None,
        }
    }

    /// Softmax over a fixed dimension.
    pub fn along(dim: usize, config: LayerConfig) -> Self {
        Softmax {
            base: LayerBase::new(LayerKind::Softmax, config),
            dim: Some(dim),
        }
    }

    fn resolve_dim(&self, shape: &Shape) -> Result<usize> {
        let dim = self.dim.unwrap_or(shape.rank().saturating_sub(1));
        if dim >= shape.rank() {
            return Err(self.base.context(Error::DimOutOfRange {
                dim,
                rank: shape.rank(),
            }));
        }
        Ok(dim)
    }
}

impl Layer for Softmax {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[])?;
        self.resolve_dim(input)?;
        Ok(input.clone())
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        self.output_shape(input)?;
        activation_init(&mut self.base, input)
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        let dim = self.resolve_dim(input.shape())?;
        input
            .softmax_to(dim, &mut self.base.output)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        let dim = self.resolve_dim(grad_output.shape())?;
        self.base
            .output
            .softmax_grad_to(grad_output, dim, &mut self.base.grad_input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}
