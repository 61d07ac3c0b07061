// Parameter — A learnable tensor and its gradient
//
// A Parameter pairs the values a layer learns ("data") with a gradient
// buffer of the same shape and dtype. The gradient exists only while
// gradient tracking is on; freezing a parameter drops it, so frozen
// layers skip the gradient kernels entirely.
//
// Layers overwrite `grad` on every backward pass with the contribution of
// the whole batch. Optimizers live outside this crate and read `data`/`grad`
// through the accessors below.

use tessel_core::{Result, Shape, Tensor};

/// A learnable tensor with an optional gradient of identical shape.
#[derive(Debug, Clone)]
pub struct Parameter {
    data: Tensor,
    grad: Option<Tensor>,
}

impl Parameter {
    /// Wrap `data`; a zeroed gradient is allocated when `requires_grad`.
    pub fn new(data: Tensor, requires_grad: bool) -> Self {
        let grad = requires_grad.then(|| data.zeros_like());
        Parameter { data, grad }
    }

    /// A parameter that never tracks gradients.
    pub fn frozen(data: Tensor) -> Self {
        Self::new(data, false)
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Tensor {
        &mut self.data
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Tensor> {
        self.grad.as_mut()
    }

    pub fn requires_grad(&self) -> bool {
        self.grad.is_some()
    }

    /// Turn gradient tracking on or off, allocating or dropping the buffer.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        match (requires_grad, self.grad.is_some()) {
            (true, false) => self.grad = Some(self.data.zeros_like()),
            (false, true) => self.grad = None,
            _ => {}
        }
    }

    pub fn zero_grad(&mut self) -> Result<()> {
        if let Some(g) = &mut self.grad {
            g.fill(0.0)?;
        }
        Ok(())
    }

    pub fn shape(&self) -> &Shape {
        self.data.shape()
    }

    pub fn elem_count(&self) -> usize {
        self.data.elem_count()
    }
}
