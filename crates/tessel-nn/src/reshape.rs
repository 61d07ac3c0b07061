// Reshape layers — Change how a tensor is indexed, never its values
//
//   Flatten     [N, d1, d2, ...] -> [N, d1·d2·...], or any dim range
//   Reshape     any shape with the same element count
//   Squeeze     drop size-1 dims (all of them, or the listed ones)
//   Unsqueeze   insert a size-1 dim
//   Transpose   swap two dims
//
// All but Transpose keep the row-major order of the elements, so forward
// and backward are flat copies between the pre-allocated buffers.
// Transpose copies through a strided view of its input or gradient.

use tessel_core::{Error, Result, Shape, Tensor};

use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState};

/// Collapses dims `start..end` (end exclusive) into one.
#[derive(Debug)]
pub struct Flatten {
    base: LayerBase,
    start: usize,
    end: Option<usize>,
}

impl Flatten {
    /// Flatten every dim after the batch dim. A rank-1 input passes through.
    pub fn new(config: LayerConfig) -> Self {
        Flatten {
            base: LayerBase::new(LayerKind::Flatten, config),
            start: 1,
            end: None,
        }
    }

    /// Flatten dims `start..end`; `None` runs to the last dim.
    pub fn range(start: usize, end: Option<usize>, config: LayerConfig) -> Self {
        Flatten {
            base: LayerBase::new(LayerKind::Flatten, config),
            start,
            end,
        }
    }

    fn flattened(&self, input: &Shape) -> Result<Shape> {
        let d = input.dims();
        let end = match self.end {
            None if self.start >= d.len() => return Ok(input.clone()),
            None => d.len(),
            Some(end) => end,
        };
        if self.start >= end || end > d.len() {
            return Err(Error::msg(format!(
                "flatten range {}..{end} invalid for {input}",
                self.start
            )));
        }
        let mut dims = d[..self.start].to_vec();
        dims.push(d[self.start..end].iter().product());
        dims.extend_from_slice(&d[end..]);
        Ok(Shape::new(dims))
    }
}

/// Gives the input a fixed target shape with the same element count.
#[derive(Debug)]
pub struct Reshape {
    base: LayerBase,
    target: Shape,
}

impl Reshape {
    pub fn new(target: impl Into<Shape>, config: LayerConfig) -> Self {
        Reshape {
            base: LayerBase::new(LayerKind::Reshape, config),
            target: target.into(),
        }
    }

    fn reshaped(&self, input: &Shape) -> Result<Shape> {
        if self.target.is_empty() || self.target.elem_count() != input.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: input.elem_count(),
                dst: self.target.elem_count(),
                dst_shape: self.target.clone(),
            });
        }
        Ok(self.target.clone())
    }
}

/// Removes size-1 dims.
#[derive(Debug)]
pub struct Squeeze {
    base: LayerBase,
    dims: Option<Vec<usize>>,
}

impl Squeeze {
    /// Remove every size-1 dim.
    pub fn new(config: LayerConfig) -> Self {
        Squeeze {
            base: LayerBase::new(LayerKind::Squeeze, config),
            dims: None,
        }
    }

    /// Remove exactly `dims`, each of which must have size 1.
    pub fn dims(dims: &[usize], config: LayerConfig) -> Self {
        Squeeze {
            base: LayerBase::new(LayerKind::Squeeze, config),
            dims: Some(dims.to_vec()),
        }
    }

    fn squeezed(&self, input: &Shape) -> Result<Shape> {
        let d = input.dims();
        let dims = match &self.dims {
            None => d.iter().copied().filter(|&n| n != 1).collect(),
            Some(drop) => {
                for &i in drop {
                    if input.dim(i)? != 1 {
                        return Err(Error::msg(format!(
                            "cannot squeeze dim {i} of size {} in {input}",
                            d[i]
                        )));
                    }
                }
                d.iter()
                    .enumerate()
                    .filter(|(i, _)| !drop.contains(i))
                    .map(|(_, &n)| n)
                    .collect()
            }
        };
        Ok(Shape::new(dims))
    }
}

/// Inserts a size-1 dim at `dim` (`0..=rank`).
#[derive(Debug)]
pub struct Unsqueeze {
    base: LayerBase,
    dim: usize,
}

impl Unsqueeze {
    pub fn new(dim: usize, config: LayerConfig) -> Self {
        Unsqueeze {
            base: LayerBase::new(LayerKind::Unsqueeze, config),
            dim,
        }
    }

    fn unsqueezed(&self, input: &Shape) -> Result<Shape> {
        if self.dim > input.rank() {
            return Err(Error::DimOutOfRange {
                dim: self.dim,
                rank: input.rank() + 1,
            });
        }
        let mut dims = input.dims().to_vec();
        dims.insert(self.dim, 1);
        Ok(Shape::new(dims))
    }
}

/// Swaps two dims; `[M, N] -> [N, M]` by default.
#[derive(Debug)]
pub struct Transpose {
    base: LayerBase,
    dims: (usize, usize),
}

impl Transpose {
    pub fn new(config: LayerConfig) -> Self {
        Self::dims(0, 1, config)
    }

    pub fn dims(dim0: usize, dim1: usize, config: LayerConfig) -> Self {
        Transpose {
            base: LayerBase::new(LayerKind::Transpose, config),
            dims: (dim0, dim1),
        }
    }

    fn transposed(&self, input: &Shape) -> Result<Shape> {
        let (a, b) = self.dims;
        let mut dims = input.dims().to_vec();
        input.dim(a)?;
        input.dim(b)?;
        dims.swap(a, b);
        Ok(Shape::new(dims))
    }
}

/// `Layer` for a layer whose output is its input in a new shape.
macro_rules! flat_copy_layer {
    ($ty:ident, $shape:ident) => {
        impl Layer for $ty {
            fn base(&self) -> &LayerBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut LayerBase {
                &mut self.base
            }

            fn output_shape(&self, input: &Shape) -> Result<Shape> {
                self.base.validate_input(input, &[])?;
                self.$shape(input).map_err(|e| self.base.context(e))
            }

            fn init(&mut self, input: &Shape) -> Result<()> {
                let output = self.output_shape(input)?;
                self.base.finish_init(input, output);
                Ok(())
            }

            fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
                self.base.begin_forward(input)?;
                input
                    .copy_flat_to(&mut self.base.output)
                    .map_err(|e| self.base.context(e))?;
                self.base.set_state(LayerState::ForwardComplete);
                Ok(&self.base.output)
            }

            fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
                self.base.begin_backward(grad_output)?;
                grad_output
                    .copy_flat_to(&mut self.base.grad_input)
                    .map_err(|e| self.base.context(e))?;
                self.base.set_state(LayerState::BackwardComplete);
                Ok(&self.base.grad_input)
            }
        }
    };
}

flat_copy_layer!(Flatten, flattened);
flat_copy_layer!(Reshape, reshaped);
flat_copy_layer!(Squeeze, squeezed);
flat_copy_layer!(Unsqueeze, unsqueezed);

impl Layer for Transpose {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[])?;
        self.transposed(input).map_err(|e| self.base.context(e))
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        let output = self.output_shape(input)?;
        self.base.finish_init(input, output);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        let (a, b) = self.dims;
        input
            .transpose(a, b)
            .and_then(|t| t.copy_to(&mut self.base.output))
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        let (a, b) = self.dims;
        grad_output
            .transpose(a, b)
            .and_then(|t| t.copy_to(&mut self.base.grad_input))
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}
