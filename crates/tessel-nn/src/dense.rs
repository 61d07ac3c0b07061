// Dense — Fully-connected layer
//
//   output = input · W + b
//
// PARAMETER SHAPES:
//
//   weights: [in_features, out_features]
//   biases:  [out_features]              (optional, see LayerConfig::bias)
//
// Input is either one sample `[in_features]` (a matrix-vector product) or a
// batch `[batch, in_features]` (matrix-matrix). The output has the same rank.
//
// BACKWARD:
//
//   grad_input = grad_output · Wᵀ
//   grad_W     = inputᵀ · grad_output
//   grad_b     = column sums of grad_output over the batch
//
// The transposes are strides only; the input is cached into a buffer
// allocated at init so backward can read it after the caller reuses theirs.

use tessel_core::{Error, Result, Shape, Tensor};

use crate::init;
use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState, ParamKind};

/// A fully-connected layer.
///
/// ```
/// use tessel_core::{Shape, Tensor};
/// use tessel_nn::{Dense, Layer, LayerConfig};
///
/// let mut fc = Dense::new(4, 2, LayerConfig::default().seed(1));
/// fc.init(&Shape::from((3, 4)))?;
/// let y = fc.forward(&Tensor::ones((3, 4), Default::default()))?;
/// assert_eq!(y.dims(), &[3, 2]);
/// # Ok::<(), tessel_core::Error>(())
/// ```
#[derive(Debug)]
pub struct Dense {
    base: LayerBase,
    in_features: usize,
    out_features: usize,
    use_bias: bool,
    input: Tensor,
}

impl Dense {
    pub fn new(in_features: usize, out_features: usize, config: LayerConfig) -> Self {
        let use_bias = config.bias;
        let base = LayerBase::new(LayerKind::Dense, config);
        let input = Tensor::empty(base.dtype());
        Dense {
            base,
            in_features,
            out_features,
            use_bias,
            input,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weights(&self) -> Option<&Tensor> {
        self.base.params().get(ParamKind::Weights).map(|p| p.data())
    }

    pub fn biases(&self) -> Option<&Tensor> {
        self.base.params().get(ParamKind::Biases).map(|p| p.data())
    }

    fn compute_forward(&mut self, input: &Tensor) -> Result<()> {
        input.copy_to(&mut self.input)?;
        let w = self.base.params.data(ParamKind::Weights)?;
        input.matmul_to(w, &mut self.base.output)?;
        if self.use_bias {
            let b = self.base.params.data(ParamKind::Biases)?;
            self.base.output.add_row_assign(b)?;
        }
        Ok(())
    }

    fn compute_backward(&mut self, grad: &Tensor) -> Result<()> {
        let w = self.base.params.data(ParamKind::Weights)?;
        grad.matmul_t_to(w, &mut self.base.grad_input, false, true)?;
        if let Some(gw) = self.base.params.grad_mut(ParamKind::Weights) {
            self.input.matmul_t_to(grad, gw, true, false)?;
        }
        if let Some(gb) = self.base.params.grad_mut(ParamKind::Biases) {
            grad.sum_rows_to(gb)?;
        }
        Ok(())
    }
}

impl Layer for Dense {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[1, 2])?;
        if input.last_dim() != self.in_features {
            return Err(self.base.context(Error::ShapeMismatch {
                expected: input.with_last_dim(self.in_features),
                got: input.clone(),
            }));
        }
        Ok(input.with_last_dim(self.out_features))
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        let output = self.output_shape(input)?;
        let (fan_in, fan_out) = (self.in_features, self.out_features);
        let mut rng = self.base.rng();
        self.base
            .init_param(ParamKind::Weights, (fan_in, fan_out), |s, d| {
                init::xavier_uniform(s, fan_in, fan_out, d, &mut rng)
            })?;
        if self.use_bias {
            self.base
                .init_param(ParamKind::Biases, fan_out, |s, d| Ok(Tensor::zeros(s, d)))?;
        }
        self.input = Tensor::zeros(input, self.base.dtype());
        self.base.finish_init(input, output);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        self.compute_forward(input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        self.compute_backward(grad_output)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}
