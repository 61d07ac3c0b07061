// Convolution layers — Conv1d and Conv2d
//
//   Conv2d: [N, C_in, H, W] -> [N, C_out, H_out, W_out]
//           kernels [C_out, C_in, kH, kW], biases [C_out]
//   Conv1d: [N, C_in, L]    -> [N, C_out, L_out]
//           kernels [C_out, C_in, K],      biases [C_out]
//
//   H_out = (H + 2·pad - kH) / stride + 1
//
// Both layers drive the same four tensor kernels; a rank-3 tensor is a
// rank-4 one with unit height, so Conv1d only differs in how it builds its
// shapes and parameters.
//
// BACKWARD:
//
//   grad_input  = full correlation of grad_output with the flipped kernels
//   grad_kernel = correlation of the input with grad_output, summed over N
//   grad_bias   = grad_output summed over N and every output position

use tessel_core::{Conv2dParams, Error, Result, Shape, Tensor};

use crate::init;
use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState, ParamKind};

/// Geometry and cached input shared by Conv1d and Conv2d.
#[derive(Debug)]
struct Convolution {
    in_channels: usize,
    out_channels: usize,
    /// [kH, kW]; kH = 1 for 1-D.
    kernel: [usize; 2],
    params: Conv2dParams,
    use_bias: bool,
    /// 3 for 1-D, 4 for 2-D.
    rank: usize,
    input: Tensor,
}

impl Convolution {
    fn kernel_shape(&self) -> Shape {
        let [kh, kw] = self.kernel;
        if self.rank == 3 {
            Shape::from((self.out_channels, self.in_channels, kw))
        } else {
            Shape::from((self.out_channels, self.in_channels, kh, kw))
        }
    }

    fn output_shape(&self, base: &LayerBase, input: &Shape) -> Result<Shape> {
        base.validate_input(input, &[self.rank])?;
        let d = input.dims();
        if d[1] != self.in_channels {
            let mut expected = d.to_vec();
            expected[1] = self.in_channels;
            return Err(base.context(Error::ShapeMismatch {
                expected: Shape::new(expected),
                got: input.clone(),
            }));
        }
        let [kh, kw] = self.kernel;
        if self.rank == 3 {
            let (_, ow) = self
                .params
                .output_hw(1, d[2], 1, kw)
                .map_err(|e| base.context(e))?;
            Ok(Shape::from((d[0], self.out_channels, ow)))
        } else {
            let (oh, ow) = self
                .params
                .output_hw(d[2], d[3], kh, kw)
                .map_err(|e| base.context(e))?;
            Ok(Shape::from((d[0], self.out_channels, oh, ow)))
        }
    }

    fn init(&mut self, base: &mut LayerBase, input: &Shape) -> Result<()> {
        let output = self.output_shape(base, input)?;
        let window: usize = self.kernel.iter().product();
        let fan_in = self.in_channels * window;
        let fan_out = self.out_channels * window;
        let mut rng = base.rng();
        base.init_param(ParamKind::Weights, self.kernel_shape(), |s, d| {
            init::xavier_uniform(s, fan_in, fan_out, d, &mut rng)
        })?;
        if self.use_bias {
            base.init_param(ParamKind::Biases, self.out_channels, |s, d| {
                Ok(Tensor::zeros(s, d))
            })?;
        }
        self.input = Tensor::zeros(input, base.dtype());
        base.finish_init(input, output);
        Ok(())
    }

    fn forward(&mut self, base: &mut LayerBase, input: &Tensor) -> Result<()> {
        input.copy_to(&mut self.input)?;
        let w = base.params.data(ParamKind::Weights)?;
        let b = if self.use_bias {
            Some(base.params.data(ParamKind::Biases)?)
        } else {
            None
        };
        input.conv2d_to(w, b, &self.params, &mut base.output)
    }

    fn backward(&mut self, base: &mut LayerBase, grad: &Tensor) -> Result<()> {
        let w = base.params.data(ParamKind::Weights)?;
        grad.conv2d_input_grad_to(w, &self.params, &mut base.grad_input)?;
        if let Some(gw) = base.params.grad_mut(ParamKind::Weights) {
            self.input.conv2d_kernel_grad_to(grad, &self.params, gw)?;
        }
        if let Some(gb) = base.params.grad_mut(ParamKind::Biases) {
            grad.conv2d_bias_grad_to(gb)?;
        }
        Ok(())
    }
}

/// 2-D convolution over `[N, C, H, W]`.
#[derive(Debug)]
pub struct Conv2d {
    base: LayerBase,
    conv: Convolution,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: [usize; 2],
        params: Conv2dParams,
        config: LayerConfig,
    ) -> Self {
        let use_bias = config.bias;
        let base = LayerBase::new(LayerKind::Conv2d, config);
        let input = Tensor::empty(base.dtype());
        Conv2d {
            base,
            conv: Convolution {
                in_channels,
                out_channels,
                kernel,
                params,
                use_bias,
                rank: 4,
                input,
            },
        }
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        self.conv.kernel
    }

    pub fn params(&self) -> &Conv2dParams {
        &self.conv.params
    }
}

/// 1-D convolution over `[N, C, L]`.
#[derive(Debug)]
pub struct Conv1d {
    base: LayerBase,
    conv: Convolution,
}

impl Conv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        config: LayerConfig,
    ) -> Self {
        let use_bias = config.bias;
        let base = LayerBase::new(LayerKind::Conv1d, config);
        let input = Tensor::empty(base.dtype());
        Conv1d {
            base,
            conv: Convolution {
                in_channels,
                out_channels,
                kernel: [1, kernel],
                params: Conv2dParams {
                    stride: [1, stride],
                    padding: [0, padding],
                },
                use_bias,
                rank: 3,
                input,
            },
        }
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.conv.kernel[1]
    }
}

macro_rules! conv_layer {
    ($ty:ident) => {
        impl Layer for $ty {
            fn base(&self) -> &LayerBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut LayerBase {
                &mut self.base
            }

            fn output_shape(&self, input: &Shape) -> Result<Shape> {
                self.conv.output_shape(&self.base, input)
            }

            fn init(&mut self, input: &Shape) -> Result<()> {
                self.conv.init(&mut self.base, input)
            }

            fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
                self.base.begin_forward(input)?;
                self.conv
                    .forward(&mut self.base, input)
                    .map_err(|e| self.base.context(e))?;
                self.base.set_state(LayerState::ForwardComplete);
                Ok(&self.base.output)
            }

            fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
                self.base.begin_backward(grad_output)?;
                self.conv
                    .backward(&mut self.base, grad_output)
                    .map_err(|e| self.base.context(e))?;
                self.base.set_state(LayerState::BackwardComplete);
                Ok(&self.base.grad_input)
            }
        }
    };
}

conv_layer!(Conv2d);
conv_layer!(Conv1d);
