// Pooling layers — MaxPool2d, AvgPool2d, GlobalAvgPool2d
//
// All three work on [N, C, H, W]:
//
//   MaxPool2d(k, s, p)   [N, C, H, W] -> [N, C, (H+2p-k)/s+1, (W+2p-k)/s+1]
//   AvgPool2d(k, s, p)   same geometry
//   GlobalAvgPool2d      [N, C, H, W] -> [N, C]
//
// Max pooling records, per output element, the flat input position of the
// window maximum. Backward sends each incoming gradient to that position
// and nowhere else. Padding never wins a max.
//
// Average pooling divides by the number of in-bounds cells under the
// window, so padding never dilutes the mean. Backward spreads g / count
// over those same cells.

use tessel_core::{Pool2dParams, Result, Shape, Tensor, NO_INDEX};

use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState};

fn pooled_shape(base: &LayerBase, input: &Shape, params: &Pool2dParams) -> Result<Shape> {
    base.validate_input(input, &[4])?;
    let d = input.dims();
    let (oh, ow) = params
        .output_hw(d[2], d[3])
        .map_err(|e| base.context(e))?;
    Ok(Shape::from((d[0], d[1], oh, ow)))
}

/// 2-D max pooling.
#[derive(Debug)]
pub struct MaxPool2d {
    base: LayerBase,
    params: Pool2dParams,
    indices: Vec<usize>,
}

impl MaxPool2d {
    pub fn new(params: Pool2dParams, config: LayerConfig) -> Self {
        MaxPool2d {
            base: LayerBase::new(LayerKind::MaxPool2d, config),
            params,
            indices: Vec::new(),
        }
    }

    pub fn params(&self) -> &Pool2dParams {
        &self.params
    }

    /// Flat input position chosen for each output element by the last
    /// forward pass (`NO_INDEX` for windows that covered only padding).
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl Layer for MaxPool2d {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        pooled_shape(&self.base, input, &self.params)
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        let output = self.output_shape(input)?;
        self.indices = vec![NO_INDEX; output.elem_count()];
        self.base.finish_init(input, output);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        input
            .max_pool2d_to(&self.params, &mut self.base.output, &mut self.indices)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        grad_output
            .max_pool2d_backward_to(&self.indices, &mut self.base.grad_input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}

/// 2-D average pooling.
#[derive(Debug)]
pub struct AvgPool2d {
    base: LayerBase,
    params: Pool2dParams,
}

impl AvgPool2d {
    pub fn new(params: Pool2dParams, config: LayerConfig) -> Self {
        AvgPool2d {
            base: LayerBase::new(LayerKind::AvgPool2d, config),
            params,
        }
    }

    pub fn params(&self) -> &Pool2dParams {
        &self.params
    }
}

impl Layer for AvgPool2d {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        pooled_shape(&self.base, input, &self.params)
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        let output = self.output_shape(input)?;
        self.base.finish_init(input, output);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        input
            .avg_pool2d_to(&self.params, &mut self.base.output)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        grad_output
            .avg_pool2d_backward_to(&self.params, &mut self.base.grad_input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}

/// Mean over the spatial dims of each channel.
#[derive(Debug)]
pub struct GlobalAvgPool2d {
    base: LayerBase,
}

impl GlobalAvgPool2d {
    pub fn new(config: LayerConfig) -> Self {
        GlobalAvgPool2d {
            base: LayerBase::new(LayerKind::GlobalAvgPool2d, config),
        }
    }
}

impl Layer for GlobalAvgPool2d {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[4])?;
        Ok(Shape::from((input.dims()[0], input.dims()[1])))
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        let output = self.output_shape(input)?;
        self.base.finish_init(input, output);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        input
            .global_avg_pool2d_to(&mut self.base.output)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        grad_output
            .global_avg_pool2d_backward_to(&mut self.base.grad_input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{DType, Error};

    fn plane(data: &[f32], h: usize, w: usize) -> Tensor {
        Tensor::from_slice(data, (1, 1, h, w)).unwrap()
    }

    #[test]
    fn max_pool_routes_to_argmax() -> Result<()> {
        let x = plane(
            &[1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 1.0, 8.0, 0.0, 1.0, 9.0, 2.0, 7.0, 0.0, 3.0, 1.0],
            4,
            4,
        );
        let mut mp = MaxPool2d::new(Pool2dParams::square(2), LayerConfig::default());
        mp.init(x.shape())?;
        assert_eq!(mp.forward(&x)?.to_vec::<f32>()?, vec![5.0, 8.0, 7.0, 9.0]);
        assert_eq!(mp.indices(), &[1, 7, 12, 10]);

        let g = plane(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let dx = mp.backward(&g)?.to_vec::<f32>()?;
        let mut expected = vec![0.0; 16];
        expected[1] = 1.0;
        expected[7] = 2.0;
        expected[12] = 3.0;
        expected[10] = 4.0;
        assert_eq!(dx, expected);
        Ok(())
    }

    #[test]
    fn avg_pool_spreads_evenly() -> Result<()> {
        let x = plane(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let mut ap = AvgPool2d::new(Pool2dParams::square(2), LayerConfig::default());
        ap.init(x.shape())?;
        assert_eq!(ap.forward(&x)?.to_vec::<f32>()?, vec![2.5]);
        let dx = ap.backward(&plane(&[4.0], 1, 1))?.to_vec::<f32>()?;
        assert_eq!(dx, vec![1.0; 4]);
        Ok(())
    }

    #[test]
    fn global_avg_pool() -> Result<()> {
        let x = Tensor::from_slice(&[1.0f32, 3.0, 10.0, 20.0], (1, 2, 1, 2))?;
        let mut gp = GlobalAvgPool2d::new(LayerConfig::default());
        assert_eq!(gp.output_shape(x.shape())?, Shape::from((1, 2)));
        gp.init(x.shape())?;
        assert_eq!(gp.forward(&x)?.to_vec::<f32>()?, vec![2.0, 15.0]);
        let dx = gp.backward(&Tensor::from_slice(&[2.0f32, 4.0], (1, 2))?)?;
        assert_eq!(dx.to_vec::<f32>()?, vec![1.0, 1.0, 2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn pooling_rejects_wrong_rank() {
        let mp = MaxPool2d::new(Pool2dParams::square(2), LayerConfig::default());
        let err = mp.output_shape(&Shape::from((4, 4))).unwrap_err();
        assert!(matches!(err.root(), Error::RankMismatch { expected: 4, got: 2 }));
        let mut ap = AvgPool2d::new(Pool2dParams::square(2), LayerConfig::default());
        assert!(ap.forward(&Tensor::zeros((1, 1, 2, 2), DType::F32)).is_err());
    }
}
