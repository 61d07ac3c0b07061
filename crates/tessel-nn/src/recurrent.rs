// LSTM cell — One step of a long short-term memory unit
//
// Each forward call advances the recurrent state by one time step:
//
//   [i f g o] = [x, h] · W + b           one fused matmul, W: [in + H, 4H]
//   i, f, o   = σ(i), σ(f), σ(o)
//   g         = tanh(g)
//   c'        = f ⊙ c + i ⊙ g
//   h'        = o ⊙ tanh(c')
//
// The output is h'. Hidden and cell state persist across calls until
// `reset_state` or `set_state`.
//
// BUFFERS:
//
// Everything is sized at init. The concatenation [x, h] is a single buffer
// with two narrow views, so writing x and h into it is two copies. The gate
// pre-activations, the activated gates and their gradients are each one
// [.., 4H] buffer plus four views (one per gate), created once. A forward
// step therefore never allocates.
//
// BACKWARD:
//
// `backward` differentiates the most recent step only (truncated BPTT of
// length one). It produces the gradient w.r.t. x as the layer's input
// gradient, the fused weight/bias gradients, and exposes the gradients
// w.r.t. the previous h and c through `state_grads` for callers that unroll
// through time themselves.

use tessel_core::{Error, Result, Shape, Tensor};

use crate::init;
use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState, ParamKind};

const I: usize = 0;
const F: usize = 1;
const G: usize = 2;
const O: usize = 3;

/// Four views of a `[.., 4H]` buffer, one per gate.
fn gate_views(t: &Tensor, hidden: usize) -> Result<[Tensor; 4]> {
    let dim = t.rank() - 1;
    Ok([
        t.narrow(dim, I * hidden, hidden)?,
        t.narrow(dim, F * hidden, hidden)?,
        t.narrow(dim, G * hidden, hidden)?,
        t.narrow(dim, O * hidden, hidden)?,
    ])
}

fn empty4(t: &Tensor) -> [Tensor; 4] {
    std::array::from_fn(|_| t.clone())
}

/// A single LSTM cell with persistent state.
#[derive(Debug)]
pub struct Lstm {
    base: LayerBase,
    input_size: usize,
    hidden_size: usize,
    use_bias: bool,

    hidden: Tensor,
    cell: Tensor,
    cell_prev: Tensor,
    tanh_cell: Tensor,

    xh: Tensor,
    xh_x: Tensor,
    xh_h: Tensor,
    pre: Tensor,
    pre_gates: [Tensor; 4],
    act: Tensor,
    gates: [Tensor; 4],

    dgates: Tensor,
    dgate: [Tensor; 4],
    dxh: Tensor,
    dxh_x: Tensor,
    dxh_h: Tensor,
    dcell: Tensor,
    dcell_prev: Tensor,
    tmp: Tensor,
}

impl Lstm {
    pub fn new(input_size: usize, hidden_size: usize, config: LayerConfig) -> Self {
        let use_bias = config.bias;
        let base = LayerBase::new(LayerKind::Lstm, config);
        let e = Tensor::empty(base.dtype());
        Lstm {
            base,
            input_size,
            hidden_size,
            use_bias,
            hidden: e.clone(),
            cell: e.clone(),
            cell_prev: e.clone(),
            tanh_cell: e.clone(),
            xh: e.clone(),
            xh_x: e.clone(),
            xh_h: e.clone(),
            pre: e.clone(),
            pre_gates: empty4(&e),
            act: e.clone(),
            gates: empty4(&e),
            dgates: e.clone(),
            dgate: empty4(&e),
            dxh: e.clone(),
            dxh_x: e.clone(),
            dxh_h: e.clone(),
            dcell: e.clone(),
            dcell_prev: e.clone(),
            tmp: e,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Current `(hidden, cell)` state.
    pub fn state(&self) -> (&Tensor, &Tensor) {
        (&self.hidden, &self.cell)
    }

    /// Zero the hidden and cell state.
    pub fn reset_state(&mut self) -> Result<()> {
        self.hidden.fill(0.0)?;
        self.cell.fill(0.0)
    }

    /// Overwrite the hidden and cell state. Both must have the output shape.
    pub fn set_state(&mut self, hidden: &Tensor, cell: &Tensor) -> Result<()> {
        if self.base.input_shape().is_none() {
            return Err(Error::NotInitialized {
                layer: self.base.name().to_string(),
            });
        }
        hidden.copy_to(&mut self.hidden)?;
        cell.copy_to(&mut self.cell)
    }

    /// Gradients w.r.t. the `(hidden, cell)` state that fed the last step,
    /// as computed by the last `backward`.
    pub fn state_grads(&self) -> (&Tensor, &Tensor) {
        (&self.dxh_h, &self.dcell_prev)
    }

    fn step(&mut self, input: &Tensor) -> Result<()> {
        input.copy_to(&mut self.xh_x)?;
        self.hidden.copy_to(&mut self.xh_h)?;
        self.cell.copy_to(&mut self.cell_prev)?;

        let w = self.base.params.data(ParamKind::Weights)?;
        self.xh.matmul_to(w, &mut self.pre)?;
        if self.use_bias {
            self.pre
                .add_row_assign(self.base.params.data(ParamKind::Biases)?)?;
        }

        self.pre_gates[I].sigmoid_to(&mut self.gates[I])?;
        self.pre_gates[F].sigmoid_to(&mut self.gates[F])?;
        self.pre_gates[G].tanh_to(&mut self.gates[G])?;
        self.pre_gates[O].sigmoid_to(&mut self.gates[O])?;

        self.gates[F].mul_to(&self.cell_prev, &mut self.cell)?;
        self.gates[I].mul_to(&self.gates[G], &mut self.tmp)?;
        self.cell.add_assign(&self.tmp)?;
        self.cell.tanh_to(&mut self.tanh_cell)?;
        self.gates[O].mul_to(&self.tanh_cell, &mut self.hidden)?;
        self.hidden.copy_to(&mut self.base.output)
    }

    fn step_backward(&mut self, grad: &Tensor) -> Result<()> {
        // output gate: dh ⊙ tanh(c') through σ'
        grad.mul_to(&self.tanh_cell, &mut self.tmp)?;
        self.gates[O].sigmoid_grad_to(&self.tmp, &mut self.dgate[O])?;

        // dc' = dh ⊙ o ⊙ (1 - tanh²(c'))
        grad.mul_to(&self.gates[O], &mut self.tmp)?;
        self.tanh_cell.tanh_grad_to(&self.tmp, &mut self.dcell)?;

        self.dcell.mul_to(&self.gates[G], &mut self.tmp)?;
        self.gates[I].sigmoid_grad_to(&self.tmp, &mut self.dgate[I])?;
        self.dcell.mul_to(&self.cell_prev, &mut self.tmp)?;
        self.gates[F].sigmoid_grad_to(&self.tmp, &mut self.dgate[F])?;
        self.dcell.mul_to(&self.gates[I], &mut self.tmp)?;
        self.gates[G].tanh_grad_to(&self.tmp, &mut self.dgate[G])?;
        self.dcell.mul_to(&self.gates[F], &mut self.dcell_prev)?;

        let w = self.base.params.data(ParamKind::Weights)?;
        self.dgates.matmul_t_to(w, &mut self.dxh, false, true)?;
        self.dxh_x.copy_to(&mut self.base.grad_input)?;
        if let Some(gw) = self.base.params.grad_mut(ParamKind::Weights) {
            self.xh.matmul_t_to(&self.dgates, gw, true, false)?;
        }
        if let Some(gb) = self.base.params.grad_mut(ParamKind::Biases) {
            self.dgates.sum_rows_to(gb)?;
        }
        Ok(())
    }

    fn allocate(&mut self, input: &Shape) -> Result<()> {
        let dtype = self.base.dtype();
        let (inp, h) = (self.input_size, self.hidden_size);
        let state = input.with_last_dim(h);
        let last = input.rank() - 1;

        self.hidden = Tensor::zeros(&state, dtype);
        self.cell = Tensor::zeros(&state, dtype);
        self.cell_prev = Tensor::zeros(&state, dtype);
        self.tanh_cell = Tensor::zeros(&state, dtype);
        self.dcell = Tensor::zeros(&state, dtype);
        self.dcell_prev = Tensor::zeros(&state, dtype);
        self.tmp = Tensor::zeros(&state, dtype);

        self.xh = Tensor::zeros(input.with_last_dim(inp + h), dtype);
        self.xh_x = self.xh.narrow(last, 0, inp)?;
        self.xh_h = self.xh.narrow(last, inp, h)?;
        self.dxh = Tensor::zeros(input.with_last_dim(inp + h), dtype);
        self.dxh_x = self.dxh.narrow(last, 0, inp)?;
        self.dxh_h = self.dxh.narrow(last, inp, h)?;

        let fused = input.with_last_dim(4 * h);
        self.pre = Tensor::zeros(&fused, dtype);
        self.pre_gates = gate_views(&self.pre, h)?;
        self.act = Tensor::zeros(&fused, dtype);
        self.gates = gate_views(&self.act, h)?;
        self.dgates = Tensor::zeros(&fused, dtype);
        self.dgate = gate_views(&self.dgates, h)?;
        Ok(())
    }
}

impl Layer for Lstm {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[1, 2])?;
        if input.last_dim() != self.input_size {
            return Err(self.base.context(Error::ShapeMismatch {
                expected: input.with_last_dim(self.input_size),
                got: input.clone(),
            }));
        }
        Ok(input.with_last_dim(self.hidden_size))
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        let output = self.output_shape(input)?;
        let (rows, cols) = (self.input_size + self.hidden_size, 4 * self.hidden_size);
        let mut rng = self.base.rng();
        self.base
            .init_param(ParamKind::Weights, (rows, cols), |s, d| {
                init::xavier_uniform(s, rows, cols, d, &mut rng)
            })?;
        if self.use_bias {
            self.base
                .init_param(ParamKind::Biases, cols, |s, d| Ok(Tensor::zeros(s, d)))?;
        }
        self.allocate(input).map_err(|e| self.base.context(e))?;
        self.base.finish_init(input, output);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        self.step(input).map_err(|e| self.base.context(e))?;
        tracing::trace!(layer = %self.base.name(), "lstm step");
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        self.step_backward(grad_output)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::{sigmoid, DType};

    fn f64_lstm(input: usize, hidden: usize, w: &[f64], b: &[f64]) -> Lstm {
        let cfg = LayerConfig::default()
            .dtype(DType::F64)
            .with_parameter(
                ParamKind::Weights,
                Tensor::from_slice(w, (input + hidden, 4 * hidden)).unwrap(),
            )
            .with_parameter(ParamKind::Biases, Tensor::from_slice(b, 4 * hidden).unwrap());
        Lstm::new(input, hidden, cfg)
    }

    /// One step of the cell equations with scalar state.
    fn manual_step(x: f64, h: f64, c: f64, w: &[f64], b: &[f64]) -> (f64, f64) {
        let pre = |k: usize| x * w[k] + h * w[4 + k] + b[k];
        let (i, f, g, o) = (sigmoid(pre(0)), sigmoid(pre(1)), pre(2).tanh(), sigmoid(pre(3)));
        let c2 = f * c + i * g;
        (o * c2.tanh(), c2)
    }

    #[test]
    fn forward_matches_gate_equations() -> Result<()> {
        let w = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        let b = [0.0, 0.1, -0.1, 0.2];
        let mut lstm = f64_lstm(1, 1, &w, &b);
        lstm.init(&Shape::from(1))?;

        let (mut h, mut c) = (0.0, 0.0);
        for x in [0.5, -1.0, 2.0] {
            (h, c) = manual_step(x, h, c, &w, &b);
            let out = lstm.forward(&Tensor::from_slice(&[x], 1)?)?.to_f64_vec()?;
            assert!((out[0] - h).abs() < 1e-12, "{} vs {h}", out[0]);
        }
        let (hs, cs) = lstm.state();
        assert!((cs.to_f64_vec()?[0] - c).abs() < 1e-12);
        assert!((hs.to_f64_vec()?[0] - h).abs() < 1e-12);

        lstm.reset_state()?;
        assert_eq!(lstm.state().0.sum_all()?, 0.0);
        Ok(())
    }

    #[test]
    fn batched_state_round_trip() -> Result<()> {
        let mut lstm = Lstm::new(3, 2, LayerConfig::default().seed(9));
        lstm.init(&Shape::from((4, 3)))?;
        assert_eq!(
            lstm.parameter(ParamKind::Weights).map(|p| p.shape().dims().to_vec()),
            Some(vec![5, 8])
        );
        let y = lstm.forward(&Tensor::ones((4, 3), DType::F32))?;
        assert_eq!(y.dims(), &[4, 2]);

        let h = Tensor::full((4, 2), 0.5, DType::F32);
        lstm.set_state(&h, &Tensor::zeros((4, 2), DType::F32))?;
        assert_eq!(lstm.state().0.to_vec::<f32>()?, vec![0.5; 8]);
        assert!(lstm.set_state(&Tensor::zeros(2, DType::F32), &h).is_err());
        Ok(())
    }

    #[test]
    fn backward_matches_finite_differences() -> Result<()> {
        let w = [
            0.3, -0.2, 0.5, 0.1, -0.4, 0.6, 0.2, -0.3, //
            0.7, 0.1, -0.5, 0.4, 0.2, 0.3, -0.1, 0.5, //
            0.1, -0.6, 0.3, 0.2, 0.4, 0.1, -0.2, 0.3, //
            -0.3, 0.2, 0.1, 0.6, 0.5, -0.1, 0.2, -0.4,
        ];
        let b = [0.1, 0.0, -0.1, 0.2, 0.0, 0.3, 0.1, -0.2];
        let mut lstm = f64_lstm(2, 2, &w, &b);
        lstm.init(&Shape::from((1, 2)))?;

        let loss = |lstm: &mut Lstm, x: [f64; 2]| -> Result<f64> {
            lstm.reset_state()?;
            lstm.forward(&Tensor::from_slice(&x, (1, 2))?)?.sum_all()
        };
        let x = [0.4, -0.7];
        loss(&mut lstm, x)?;
        let dx = lstm.backward(&Tensor::ones((1, 2), DType::F64))?.to_f64_vec()?;
        let dw = lstm
            .parameter(ParamKind::Weights)
            .and_then(|p| p.grad())
            .map(|g| g.get(&[1, 5]))
            .transpose()?
            .unwrap_or(f64::NAN);

        let eps = 1e-6;
        for k in 0..2 {
            let (mut hi, mut lo) = (x, x);
            hi[k] += eps;
            lo[k] -= eps;
            let numeric = (loss(&mut lstm, hi)? - loss(&mut lstm, lo)?) / (2.0 * eps);
            assert!((numeric - dx[k]).abs() < 1e-6, "dx[{k}]: {numeric} vs {}", dx[k]);
        }

        let nudge = |lstm: &mut Lstm, delta: f64| -> Result<()> {
            let p = lstm.parameter_mut(ParamKind::Weights).unwrap().data_mut();
            let v = p.get(&[1, 5])?;
            p.set(&[1, 5], v + delta)
        };
        nudge(&mut lstm, eps)?;
        let hi = loss(&mut lstm, x)?;
        nudge(&mut lstm, -2.0 * eps)?;
        let lo = loss(&mut lstm, x)?;
        let numeric = (hi - lo) / (2.0 * eps);
        assert!((numeric - dw).abs() < 1e-6, "dW: {numeric} vs {dw}");
        Ok(())
    }

    #[test]
    fn backward_before_forward() -> Result<()> {
        let mut lstm = Lstm::new(2, 2, LayerConfig::default());
        lstm.init(&Shape::from(2))?;
        assert!(matches!(
            lstm.backward(&Tensor::zeros(2, DType::F32)),
            Err(Error::BackwardBeforeForward { .. })
        ));
        Ok(())
    }
}
