// Op — Element-level operation descriptors
//
// These small Copy enums name the elementwise, comparison and reduction
// operations. Tensor methods take them as arguments, and the expression
// graph records them in its instruction tape, so eager execution and graph
// replay share exactly the same arithmetic.

/// Elementwise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Relu,
    Sigmoid,
    Tanh,
}

/// Sigmoid saturates to exactly 0 or 1 beyond this magnitude.
pub const SIGMOID_CLAMP: f64 = 40.0;

/// Logistic function with clamping for extreme inputs.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x > SIGMOID_CLAMP {
        1.0
    } else if x < -SIGMOID_CLAMP {
        0.0
    } else if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Square => x * x,
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => sigmoid(x),
            UnaryOp::Tanh => x.tanh(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Square => "square",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
        }
    }
}

/// Elementwise binary operations on same-shaped operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "maximum",
            BinaryOp::Min => "minimum",
        }
    }
}

/// Comparisons against a scalar, producing 1 or 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    #[inline]
    pub fn apply(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
        }
    }
}

/// Reductions over all elements or one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub(crate) fn init(self) -> f64 {
        match self {
            ReduceOp::Sum | ReduceOp::Mean => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        }
    }

    #[inline]
    pub(crate) fn combine(self, acc: f64, x: f64) -> f64 {
        match self {
            ReduceOp::Sum | ReduceOp::Mean => acc + x,
            ReduceOp::Max => acc.max(x),
            ReduceOp::Min => acc.min(x),
        }
    }

    #[inline]
    pub(crate) fn finish(self, acc: f64, n: usize) -> f64 {
        match self {
            ReduceOp::Mean if n > 0 => acc / n as f64,
            ReduceOp::Mean => 0.0,
            _ => acc,
        }
    }
}

/// Window geometry for 2-D pooling over NCHW tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2dParams {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Pool2dParams {
    /// Square window with matching stride and no padding.
    pub fn square(k: usize) -> Self {
        Pool2dParams {
            kernel: [k, k],
            stride: [k, k],
            padding: [0, 0],
        }
    }

    /// `(H + 2p - k) / s + 1` for both spatial dims.
    pub fn output_hw(&self, h: usize, w: usize) -> crate::Result<(usize, usize)> {
        Ok((
            window_out(h, self.kernel[0], self.stride[0], self.padding[0])?,
            window_out(w, self.kernel[1], self.stride[1], self.padding[1])?,
        ))
    }
}

/// Stride and padding for 2-D (and, with a unit height, 1-D) convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            stride: [1, 1],
            padding: [0, 0],
        }
    }
}

impl Conv2dParams {
    pub fn output_hw(
        &self,
        h: usize,
        w: usize,
        kh: usize,
        kw: usize,
    ) -> crate::Result<(usize, usize)> {
        Ok((
            window_out(h, kh, self.stride[0], self.padding[0])?,
            window_out(w, kw, self.stride[1], self.padding[1])?,
        ))
    }
}

pub(crate) fn window_out(size: usize, k: usize, s: usize, p: usize) -> crate::Result<usize> {
    if k == 0 || s == 0 {
        crate::bail!("window size and stride must be positive (kernel {k}, stride {s})");
    }
    let padded = size + 2 * p;
    if padded < k {
        crate::bail!("window {k} larger than padded input {padded}");
    }
    Ok((padded - k) / s + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_values() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!((sigmoid(10.0) - 0.9999546).abs() < 1e-6);
        assert_eq!(sigmoid(100.0), 1.0);
        assert_eq!(sigmoid(-100.0), 0.0);
        assert!((sigmoid(-10.0) - 4.5397869e-5).abs() < 1e-9);
    }

    #[test]
    fn window_sizes() {
        assert_eq!(window_out(4, 2, 2, 0).unwrap(), 2);
        assert_eq!(window_out(5, 3, 1, 1).unwrap(), 5);
        assert!(window_out(1, 3, 1, 0).is_err());
        assert!(window_out(4, 2, 0, 0).is_err());
    }
}
