// Loss functions
//
// A loss turns (prediction, target) into a scalar and produces the gradient
// of that scalar w.r.t. the prediction, which is what a model's backward
// chain starts from.
//
//   Mse:                    mean((pred - target)²)
//                           grad = 2·(pred - target) / n
//
//   CrossEntropy:           -Σ target · ln(pred + ε)     over pred > 0
//                           grad = -target / (pred + ε)  where pred > 0, else 0
//
//   CategoricalCrossEntropy cross-entropy of softmax(logits) along the last
//   (from_logits = true):   dim; grad = softmax(logits) - target
//
// Scratch buffers are owned by the loss and re-sized only when the shape or
// dtype of the prediction changes, so repeated training steps do not
// allocate. `gradient` returns a borrow of the loss's own buffer.

use tessel_core::{CmpOp, Error, Result, Tensor};

/// Added to predictions before taking the log.
pub const CROSS_ENTROPY_EPSILON: f64 = 1e-10;

/// A differentiable scalar objective.
pub trait Loss {
    /// The loss value for `pred` against `target`.
    fn compute(&mut self, pred: &Tensor, target: &Tensor) -> Result<f64>;

    /// d(loss)/d(pred), written into a buffer owned by the loss.
    fn gradient(&mut self, pred: &Tensor, target: &Tensor) -> Result<&Tensor>;
}

fn validate(pred: &Tensor, target: &Tensor) -> Result<()> {
    if pred.shape().is_empty() {
        return Err(Error::EmptyShape {
            shape: pred.shape().clone(),
        });
    }
    pred.shape().expect_eq(target.shape())?;
    if pred.dtype() != target.dtype() {
        return Err(Error::DTypeMismatch {
            expected: pred.dtype(),
            got: target.dtype(),
        });
    }
    Ok(())
}

/// Re-allocate `buf` unless it already matches `like`.
fn fit(buf: &mut Tensor, like: &Tensor) {
    if buf.shape() != like.shape() || buf.dtype() != like.dtype() {
        *buf = Tensor::zeros(like.shape(), like.dtype());
    }
}

/// Mean squared error.
#[derive(Debug)]
pub struct Mse {
    diff: Tensor,
    sq: Tensor,
    grad: Tensor,
}

impl Mse {
    pub fn new() -> Self {
        let e = Tensor::empty(Default::default());
        Mse {
            diff: e.clone(),
            sq: e.clone(),
            grad: e,
        }
    }
}

impl Default for Mse {
    fn default() -> Self {
        Self::new()
    }
}

impl Loss for Mse {
    fn compute(&mut self, pred: &Tensor, target: &Tensor) -> Result<f64> {
        validate(pred, target)?;
        fit(&mut self.diff, pred);
        fit(&mut self.sq, pred);
        pred.sub_to(target, &mut self.diff)?;
        self.diff.square_to(&mut self.sq)?;
        self.sq.mean_all()
    }

    fn gradient(&mut self, pred: &Tensor, target: &Tensor) -> Result<&Tensor> {
        validate(pred, target)?;
        fit(&mut self.diff, pred);
        fit(&mut self.grad, pred);
        pred.sub_to(target, &mut self.diff)?;
        let n = pred.elem_count() as f64;
        self.diff.affine_to(2.0 / n, 0.0, &mut self.grad)?;
        Ok(&self.grad)
    }
}

/// Scratch shared by the cross-entropy variants.
#[derive(Debug)]
struct EntropyScratch {
    mask: Tensor,
    a: Tensor,
    b: Tensor,
    grad: Tensor,
}

impl EntropyScratch {
    fn new() -> Self {
        let e = Tensor::empty(Default::default());
        EntropyScratch {
            mask: e.clone(),
            a: e.clone(),
            b: e.clone(),
            grad: e,
        }
    }

    fn fit(&mut self, like: &Tensor) {
        fit(&mut self.mask, like);
        fit(&mut self.a, like);
        fit(&mut self.b, like);
        fit(&mut self.grad, like);
    }

    /// `b = max(pred, 0) + ε`, `mask = pred > 0`.
    fn shifted(&mut self, pred: &Tensor) -> Result<()> {
        pred.cmp_scalar_to(CmpOp::Gt, 0.0, &mut self.mask)?;
        pred.relu_to(&mut self.a)?;
        self.a.affine_to(1.0, CROSS_ENTROPY_EPSILON, &mut self.b)
    }

    fn value(&mut self, pred: &Tensor, target: &Tensor) -> Result<f64> {
        self.fit(pred);
        self.shifted(pred)?;
        self.b.log_to(&mut self.a)?;
        self.a.mul_assign(&self.mask)?;
        self.a.mul_assign(target)?;
        Ok(-self.a.sum_all()?)
    }

    fn gradient(&mut self, pred: &Tensor, target: &Tensor) -> Result<&Tensor> {
        self.fit(pred);
        self.shifted(pred)?;
        target.div_to(&self.b, &mut self.a)?;
        self.a.mul_assign(&self.mask)?;
        self.a.neg_to(&mut self.grad)?;
        Ok(&self.grad)
    }
}

/// Cross-entropy over probabilities.
#[derive(Debug)]
pub struct CrossEntropy {
    scratch: EntropyScratch,
}

impl CrossEntropy {
    pub fn new() -> Self {
        CrossEntropy {
            scratch: EntropyScratch::new(),
        }
    }
}

impl Default for CrossEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl Loss for CrossEntropy {
    fn compute(&mut self, pred: &Tensor, target: &Tensor) -> Result<f64> {
        validate(pred, target)?;
        self.scratch.value(pred, target)
    }

    fn gradient(&mut self, pred: &Tensor, target: &Tensor) -> Result<&Tensor> {
        validate(pred, target)?;
        self.scratch.gradient(pred, target)
    }
}

/// Cross-entropy over class scores along the last dimension.
///
/// With `from_logits` the prediction goes through a softmax first and the
/// gradient takes the fused `softmax - target` form.
#[derive(Debug)]
pub struct CategoricalCrossEntropy {
    from_logits: bool,
    prob: Tensor,
    scratch: EntropyScratch,
}

impl CategoricalCrossEntropy {
    pub fn new(from_logits: bool) -> Self {
        CategoricalCrossEntropy {
            from_logits,
            prob: Tensor::empty(Default::default()),
            scratch: EntropyScratch::new(),
        }
    }

    pub fn from_logits(&self) -> bool {
        self.from_logits
    }

    fn softmax(&mut self, logits: &Tensor) -> Result<()> {
        fit(&mut self.prob, logits);
        logits.softmax_to(logits.rank() - 1, &mut self.prob)
    }
}

impl Loss for CategoricalCrossEntropy {
    fn compute(&mut self, pred: &Tensor, target: &Tensor) -> Result<f64> {
        validate(pred, target)?;
        if !self.from_logits {
            return self.scratch.value(pred, target);
        }
        self.softmax(pred)?;
        self.scratch.value(&self.prob, target)
    }

    fn gradient(&mut self, pred: &Tensor, target: &Tensor) -> Result<&Tensor> {
        validate(pred, target)?;
        if !self.from_logits {
            return self.scratch.gradient(pred, target);
        }
        self.softmax(pred)?;
        fit(&mut self.scratch.grad, pred);
        self.prob.sub_to(target, &mut self.scratch.grad)?;
        Ok(&self.scratch.grad)
    }
}
