// Tensor arithmetic: elementwise, comparison, reduction, matmul
//
// Each operation comes in two forms:
//
//   x.relu()?                 allocates and returns a new tensor
//   x.relu_to(&mut out)?      writes into `out`, which must already have the
//                             result's shape and dtype
//
// The allocating form is always a thin wrapper over the `_to` form.
// Operands of binary ops must have identical shapes and dtypes; there is no
// implicit broadcasting (use `add_row_to` for the bias pattern).

use crate::cpu::{self, Mat};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::op::{BinaryOp, CmpOp, ReduceOp, UnaryOp};
use crate::shape::Shape;
use crate::storage::{with_any_pair, with_same, with_same3, with_slice};
use crate::tensor::{ReadPair, Tensor};

pub(crate) fn expect_dtype(expected: DType, got: DType) -> Result<()> {
    if expected != got {
        return Err(Error::DTypeMismatch { expected, got });
    }
    Ok(())
}

macro_rules! unary_methods {
    ($($name:ident, $name_to:ident => $op:ident;)*) => {$(
        pub fn $name(&self) -> Result<Tensor> {
            self.unary(UnaryOp::$op)
        }

        pub fn $name_to(&self, dst: &mut Tensor) -> Result<()> {
            self.unary_to(UnaryOp::$op, dst)
        }
    )*};
}

macro_rules! binary_methods {
    ($($name:ident, $name_to:ident => $op:ident;)*) => {$(
        pub fn $name(&self, rhs: &Tensor) -> Result<Tensor> {
            self.binary(BinaryOp::$op, rhs)
        }

        pub fn $name_to(&self, rhs: &Tensor, dst: &mut Tensor) -> Result<()> {
            self.binary_to(BinaryOp::$op, rhs, dst)
        }
    )*};
}

impl Tensor {
    /// Error unless `dst` has the same shape and dtype as `self`.
    pub(crate) fn expect_like(&self, dst: &Tensor) -> Result<()> {
        self.shape().expect_eq(dst.shape())?;
        expect_dtype(self.dtype(), dst.dtype())
    }

    // Elementwise unary

    pub fn unary(&self, op: UnaryOp) -> Result<Tensor> {
        let mut out = self.zeros_like();
        self.unary_to(op, &mut out)?;
        Ok(out)
    }

    pub fn unary_to(&self, op: UnaryOp, dst: &mut Tensor) -> Result<()> {
        self.map_to(dst, |x| op.apply(x))
    }

    /// `dst = f(self)` elementwise, same shape and dtype.
    pub(crate) fn map_to(&self, dst: &mut Tensor, f: impl Fn(f64) -> f64) -> Result<()> {
        self.expect_like(dst)?;
        let src = self.detached_from(dst);
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        with_same!((&*s, &mut *d), (a, b) => cpu::map(a, src.layout(), b, dst.layout(), f),
            return Err(Error::DTypeMismatch { expected: src.dtype(), got: dst.dtype() }));
        Ok(())
    }

    unary_methods! {
        neg, neg_to => Neg;
        abs, abs_to => Abs;
        exp, exp_to => Exp;
        log, log_to => Log;
        sqrt, sqrt_to => Sqrt;
        square, square_to => Square;
        relu, relu_to => Relu;
        sigmoid, sigmoid_to => Sigmoid;
        tanh, tanh_to => Tanh;
    }

    /// `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Tensor> {
        let mut out = self.zeros_like();
        self.affine_to(mul, add, &mut out)?;
        Ok(out)
    }

    pub fn affine_to(&self, mul: f64, add: f64, dst: &mut Tensor) -> Result<()> {
        self.map_to(dst, |x| x * mul + add)
    }

    pub fn scale(&self, factor: f64) -> Result<Tensor> {
        self.affine(factor, 0.0)
    }

    // Elementwise binary

    pub fn binary(&self, op: BinaryOp, rhs: &Tensor) -> Result<Tensor> {
        let mut out = self.zeros_like();
        self.binary_to(op, rhs, &mut out)?;
        Ok(out)
    }

    pub fn binary_to(&self, op: BinaryOp, rhs: &Tensor, dst: &mut Tensor) -> Result<()> {
        self.zip_to(rhs, dst, |a, b| op.apply(a, b))
    }

    /// `dst = f(self, rhs)` elementwise over three same-shaped tensors.
    pub(crate) fn zip_to(
        &self,
        rhs: &Tensor,
        dst: &mut Tensor,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<()> {
        self.shape().expect_eq(rhs.shape())?;
        expect_dtype(self.dtype(), rhs.dtype())?;
        self.expect_like(dst)?;
        let lhs = self.detached_from(dst);
        let rhs = rhs.detached_from(dst);
        let reads = ReadPair::new(&lhs, &rhs)?;
        let mut d = dst.write_storage()?;
        with_same3!((reads.first(), reads.second(), &mut *d), (a, b, c) => {
            cpu::zip_map(a, lhs.layout(), b, rhs.layout(), c, dst.layout(), f)
        }, return Err(Error::DTypeMismatch { expected: lhs.dtype(), got: dst.dtype() }));
        Ok(())
    }

    binary_methods! {
        add, add_to => Add;
        sub, sub_to => Sub;
        mul, mul_to => Mul;
        div, div_to => Div;
        maximum, maximum_to => Max;
        minimum, minimum_to => Min;
    }

    // In-place updates

    /// `self = f(self, rhs)` elementwise.
    pub(crate) fn update_with(&mut self, rhs: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<()> {
        rhs.expect_like(self)?;
        let rhs = rhs.detached_from(self);
        let r = rhs.read_storage()?;
        let mut d = self.write_storage()?;
        with_same!((&mut *d, &*r), (a, b) => cpu::update(a, self.layout(), b, rhs.layout(), f),
            return Err(Error::DTypeMismatch { expected: self.dtype(), got: rhs.dtype() }));
        Ok(())
    }

    /// `self += rhs`.
    pub fn add_assign(&mut self, rhs: &Tensor) -> Result<()> {
        self.update_with(rhs, |a, b| a + b)
    }

    /// `self *= rhs`.
    pub fn mul_assign(&mut self, rhs: &Tensor) -> Result<()> {
        self.update_with(rhs, |a, b| a * b)
    }

    /// Add `row` to every row of `self` in place.
    pub fn add_row_assign(&mut self, row: &Tensor) -> Result<()> {
        row.shape().expect_rank(1)?;
        let n = self.shape().last_dim();
        if self.rank() == 0 || self.rank() > 2 || row.elem_count() != n {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(n),
                got: row.shape().clone(),
            });
        }
        expect_dtype(self.dtype(), row.dtype())?;
        let row = row.detached_from(self);
        let r = row.read_storage()?;
        let mut d = self.write_storage()?;
        with_same!((&mut *d, &*r), (a, b) => cpu::update_rows(a, self.layout(), b, row.layout()),
            return Err(Error::DTypeMismatch { expected: self.dtype(), got: row.dtype() }));
        Ok(())
    }

    // Comparison

    /// 1 where `self <op> scalar` holds, 0 elsewhere, in `self`'s dtype.
    pub fn cmp_scalar(&self, op: CmpOp, scalar: f64) -> Result<Tensor> {
        let mut out = self.zeros_like();
        self.cmp_scalar_to(op, scalar, &mut out)?;
        Ok(out)
    }

    /// Write the 0/1 comparison mask into `dst`, which may have any dtype.
    pub fn cmp_scalar_to(&self, op: CmpOp, scalar: f64, dst: &mut Tensor) -> Result<()> {
        self.shape().expect_eq(dst.shape())?;
        let src = self.detached_from(dst);
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        with_any_pair!((&*s, &mut *d), (a, b) => {
            cpu::map(a, src.layout(), b, dst.layout(), |x| {
                if op.apply(x, scalar) { 1.0 } else { 0.0 }
            })
        });
        Ok(())
    }

    // Reductions

    /// Reduce every element to a single f64.
    pub fn reduce_all(&self, op: ReduceOp) -> Result<f64> {
        let s = self.read_storage()?;
        let acc = with_slice!(&*s, v => {
            cpu::fold(v, self.layout(), op.init(), |a, x| op.combine(a, x))
        });
        Ok(op.finish(acc, self.elem_count()))
    }

    pub fn sum_all(&self) -> Result<f64> {
        self.reduce_all(ReduceOp::Sum)
    }

    pub fn mean_all(&self) -> Result<f64> {
        self.reduce_all(ReduceOp::Mean)
    }

    pub fn max_all(&self) -> Result<f64> {
        self.reduce_all(ReduceOp::Max)
    }

    /// Shape after reducing `dim`, optionally keeping it as size 1.
    pub fn reduced_shape(&self, dim: usize, keep_dim: bool) -> Result<Shape> {
        self.shape().dim(dim)?;
        let mut dims = self.dims().to_vec();
        if keep_dim {
            dims[dim] = 1;
        } else {
            dims.remove(dim);
        }
        Ok(Shape::new(dims))
    }

    /// Reduce along `dim` into `dst`, whose shape is the reduced shape with
    /// or without the kept unit dimension. `dst` may have any dtype.
    pub fn reduce_dim_to(&self, op: ReduceOp, dim: usize, dst: &mut Tensor) -> Result<()> {
        let dropped = self.reduced_shape(dim, false)?;
        let kept = self.reduced_shape(dim, true)?;
        if dst.shape() != &dropped && dst.shape() != &kept {
            return Err(Error::ShapeMismatch {
                expected: dropped,
                got: dst.shape().clone(),
            });
        }
        let src = self.detached_from(dst);
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        with_any_pair!((&*s, &mut *d), (a, b) => cpu::reduce_dim(
            a,
            src.layout(),
            dim,
            b,
            dst.layout(),
            op.init(),
            |acc, x| op.combine(acc, x),
            |acc, n| op.finish(acc, n),
        ));
        Ok(())
    }

    pub fn reduce_dim(&self, op: ReduceOp, dim: usize, keep_dim: bool) -> Result<Tensor> {
        let mut out = Tensor::zeros(self.reduced_shape(dim, keep_dim)?, self.dtype());
        self.reduce_dim_to(op, dim, &mut out)?;
        Ok(out)
    }

    pub fn sum_dim(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce_dim(ReduceOp::Sum, dim, keep_dim)
    }

    pub fn mean_dim(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce_dim(ReduceOp::Mean, dim, keep_dim)
    }

    pub fn max_dim(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce_dim(ReduceOp::Max, dim, keep_dim)
    }

    /// Index of the maximum along `dim` (first one on ties), as I64.
    pub fn argmax_dim(&self, dim: usize) -> Result<Tensor> {
        let out_shape = self.reduced_shape(dim, false)?;
        let s = self.read_storage()?;
        let idx = with_slice!(&*s, v => cpu::argmax_dim(v, self.layout(), dim));
        Tensor::from_vec(idx, out_shape)
    }

    /// Column sums: `[rows, n] -> [n]`. A rank-1 input is copied as is.
    pub fn sum_rows_to(&self, dst: &mut Tensor) -> Result<()> {
        match self.rank() {
            1 => self.copy_to(dst),
            2 => self.reduce_dim_to(ReduceOp::Sum, 0, dst),
            r => Err(Error::RankMismatch {
                expected: 2,
                got: r,
            }),
        }
    }

    /// `dst = self + row`, adding `row` (shape `[n]`) to every row of `self`
    /// (shape `[rows, n]` or `[n]`).
    pub fn add_row_to(&self, row: &Tensor, dst: &mut Tensor) -> Result<()> {
        row.shape().expect_rank(1)?;
        let n = self.shape().last_dim();
        if self.rank() == 0 || self.rank() > 2 || row.elem_count() != n {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(n),
                got: row.shape().clone(),
            });
        }
        expect_dtype(self.dtype(), row.dtype())?;
        self.expect_like(dst)?;
        let lhs = self.detached_from(dst);
        let row = row.detached_from(dst);
        let reads = ReadPair::new(&lhs, &row)?;
        let mut d = dst.write_storage()?;
        with_same3!((reads.first(), reads.second(), &mut *d), (a, b, c) => {
            cpu::add_row(a, lhs.layout(), b, row.layout(), c, dst.layout())
        }, return Err(Error::DTypeMismatch { expected: lhs.dtype(), got: dst.dtype() }));
        Ok(())
    }

    pub fn add_row(&self, row: &Tensor) -> Result<Tensor> {
        let mut out = self.zeros_like();
        self.add_row_to(row, &mut out)?;
        Ok(out)
    }

    // Matrix multiplication

    /// Shape of `op(self) · op(rhs)`. Rank-1 operands act as a single row;
    /// the result is rank 1 when the left operand is an untransposed vector.
    pub fn matmul_shape(&self, rhs: &Tensor, trans_a: bool, trans_b: bool) -> Result<Shape> {
        for t in [self, rhs] {
            if t.rank() == 0 || t.rank() > 2 {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: t.rank(),
                });
            }
        }
        let am = Mat::from_layout(self.layout(), trans_a);
        let bm = Mat::from_layout(rhs.layout(), trans_b);
        if am.cols != bm.rows {
            return Err(Error::MatmulShapeMismatch {
                m: am.rows,
                k1: am.cols,
                k2: bm.rows,
                n: bm.cols,
            });
        }
        if self.rank() == 1 && !trans_a {
            Ok(Shape::from(bm.cols))
        } else {
            Ok(Shape::from((am.rows, bm.cols)))
        }
    }

    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        let mut out = Tensor::zeros(self.matmul_shape(rhs, false, false)?, self.dtype());
        self.matmul_to(rhs, &mut out)?;
        Ok(out)
    }

    pub fn matmul_to(&self, rhs: &Tensor, dst: &mut Tensor) -> Result<()> {
        self.matmul_t_to(rhs, dst, false, false)
    }

    /// Matrix-vector product: `self` is `[m, k]`, `v` is `[k]`, `dst` is `[m]`.
    pub fn matvec_to(&self, v: &Tensor, dst: &mut Tensor) -> Result<()> {
        self.shape().expect_rank(2)?;
        v.shape().expect_rank(1)?;
        v.matmul_t_to(self, dst, false, true)
    }

    /// `dst = op(self) · op(rhs)` where `op` optionally transposes.
    ///
    /// Transposition only changes how the operands are walked; nothing is
    /// copied. `dst` must have the shape reported by `matmul_shape`.
    pub fn matmul_t_to(
        &self,
        rhs: &Tensor,
        dst: &mut Tensor,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<()> {
        let expected = self.matmul_shape(rhs, trans_a, trans_b)?;
        let am = Mat::from_layout(self.layout(), trans_a);
        let bm = Mat::from_layout(rhs.layout(), trans_b);
        let cm = Mat::from_layout(dst.layout(), false);
        if dst.rank() == 0 || dst.rank() > 2 || cm.rows != am.rows || cm.cols != bm.cols {
            return Err(Error::ShapeMismatch {
                expected,
                got: dst.shape().clone(),
            });
        }
        expect_dtype(self.dtype(), rhs.dtype())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        let lhs = self.detached_from(dst);
        let rhs = rhs.detached_from(dst);
        let am = Mat::from_layout(lhs.layout(), trans_a);
        let bm = Mat::from_layout(rhs.layout(), trans_b);
        let reads = ReadPair::new(&lhs, &rhs)?;
        let mut d = dst.write_storage()?;
        with_same3!((reads.first(), reads.second(), &mut *d),
            (a, b, c) => cpu::matmul(a, am, b, bm, c, cm),
            return Err(Error::DTypeMismatch { expected: lhs.dtype(), got: dst.dtype() }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: impl Into<Shape>) -> Tensor {
        Tensor::from_slice(data, shape).unwrap()
    }

    #[test]
    fn relu_allocating_and_destination() -> Result<()> {
        let x = t(&[-1.0, 0.0, 1.0, -2.0, 2.0], 5);
        assert_eq!(x.relu()?.to_vec::<f32>()?, vec![0.0, 0.0, 1.0, 0.0, 2.0]);
        let mut out = Tensor::zeros(5, DType::F32);
        x.relu_to(&mut out)?;
        assert_eq!(out.to_vec::<f32>()?, vec![0.0, 0.0, 1.0, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn binary_shape_mismatch_leaves_dst() -> Result<()> {
        let a = t(&[1.0, 2.0, 3.0], 3);
        let b = t(&[1.0, 2.0], 2);
        let mut dst = Tensor::full(3, 7.0, DType::F32);
        assert!(matches!(
            a.add_to(&b, &mut dst),
            Err(Error::ShapeMismatch { .. })
        ));
        assert_eq!(dst.to_vec::<f32>()?, vec![7.0; 3]);
        Ok(())
    }

    #[test]
    fn binary_dtype_mismatch() {
        let a = t(&[1.0], 1);
        let b = Tensor::ones(1, DType::F64);
        assert!(matches!(a.mul(&b), Err(Error::DTypeMismatch { .. })));
    }

    #[test]
    fn in_place_through_aliasing_destination() -> Result<()> {
        let mut x = t(&[1.0, 2.0, 3.0], 3);
        let y = x.view(3)?;
        y.mul_to(&y.clone(), &mut x)?;
        assert_eq!(x.to_vec::<f32>()?, vec![1.0, 4.0, 9.0]);
        Ok(())
    }

    #[test]
    fn square_of_self() -> Result<()> {
        let x = t(&[2.0, -3.0], 2);
        assert_eq!(x.mul(&x)?.to_vec::<f32>()?, vec![4.0, 9.0]);
        Ok(())
    }

    #[test]
    fn integer_arithmetic_saturates() -> Result<()> {
        let a = Tensor::from_slice(&[100i8, -100], 2)?;
        assert_eq!(a.add(&a)?.to_vec::<i8>()?, vec![127, -128]);
        Ok(())
    }

    #[test]
    fn gt_mask_into_other_dtype() -> Result<()> {
        let x = t(&[-1.0, 0.0, 2.0], 3);
        let mut mask = Tensor::zeros(3, DType::I8);
        x.cmp_scalar_to(CmpOp::Gt, 0.0, &mut mask)?;
        assert_eq!(mask.to_vec::<i8>()?, vec![0, 0, 1]);
        Ok(())
    }

    #[test]
    fn reductions() -> Result<()> {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        assert_eq!(x.sum_all()?, 21.0);
        assert_eq!(x.mean_all()?, 3.5);
        assert_eq!(x.max_all()?, 6.0);
        assert_eq!(x.sum_dim(0, false)?.to_vec::<f32>()?, vec![5.0, 7.0, 9.0]);
        assert_eq!(x.sum_dim(1, true)?.dims(), &[2, 1]);
        assert_eq!(x.max_dim(1, false)?.to_vec::<f32>()?, vec![3.0, 6.0]);
        assert_eq!(x.argmax_dim(1)?.to_vec::<i64>()?, vec![2, 2]);
        Ok(())
    }

    #[test]
    fn argmax_on_strided_view_takes_first_tie() -> Result<()> {
        let x = t(&[1.0, 7.0, 7.0, 0.0, 2.0, 9.0], (2, 3)).t()?;
        // [[1, 0], [7, 2], [7, 9]]
        assert_eq!(x.argmax_dim(0)?.to_vec::<i64>()?, vec![1, 2]);
        assert_eq!(x.argmax_dim(1)?.to_vec::<i64>()?, vec![0, 0, 1]);
        Ok(())
    }

    #[test]
    fn matmul_and_transposes() -> Result<()> {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let b = t(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (3, 2));
        assert_eq!(a.matmul(&b)?.to_vec::<f32>()?, vec![4.0, 5.0, 10.0, 11.0]);

        // aᵀ · a without materializing the transpose
        let mut ata = Tensor::zeros((3, 3), DType::F32);
        a.matmul_t_to(&a, &mut ata, true, false)?;
        assert_eq!(ata.get(&[0, 0])?, 17.0);
        assert_eq!(ata.get(&[2, 1])?, 2.0 * 3.0 + 5.0 * 6.0);

        let mut bad = Tensor::zeros((2, 3), DType::F32);
        assert!(matches!(
            a.matmul_to(&b, &mut bad),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            a.matmul(&a),
            Err(Error::MatmulShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn vector_outer_product() -> Result<()> {
        let x = t(&[1.0, 2.0], 2);
        let g = t(&[3.0, 4.0, 5.0], 3);
        let mut w = Tensor::zeros((2, 3), DType::F32);
        x.matmul_t_to(&g, &mut w, true, false)?;
        assert_eq!(w.to_vec::<f32>()?, vec![3.0, 4.0, 5.0, 6.0, 8.0, 10.0]);
        Ok(())
    }

    #[test]
    fn add_row_and_sum_rows() -> Result<()> {
        let x = t(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let b = t(&[10.0, 20.0], 2);
        let y = x.add_row(&b)?;
        assert_eq!(y.to_vec::<f32>()?, vec![11.0, 22.0, 13.0, 24.0]);
        let mut s = Tensor::zeros(2, DType::F32);
        y.sum_rows_to(&mut s)?;
        assert_eq!(s.to_vec::<f32>()?, vec![24.0, 46.0]);
        Ok(())
    }

    #[test]
    fn matvec() -> Result<()> {
        let m = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let v = t(&[1.0, 0.0, -1.0], 3);
        let mut y = Tensor::zeros(2, DType::F32);
        m.matvec_to(&v, &mut y)?;
        assert_eq!(y.to_vec::<f32>()?, vec![-2.0, -2.0]);
        Ok(())
    }

    #[test]
    fn in_place_updates() -> Result<()> {
        let mut x = t(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        x.add_row_assign(&t(&[10.0, 20.0], 2))?;
        assert_eq!(x.to_vec::<f32>()?, vec![11.0, 22.0, 13.0, 24.0]);
        x.mul_assign(&t(&[2.0, 0.0, 1.0, -1.0], (2, 2)))?;
        x.add_assign(&t(&[1.0; 4], (2, 2)))?;
        assert_eq!(x.to_vec::<f32>()?, vec![23.0, 1.0, 14.0, -23.0]);
        Ok(())
    }
}
