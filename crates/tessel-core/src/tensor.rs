use std::borrow::Cow;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;

use crate::cpu;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;
use crate::storage::{with_any_pair, with_same, with_slice, Storage};

// Tensor — The fundamental data structure
//
// A Tensor is a typed n-dimensional array: a dtype, a Layout (shape, strides,
// offset) and a flat Storage buffer.
//
// MEMORY MODEL:
//
//   The buffer lives behind Arc<RwLock<Storage>>. A freshly built tensor is
//   the only holder of its buffer. Views (view, narrow, transpose, reshape of
//   a contiguous tensor) hold another Arc to the same buffer with a different
//   Layout, so a write through one handle is visible through the others.
//   The buffer is released when the last holder is dropped, which also covers
//   fan-out to several consumers.
//
//   `Clone` is a deep copy into a fresh contiguous buffer. Use `view` or
//   `narrow` when sharing is what you want.
//
// DESTINATION-PARAMETERIZED OPS:
//
//   Every computing op has an allocating form (`relu`) and a `_to` form
//   (`relu_to(&mut dst)`) that writes into a caller-supplied tensor of the
//   right shape and dtype. The `_to` forms validate everything before taking
//   the write lock, so a failing call leaves `dst` untouched. When `dst`
//   shares its buffer with a source, the source is snapshotted first.

/// An n-dimensional array of numbers.
///
/// # Example
/// ```
/// use tessel_core::{DType, Tensor};
///
/// let a = Tensor::from_slice(&[1.0f32, -2.0, 3.0, -4.0], (2, 2))?;
/// let mut out = Tensor::zeros((2, 2), DType::F32);
/// a.relu_to(&mut out)?;
/// assert_eq!(out.to_vec::<f32>()?, vec![1.0, 0.0, 3.0, 0.0]);
/// # Ok::<(), tessel_core::Error>(())
/// ```
pub struct Tensor {
    storage: Arc<RwLock<Storage>>,
    layout: Layout,
    dtype: DType,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, contiguous={})",
            self.layout.shape(),
            self.dtype,
            self.layout.is_contiguous(),
        )
    }
}

impl Clone for Tensor {
    /// Deep copy into a fresh contiguous buffer.
    fn clone(&self) -> Self {
        let guard = self
            .storage
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let storage = with_slice!(&*guard, v => gather_storage(v, &self.layout));
        Tensor::from_parts(storage, Layout::contiguous(self.layout.shape().clone()))
    }
}

fn gather_storage<T: WithDType>(v: &[T], layout: &Layout) -> Storage {
    T::into_storage(cpu::gather(v, layout))
}

/// Read locks on two tensors, taken once when they share a buffer.
pub(crate) struct ReadPair<'a> {
    first: RwLockReadGuard<'a, Storage>,
    second: Option<RwLockReadGuard<'a, Storage>>,
}

impl<'a> ReadPair<'a> {
    pub(crate) fn new(a: &'a Tensor, b: &'a Tensor) -> Result<Self> {
        let first = a.read_storage()?;
        let second = if a.shares_storage(b) {
            None
        } else {
            Some(b.read_storage()?)
        };
        Ok(ReadPair { first, second })
    }

    pub(crate) fn first(&self) -> &Storage {
        &self.first
    }

    pub(crate) fn second(&self) -> &Storage {
        self.second.as_deref().unwrap_or(&*self.first)
    }
}

impl Tensor {
    // Internal constructors

    pub(crate) fn from_parts(storage: Storage, layout: Layout) -> Tensor {
        let dtype = storage.dtype();
        Tensor {
            storage: Arc::new(RwLock::new(storage)),
            layout,
            dtype,
        }
    }

    /// Another handle on the same buffer with a different layout.
    fn share_with_layout(&self, layout: Layout) -> Tensor {
        Tensor {
            storage: Arc::clone(&self.storage),
            layout,
            dtype: self.dtype,
        }
    }

    pub(crate) fn read_storage(&self) -> Result<RwLockReadGuard<'_, Storage>> {
        self.storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    pub(crate) fn write_storage(&self) -> Result<RwLockWriteGuard<'_, Storage>> {
        self.storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    /// `self`, or a private deep copy if `dst` writes into the same buffer.
    pub(crate) fn detached_from(&self, dst: &Tensor) -> Cow<'_, Tensor> {
        if self.shares_storage(dst) {
            Cow::Owned(self.clone())
        } else {
            Cow::Borrowed(self)
        }
    }

    // Creation methods

    /// Wrap an existing storage buffer as a contiguous tensor.
    pub fn from_storage(storage: Storage, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if storage.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: storage.len(),
                shape,
            });
        }
        Ok(Self::from_parts(storage, Layout::contiguous(shape)))
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Tensor {
        Self::full(shape, 0.0, dtype)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType) -> Tensor {
        Self::full(shape, 1.0, dtype)
    }

    /// Create a tensor filled with a constant (saturated to `dtype`).
    pub fn full(shape: impl Into<Shape>, value: f64, dtype: DType) -> Tensor {
        let shape = shape.into();
        let storage = Storage::filled(dtype, shape.elem_count(), value);
        Self::from_parts(storage, Layout::contiguous(shape))
    }

    /// A zero-element placeholder of shape [0].
    pub fn empty(dtype: DType) -> Tensor {
        Self::zeros(0, dtype)
    }

    /// A rank-0 tensor holding one value.
    pub fn scalar(value: f64, dtype: DType) -> Tensor {
        Self::full((), value, dtype)
    }

    /// Zeros with the same shape and dtype as `self`.
    pub fn zeros_like(&self) -> Tensor {
        Self::zeros(self.shape().clone(), self.dtype)
    }

    /// Build a tensor by copying a typed slice.
    pub fn from_slice<T: WithDType>(data: &[T], shape: impl Into<Shape>) -> Result<Tensor> {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Build a tensor that takes ownership of a typed Vec.
    pub fn from_vec<T: WithDType>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Tensor> {
        Self::from_storage(T::into_storage(data), shape)
    }

    /// Build a tensor of any dtype from f64 values, saturating each one.
    pub fn from_f64_slice(data: &[f64], shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        Self::from_storage(Storage::from_f64(dtype, data), shape)
    }

    /// Uniform random values in `[lo, hi)` drawn from the caller's RNG.
    pub fn rand_uniform<R: Rng + ?Sized>(
        shape: impl Into<Shape>,
        dtype: DType,
        lo: f64,
        hi: f64,
        rng: &mut R,
    ) -> Tensor {
        let shape = shape.into();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| lo + (hi - lo) * rng.gen::<f64>())
            .collect();
        Self::from_parts(Storage::from_f64(dtype, &data), Layout::contiguous(shape))
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// True when both handles point at the same buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Number of handles (this one included) sharing the buffer.
    pub fn storage_holders(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    // Views

    /// A new shape over the same buffer.
    ///
    /// Fails if the element count differs or if `self` is a strided view.
    pub fn view(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        if !self.is_contiguous() {
            return Err(Error::NotContiguous { op: "view" });
        }
        Ok(self.share_with_layout(Layout::contiguous_at(shape, self.layout.offset())))
    }

    /// A view when the buffer allows it, a copy otherwise.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        if self.is_contiguous() {
            self.view(shape)
        } else {
            self.clone().view(shape)
        }
    }

    /// A view of `len` entries along `dim`, starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor> {
        Ok(self.share_with_layout(self.layout.narrow(dim, start, len)?))
    }

    /// A view with two dimensions swapped.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        Ok(self.share_with_layout(self.layout.transpose(dim0, dim1)?))
    }

    /// Matrix transpose of a 2-D tensor.
    pub fn t(&self) -> Result<Tensor> {
        self.shape().expect_rank(2)?;
        self.transpose(0, 1)
    }

    /// A contiguous tensor with the same values: a shared view if `self`
    /// already is contiguous, a copy otherwise.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            self.share_with_layout(self.layout.clone())
        } else {
            self.clone()
        }
    }

    // Copies

    /// Copy values into `dst`, converting to its dtype.
    ///
    /// Shapes must match exactly; `dst` may be a strided view.
    pub fn copy_to(&self, dst: &mut Tensor) -> Result<()> {
        self.shape().expect_eq(dst.shape())?;
        self.copy_into_layout(dst, &dst.layout)
    }

    /// Copy values into `dst` in row-major order, keeping `dst`'s shape.
    ///
    /// Only the element counts have to agree. This is the allocation-free
    /// way to move data between a tensor and a reshaped buffer.
    pub fn copy_flat_to(&self, dst: &mut Tensor) -> Result<()> {
        if dst.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: dst.elem_count(),
                dst_shape: dst.shape().clone(),
            });
        }
        self.copy_into_layout(dst, &dst.layout)
    }

    /// Copy values from `src` into `self`.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        src.copy_to(self)
    }

    /// Copy `self` into `dst` and give `dst` the shape `shape`.
    ///
    /// `dst` must be contiguous and hold exactly as many elements as `self`.
    /// Its buffer is reused; only its layout changes.
    pub fn reshape_to(&self, dst: &mut Tensor, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        if dst.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: dst.elem_count(),
                dst_shape: dst.shape().clone(),
            });
        }
        if !dst.is_contiguous() {
            return Err(Error::NotContiguous { op: "reshape_to" });
        }
        let target = Layout::contiguous_at(shape, dst.layout.offset());
        self.copy_into_layout(dst, &target)?;
        dst.layout = target;
        Ok(())
    }

    /// Write `self` in logical order into `dst`'s buffer as walked by `dl`.
    /// Equal dtypes copy elements unchanged.
    fn copy_into_layout(&self, dst: &Tensor, dl: &Layout) -> Result<()> {
        let src = self.detached_from(dst);
        let sl = src.layout();
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        if s.dtype() != d.dtype() {
            with_any_pair!((&*s, &mut *d), (a, b) => cpu::convert(a, sl, b, dl));
            return Ok(());
        }
        with_same!((&*s, &mut *d), (a, b) => cpu::copy(a, sl, b, dl),
            return Err(Error::DTypeMismatch { expected: src.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// A contiguous copy converted to `dtype`.
    pub fn to_dtype(&self, dtype: DType) -> Result<Tensor> {
        let mut out = Tensor::zeros(self.shape().clone(), dtype);
        self.copy_to(&mut out)?;
        Ok(out)
    }

    /// Set every element to `value`.
    pub fn fill(&mut self, value: f64) -> Result<()> {
        let mut d = self.write_storage()?;
        with_slice!(&mut *d, v => cpu::fill(v, &self.layout, value));
        Ok(())
    }

    /// Set elements in logical order from a generator.
    pub fn fill_with(&mut self, f: impl FnMut() -> f64) -> Result<()> {
        let mut d = self.write_storage()?;
        with_slice!(&mut *d, v => cpu::fill_with(v, &self.layout, f));
        Ok(())
    }

    // Element access

    /// Read one element as f64.
    pub fn get(&self, index: &[usize]) -> Result<f64> {
        let flat = self.layout.flat_index(index)?;
        Ok(self.read_storage()?.get_f64(flat))
    }

    /// Write one element, saturating to the tensor's dtype.
    pub fn set(&mut self, index: &[usize], value: f64) -> Result<()> {
        let flat = self.layout.flat_index(index)?;
        self.write_storage()?.set_f64(flat, value);
        Ok(())
    }

    /// All elements in logical order as f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let s = self.read_storage()?;
        Ok(with_slice!(&*s, v => self
            .layout
            .strided_indices()
            .map(|i| v[i].to_f64())
            .collect()))
    }

    /// All elements in logical order as `T`, which must match the dtype.
    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        let s = self.read_storage()?;
        let v = T::slice(&s).ok_or(Error::DTypeMismatch {
            expected: T::DTYPE,
            got: self.dtype,
        })?;
        Ok(cpu::gather(v, &self.layout))
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: 1,
                got: self.elem_count(),
            });
        }
        let s = self.read_storage()?;
        Ok(s.get_f64(self.layout.physical(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::I48;

    #[test]
    fn clone_is_a_deep_copy() -> Result<()> {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0], 3)?;
        let mut b = a.clone();
        b.set(&[0], 9.0)?;
        assert_eq!(a.to_vec::<f32>()?, vec![1.0, 2.0, 3.0]);
        assert!(!a.shares_storage(&b));
        Ok(())
    }

    #[test]
    fn view_shares_the_buffer() -> Result<()> {
        let a = Tensor::from_slice(&[1.0f64, 2.0, 3.0, 4.0], (2, 2))?;
        let mut v = a.view(4)?;
        v.set(&[3], 40.0)?;
        assert_eq!(a.get(&[1, 1])?, 40.0);
        assert!(a.shares_storage(&v));
        assert_eq!(a.storage_holders(), 2);
        drop(v);
        assert_eq!(a.storage_holders(), 1);
        Ok(())
    }

    #[test]
    fn view_rejects_count_mismatch_and_strided() -> Result<()> {
        let a = Tensor::zeros((2, 3), DType::F32);
        assert!(matches!(
            a.view((4, 2)),
            Err(Error::ReshapeElementMismatch { .. })
        ));
        let t = a.t()?;
        assert!(matches!(t.view(6), Err(Error::NotContiguous { .. })));
        // reshape falls back to a copy
        let r = t.reshape(6)?;
        assert!(!r.shares_storage(&a));
        Ok(())
    }

    #[test]
    fn reshape_to_reuses_destination() -> Result<()> {
        let a = Tensor::from_slice(&[1i32, 2, 3, 4, 5, 6], (2, 3))?;
        let mut dst = Tensor::zeros(6, DType::I32);
        let before = dst.storage_holders();
        a.t()?.reshape_to(&mut dst, (3, 2))?;
        assert_eq!(dst.dims(), &[3, 2]);
        assert_eq!(dst.to_vec::<i32>()?, vec![1, 4, 2, 5, 3, 6]);
        assert_eq!(dst.storage_holders(), before);
        Ok(())
    }

    #[test]
    fn failed_reshape_leaves_destination_untouched() -> Result<()> {
        let a = Tensor::ones(5, DType::F32);
        let mut dst = Tensor::zeros(6, DType::F32);
        assert!(a.reshape_to(&mut dst, (2, 3)).is_err());
        assert_eq!(dst.dims(), &[6]);
        assert_eq!(dst.to_f64_vec()?, vec![0.0; 6]);
        Ok(())
    }

    #[test]
    fn copy_converts_and_clamps() -> Result<()> {
        let a = Tensor::from_slice(&[-1000.0f64, 0.5, 1000.0], 3)?;
        let b = a.to_dtype(DType::I8)?;
        assert_eq!(b.to_vec::<i8>()?, vec![-128, 0, 127]);
        let c = Tensor::from_slice(&[300i16, -5], 2)?.to_dtype(DType::I8)?;
        assert_eq!(c.to_vec::<i8>()?, vec![127, -5]);
        Ok(())
    }

    #[test]
    fn integer_copies_are_exact() -> Result<()> {
        let big = [(1i64 << 53) + 1, i64::MAX, i64::MIN + 1];
        let a = Tensor::from_slice(&big, 3)?;
        let mut b = Tensor::zeros(3, DType::I64);
        a.copy_to(&mut b)?;
        assert_eq!(b.to_vec::<i64>()?, big.to_vec());
        assert_eq!(a.to_dtype(DType::I64)?.to_vec::<i64>()?, a.clone().to_vec::<i64>()?);

        let mut flat = Tensor::zeros((3, 1), DType::I64);
        a.copy_flat_to(&mut flat)?;
        assert_eq!(flat.to_vec::<i64>()?, big.to_vec());

        let narrowed = a.to_dtype(DType::I48)?.to_vec::<I48>()?;
        assert_eq!(narrowed[0].get(), (1i64 << 53) + 1);
        assert_eq!(narrowed[1].get(), I48::MAX);
        assert_eq!(narrowed[2].get(), I48::MIN);
        Ok(())
    }

    #[test]
    fn copy_into_strided_view() -> Result<()> {
        let buf = Tensor::zeros((2, 4), DType::F32);
        let mut right = buf.narrow(1, 2, 2)?;
        Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], (2, 2))?.copy_to(&mut right)?;
        assert_eq!(
            buf.to_vec::<f32>()?,
            vec![0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 3.0, 4.0]
        );
        Ok(())
    }

    #[test]
    fn out_of_range_access() {
        let a = Tensor::zeros((2, 2), DType::F32);
        assert!(matches!(
            a.get(&[0, 2]),
            Err(Error::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn to_vec_checks_dtype() {
        let a = Tensor::zeros(2, DType::F64);
        assert!(matches!(
            a.to_vec::<f32>(),
            Err(Error::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn from_slice_checks_count() {
        assert!(matches!(
            Tensor::from_slice(&[1.0f32, 2.0, 3.0], (2, 2)),
            Err(Error::ElementCountMismatch { .. })
        ));
    }

    #[test]
    fn copy_flat_keeps_dst_shape() -> Result<()> {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?.t()?;
        let mut flat = Tensor::zeros(6, DType::I32);
        a.copy_flat_to(&mut flat)?;
        assert_eq!(flat.dims(), &[6]);
        assert_eq!(flat.to_vec::<i32>()?, vec![1, 4, 2, 5, 3, 6]);
        assert!(a.copy_flat_to(&mut Tensor::zeros(5, DType::I32)).is_err());
        Ok(())
    }
}
