use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — Where each logical element of a tensor sits in its buffer
//
// Shape, per-dimension strides and a starting offset. Transposing swaps
// strides and narrowing moves the offset; neither touches the data, so
// every view of a buffer differs from its parent only in its Layout.
//
// A layout is contiguous when its strides are the row-major strides of its
// shape. The offset may be non-zero: narrowing the first dimension of a
// contiguous tensor yields a contiguous block further into the buffer.
//
// Kernels read and write through `StridedIter`, which maps a logical
// (row-major) position to a physical buffer index without allocating.

/// Maps logical positions of a tensor to indices in its flat buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout at offset 0.
    pub fn contiguous(shape: Shape) -> Self {
        Self::contiguous_at(shape, 0)
    }

    /// Contiguous layout starting at `offset`.
    pub fn contiguous_at(shape: Shape, offset: usize) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major with no gaps (the offset is allowed to be non-zero).
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (&d, &s) in self.dims().iter().zip(&self.strides).rev() {
            if d > 1 && s != expected {
                return false;
            }
            expected *= d;
        }
        true
    }

    /// One past the largest buffer index this layout touches.
    pub fn required_len(&self) -> usize {
        if self.elem_count() == 0 {
            return self.offset;
        }
        self.offset
            + self
                .dims()
                .iter()
                .zip(&self.strides)
                .map(|(&d, &s)| (d - 1) * s)
                .sum::<usize>()
            + 1
    }

    /// Swap two dimensions by swapping their strides.
    ///
    /// `[2, 3, 4]` with strides `[12, 4, 1]` becomes `[4, 3, 2]` with
    /// strides `[1, 4, 12]` under `transpose(0, 2)`.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if let Some(&dim) = [dim0, dim1].iter().find(|&&d| d >= rank) {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::from(dims), strides, self.offset))
    }

    /// Keep `len` entries of `dim` starting at `start`. Only the offset and
    /// the dimension size change.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let dim_size = self.shape.dim(dim)?;
        if start.checked_add(len).map_or(true, |end| end > dim_size) {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::from(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// Buffer index of the element at `index`.
    pub fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() || index.iter().zip(self.dims()).any(|(&i, &d)| i >= d) {
            return Err(Error::IndexOutOfRange {
                index: index.to_vec(),
                shape: self.shape.clone(),
            });
        }
        Ok(self.offset
            + index
                .iter()
                .zip(&self.strides)
                .map(|(&i, &s)| i * s)
                .sum::<usize>())
    }

    /// Physical buffer index of the element at row-major position `pos`.
    #[inline]
    pub fn physical(&self, pos: usize) -> usize {
        let mut rem = pos;
        let mut idx = self.offset;
        for (&d, &s) in self.dims().iter().zip(&self.strides).rev() {
            if d == 0 {
                return self.offset;
            }
            idx += (rem % d) * s;
            rem /= d;
        }
        idx
    }

    /// Iterator over the physical indices of all elements, in logical order.
    pub fn strided_indices(&self) -> StridedIter<'_> {
        self.strided_range(0, self.elem_count())
    }

    /// Physical indices for the logical positions `start..end`.
    pub fn strided_range(&self, start: usize, end: usize) -> StridedIter<'_> {
        StridedIter {
            layout: self,
            contiguous: self.is_contiguous(),
            pos: start,
            end: end.min(self.elem_count()),
        }
    }
}

/// Buffer indices of a layout's elements in row-major order.
pub struct StridedIter<'a> {
    layout: &'a Layout,
    contiguous: bool,
    pos: usize,
    end: usize,
}

impl Iterator for StridedIter<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.pos >= self.end {
            return None;
        }
        let idx = if self.contiguous {
            self.layout.offset + self.pos
        } else {
            self.layout.physical(self.pos)
        };
        self.pos += 1;
        Some(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end.saturating_sub(self.pos);
        (n, Some(n))
    }
}

impl ExactSizeIterator for StridedIter<'_> {}
