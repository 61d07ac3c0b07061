// Slice kernels
//
// Every kernel here works on raw typed slices plus the Layout describing how
// to walk them. Arithmetic passes through f64 and is written back with
// `WithDType::from_f64`, so the saturating conversion rule applies to every
// result. Plain copies never touch f64 unless a float is involved. When
// both sides are contiguous the kernels zip plain sub-slices; otherwise they
// walk `StridedIter`, which never allocates.

use std::ops::Range;

use crate::dtype::{cast, WithDType};
use crate::layout::Layout;

#[inline]
fn contiguous_range(l: &Layout) -> Option<Range<usize>> {
    if l.is_contiguous() {
        Some(l.offset()..l.offset() + l.elem_count())
    } else {
        None
    }
}

/// `dst[i] = f(src[i])` in logical order.
pub(crate) fn map<T: WithDType, U: WithDType>(
    src: &[T],
    sl: &Layout,
    dst: &mut [U],
    dl: &Layout,
    f: impl Fn(f64) -> f64,
) {
    match (contiguous_range(sl), contiguous_range(dl)) {
        (Some(sr), Some(dr)) => {
            for (d, &s) in dst[dr].iter_mut().zip(&src[sr]) {
                *d = U::from_f64(f(s.to_f64()));
            }
        }
        _ => {
            for (di, si) in dl.strided_indices().zip(sl.strided_indices()) {
                dst[di] = U::from_f64(f(src[si].to_f64()));
            }
        }
    }
}

/// `dst[i] = src[i]` in logical order, same element type.
pub(crate) fn copy<T: WithDType>(src: &[T], sl: &Layout, dst: &mut [T], dl: &Layout) {
    match (contiguous_range(sl), contiguous_range(dl)) {
        (Some(sr), Some(dr)) => dst[dr].copy_from_slice(&src[sr]),
        _ => {
            for (di, si) in dl.strided_indices().zip(sl.strided_indices()) {
                dst[di] = src[si];
            }
        }
    }
}

/// `dst[i] = src[i]` in logical order, converted with [`cast`].
pub(crate) fn convert<T: WithDType, U: WithDType>(
    src: &[T],
    sl: &Layout,
    dst: &mut [U],
    dl: &Layout,
) {
    match (contiguous_range(sl), contiguous_range(dl)) {
        (Some(sr), Some(dr)) => {
            for (d, &s) in dst[dr].iter_mut().zip(&src[sr]) {
                *d = cast(s);
            }
        }
        _ => {
            for (di, si) in dl.strided_indices().zip(sl.strided_indices()) {
                dst[di] = cast(src[si]);
            }
        }
    }
}

/// `dst[i] = f(a[i], b[i])` in logical order.
pub(crate) fn zip_map<T: WithDType>(
    a: &[T],
    al: &Layout,
    b: &[T],
    bl: &Layout,
    dst: &mut [T],
    dl: &Layout,
    f: impl Fn(f64, f64) -> f64,
) {
    match (contiguous_range(al), contiguous_range(bl), contiguous_range(dl)) {
        (Some(ar), Some(br), Some(dr)) => {
            for ((d, &x), &y) in dst[dr].iter_mut().zip(&a[ar]).zip(&b[br]) {
                *d = T::from_f64(f(x.to_f64(), y.to_f64()));
            }
        }
        _ => {
            for ((di, ai), bi) in dl
                .strided_indices()
                .zip(al.strided_indices())
                .zip(bl.strided_indices())
            {
                dst[di] = T::from_f64(f(a[ai].to_f64(), b[bi].to_f64()));
            }
        }
    }
}

/// Write one value into every element of the layout.
pub(crate) fn fill<T: WithDType>(dst: &mut [T], dl: &Layout, value: f64) {
    let v = T::from_f64(value);
    match contiguous_range(dl) {
        Some(r) => dst[r].iter_mut().for_each(|d| *d = v),
        None => {
            for i in dl.strided_indices() {
                dst[i] = v;
            }
        }
    }
}

/// Write successive values produced by `f` in logical order.
pub(crate) fn fill_with<T: WithDType>(dst: &mut [T], dl: &Layout, mut f: impl FnMut() -> f64) {
    for i in dl.strided_indices() {
        dst[i] = T::from_f64(f());
    }
}

/// Fold all elements in logical order.
pub(crate) fn fold<T: WithDType>(
    src: &[T],
    sl: &Layout,
    init: f64,
    f: impl Fn(f64, f64) -> f64,
) -> f64 {
    sl.strided_indices()
        .fold(init, |acc, i| f(acc, src[i].to_f64()))
}

/// Gather the logical elements into a fresh contiguous Vec.
pub(crate) fn gather<T: WithDType>(src: &[T], sl: &Layout) -> Vec<T> {
    match contiguous_range(sl) {
        Some(r) => src[r].to_vec(),
        None => sl.strided_indices().map(|i| src[i]).collect(),
    }
}

/// Position of the largest value along `dim` for every `[outer, inner]`
/// cell, first one on ties.
pub(crate) fn argmax_dim<T: WithDType>(src: &[T], sl: &Layout, dim: usize) -> Vec<i64> {
    let dims = sl.dims();
    let size = dims[dim];
    let inner: usize = dims[dim + 1..].iter().product();
    let outer: usize = dims[..dim].iter().product();
    (0..outer * inner)
        .map(|q| {
            let (o, k) = (q / inner, q % inner);
            let mut best = (f64::NEG_INFINITY, 0);
            for i in 0..size {
                let v = src[sl.physical((o * size + i) * inner + k)].to_f64();
                if v > best.0 {
                    best = (v, i as i64);
                }
            }
            best.1
        })
        .collect()
}

/// Reduce over one dimension. The source is viewed as `[outer, size, inner]`
/// and the destination as `[outer, inner]` in logical order; `g` turns the
/// fold result and `size` into the written value.
#[allow(clippy::too_many_arguments)]
pub(crate) fn reduce_dim<T: WithDType, U: WithDType>(
    src: &[T],
    sl: &Layout,
    dim: usize,
    dst: &mut [U],
    dl: &Layout,
    init: f64,
    f: impl Fn(f64, f64) -> f64,
    g: impl Fn(f64, usize) -> f64,
) {
    let dims = sl.dims();
    let size = dims[dim];
    let inner: usize = dims[dim + 1..].iter().product();
    let outer: usize = dims[..dim].iter().product();
    for q in 0..outer * inner {
        let (o, k) = (q / inner, q % inner);
        let mut acc = init;
        for i in 0..size {
            let p = (o * size + i) * inner + k;
            acc = f(acc, src[sl.physical(p)].to_f64());
        }
        dst[dl.physical(q)] = U::from_f64(g(acc, size));
    }
}

/// `dst[r, c] = a[r, c] + row[c]`, with `a` and `dst` viewed as rows of
/// `row.len()` logical elements.
pub(crate) fn add_row<T: WithDType>(
    a: &[T],
    al: &Layout,
    row: &[T],
    rl: &Layout,
    dst: &mut [T],
    dl: &Layout,
) {
    let n = rl.elem_count();
    if n == 0 {
        return;
    }
    for (pos, (di, ai)) in dl.strided_indices().zip(al.strided_indices()).enumerate() {
        let b = row[rl.physical(pos % n)].to_f64();
        dst[di] = T::from_f64(a[ai].to_f64() + b);
    }
}

/// `dst[i] = f(dst[i], src[i])` in logical order.
pub(crate) fn update<T: WithDType>(
    dst: &mut [T],
    dl: &Layout,
    src: &[T],
    sl: &Layout,
    f: impl Fn(f64, f64) -> f64,
) {
    for (di, si) in dl.strided_indices().zip(sl.strided_indices()) {
        dst[di] = T::from_f64(f(dst[di].to_f64(), src[si].to_f64()));
    }
}

/// `dst[r, :] += row` for every row.
pub(crate) fn update_rows<T: WithDType>(dst: &mut [T], dl: &Layout, row: &[T], rl: &Layout) {
    let n = rl.elem_count();
    if n == 0 {
        return;
    }
    for (pos, di) in dl.strided_indices().enumerate() {
        let b = row[rl.physical(pos % n)].to_f64();
        dst[di] = T::from_f64(dst[di].to_f64() + b);
    }
}

/// A strided 2-D matrix inside a flat buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub rs: usize,
    pub cs: usize,
    pub offset: usize,
}

impl Mat {
    /// Rank-1 layouts are treated as a single row.
    pub fn from_layout(l: &Layout, transpose: bool) -> Mat {
        let m = match (l.dims(), l.strides()) {
            ([n], [s]) => Mat {
                rows: 1,
                cols: *n,
                rs: 0,
                cs: *s,
                offset: l.offset(),
            },
            ([r, c], [rs, cs]) => Mat {
                rows: *r,
                cols: *c,
                rs: *rs,
                cs: *cs,
                offset: l.offset(),
            },
            _ => Mat {
                rows: 1,
                cols: l.elem_count(),
                rs: 0,
                cs: 1,
                offset: l.offset(),
            },
        };
        if transpose {
            Mat {
                rows: m.cols,
                cols: m.rows,
                rs: m.cs,
                cs: m.rs,
                offset: m.offset,
            }
        } else {
            m
        }
    }

    #[inline]
    pub fn at(&self, r: usize, c: usize) -> usize {
        self.offset + r * self.rs + c * self.cs
    }
}

/// `c = a · b` (overwriting `c`). Shapes are validated by the caller.
pub(crate) fn matmul<T: WithDType>(a: &[T], am: Mat, b: &[T], bm: Mat, c: &mut [T], cm: Mat) {
    for i in 0..am.rows {
        for j in 0..bm.cols {
            let mut acc = 0.0;
            for k in 0..am.cols {
                acc += a[am.at(i, k)].to_f64() * b[bm.at(k, j)].to_f64();
            }
            c[cm.at(i, j)] = T::from_f64(acc);
        }
    }
}
