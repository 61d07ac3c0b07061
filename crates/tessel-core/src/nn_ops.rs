// Neural-network kernels
//
// Softmax, activation gradients, pooling and convolution, all in the
// destination-parameterized style. These are what the layer types call in
// their forward/backward passes; none of them allocates.
//
// LAYOUT CONVENTIONS:
//
//   pooling      input [N, C, H, W]                    -> [N, C, OH, OW]
//   convolution  input [N, C, H, W], kernel [O, C, KH, KW] -> [N, O, OH, OW]
//                input [N, C, L],    kernel [O, C, K]      -> [N, O, OL]
//
// A rank-3 convolution is the rank-4 one with H = KH = 1, so the 1-D and 2-D
// layers share the same four kernels. Spatial kernels need contiguous
// tensors. Max-pooling indices are flat positions into the input.

use rand::Rng;

use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::op::{Conv2dParams, Pool2dParams};
use crate::ops::expect_dtype;
use crate::shape::Shape;
use crate::storage::{with_same, with_same3, with_slice};
use crate::tensor::{ReadPair, Tensor};

/// Marks a pooling window that covered only padding.
pub const NO_INDEX: usize = usize::MAX;

fn contiguous(t: &Tensor, op: &'static str) -> Result<()> {
    if !t.is_contiguous() {
        return Err(Error::NotContiguous { op });
    }
    Ok(())
}

fn dims4(t: &Tensor) -> Result<[usize; 4]> {
    match *t.dims() {
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(Error::RankMismatch {
            expected: 4,
            got: t.rank(),
        }),
    }
}

/// Rank-3 tensors get a unit height.
fn spatial4(t: &Tensor) -> Result<[usize; 4]> {
    match *t.dims() {
        [n, c, h, w] => Ok([n, c, h, w]),
        [n, c, l] => Ok([n, c, 1, l]),
        _ => Err(Error::RankMismatch {
            expected: 4,
            got: t.rank(),
        }),
    }
}

/// Fully resolved convolution geometry.
#[derive(Debug, Clone, Copy)]
struct ConvGeom {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    o: usize,
    kh: usize,
    kw: usize,
    oh: usize,
    ow: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
}

impl ConvGeom {
    fn new(input: &Tensor, kernel: &Tensor, params: &Conv2dParams) -> Result<ConvGeom> {
        let [n, c, h, w] = spatial4(input)?;
        if kernel.rank() != input.rank() {
            return Err(Error::RankMismatch {
                expected: input.rank(),
                got: kernel.rank(),
            });
        }
        let [o, kc, kh, kw] = spatial4(kernel)?;
        if kc != c {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(c),
                got: Shape::from(kc),
            });
        }
        let (oh, ow) = params.output_hw(h, w, kh, kw)?;
        Ok(ConvGeom {
            n,
            c,
            h,
            w,
            o,
            kh,
            kw,
            oh,
            ow,
            sh: params.stride[0],
            sw: params.stride[1],
            ph: params.padding[0],
            pw: params.padding[1],
        })
    }

    /// Output shape in the input's rank.
    fn output_shape(&self, rank: usize) -> Shape {
        if rank == 3 {
            Shape::from((self.n, self.o, self.ow))
        } else {
            Shape::from((self.n, self.o, self.oh, self.ow))
        }
    }

    /// Input coordinate for output position `y` and kernel offset `k`.
    #[inline]
    fn src(y: usize, k: usize, s: usize, p: usize, size: usize) -> Option<usize> {
        let i = (y * s + k).checked_sub(p)?;
        (i < size).then_some(i)
    }
}

fn conv_forward<T: WithDType>(x: &[T], k: &[T], out: &mut [T], g: &ConvGeom) {
    for n in 0..g.n {
        for o in 0..g.o {
            for y in 0..g.oh {
                for xo in 0..g.ow {
                    let mut acc = 0.0;
                    for c in 0..g.c {
                        for ky in 0..g.kh {
                            let Some(iy) = ConvGeom::src(y, ky, g.sh, g.ph, g.h) else {
                                continue;
                            };
                            for kx in 0..g.kw {
                                let Some(ix) = ConvGeom::src(xo, kx, g.sw, g.pw, g.w) else {
                                    continue;
                                };
                                let xi = ((n * g.c + c) * g.h + iy) * g.w + ix;
                                let ki = ((o * g.c + c) * g.kh + ky) * g.kw + kx;
                                acc += x[xi].to_f64() * k[ki].to_f64();
                            }
                        }
                    }
                    out[((n * g.o + o) * g.oh + y) * g.ow + xo] = T::from_f64(acc);
                }
            }
        }
    }
}

/// Full correlation of the output gradient with the flipped kernel.
fn conv_input_grad<T: WithDType>(grad: &[T], k: &[T], dx: &mut [T], g: &ConvGeom) {
    for n in 0..g.n {
        for c in 0..g.c {
            for iy in 0..g.h {
                for ix in 0..g.w {
                    let mut acc = 0.0;
                    for o in 0..g.o {
                        for ky in 0..g.kh {
                            let ty = iy + g.ph;
                            if ty < ky || (ty - ky) % g.sh != 0 {
                                continue;
                            }
                            let y = (ty - ky) / g.sh;
                            if y >= g.oh {
                                continue;
                            }
                            for kx in 0..g.kw {
                                let tx = ix + g.pw;
                                if tx < kx || (tx - kx) % g.sw != 0 {
                                    continue;
                                }
                                let xo = (tx - kx) / g.sw;
                                if xo >= g.ow {
                                    continue;
                                }
                                let gi = ((n * g.o + o) * g.oh + y) * g.ow + xo;
                                let ki = ((o * g.c + c) * g.kh + ky) * g.kw + kx;
                                acc += grad[gi].to_f64() * k[ki].to_f64();
                            }
                        }
                    }
                    dx[((n * g.c + c) * g.h + iy) * g.w + ix] = T::from_f64(acc);
                }
            }
        }
    }
}

/// Correlation of the input with the output gradient, summed over the batch.
fn conv_kernel_grad<T: WithDType>(x: &[T], grad: &[T], dk: &mut [T], g: &ConvGeom) {
    for o in 0..g.o {
        for c in 0..g.c {
            for ky in 0..g.kh {
                for kx in 0..g.kw {
                    let mut acc = 0.0;
                    for n in 0..g.n {
                        for y in 0..g.oh {
                            let Some(iy) = ConvGeom::src(y, ky, g.sh, g.ph, g.h) else {
                                continue;
                            };
                            for xo in 0..g.ow {
                                let Some(ix) = ConvGeom::src(xo, kx, g.sw, g.pw, g.w) else {
                                    continue;
                                };
                                let xi = ((n * g.c + c) * g.h + iy) * g.w + ix;
                                let gi = ((n * g.o + o) * g.oh + y) * g.ow + xo;
                                acc += x[xi].to_f64() * grad[gi].to_f64();
                            }
                        }
                    }
                    dk[((o * g.c + c) * g.kh + ky) * g.kw + kx] = T::from_f64(acc);
                }
            }
        }
    }
}

/// `out[n, c, ...] += bias[c]` over a contiguous `[N, C, spatial]` buffer.
fn add_channel_bias<T: WithDType>(
    out: &mut [T],
    bias: &[T],
    bias_offset: usize,
    n: usize,
    c: usize,
) {
    let spatial = if n * c == 0 { 0 } else { out.len() / (n * c) };
    for (i, v) in out.iter_mut().enumerate() {
        let ch = (i / spatial.max(1)) % c.max(1);
        *v = T::from_f64(v.to_f64() + bias[bias_offset + ch].to_f64());
    }
}

/// Per-channel sum over batch and positions of a contiguous `[N, C, ...]`.
fn channel_sum<T: WithDType, U: WithDType>(
    grad: &[T],
    db: &mut [U],
    db_offset: usize,
    n: usize,
    c: usize,
) {
    let spatial = if n * c == 0 { 0 } else { grad.len() / (n * c) };
    for ch in 0..c {
        let mut acc = 0.0;
        for b in 0..n {
            let base = (b * c + ch) * spatial;
            acc += grad[base..base + spatial].iter().map(|v| v.to_f64()).sum::<f64>();
        }
        db[db_offset + ch] = U::from_f64(acc);
    }
}

#[derive(Debug, Clone, Copy)]
struct PoolGeom {
    planes: usize,
    h: usize,
    w: usize,
    oh: usize,
    ow: usize,
    p: Pool2dParams,
}

impl PoolGeom {
    fn new(input: &Tensor, params: &Pool2dParams) -> Result<PoolGeom> {
        let [n, c, h, w] = dims4(input)?;
        let (oh, ow) = params.output_hw(h, w)?;
        Ok(PoolGeom {
            planes: n * c,
            h,
            w,
            oh,
            ow,
            p: *params,
        })
    }

    fn output_shape(&self, input: &Tensor) -> Shape {
        let d = input.dims();
        Shape::from((d[0], d[1], self.oh, self.ow))
    }

    /// Visit the in-bounds input positions of one window.
    #[inline]
    fn window(&self, plane: usize, y: usize, x: usize, mut f: impl FnMut(usize)) {
        for ky in 0..self.p.kernel[0] {
            let Some(iy) = ConvGeom::src(y, ky, self.p.stride[0], self.p.padding[0], self.h) else {
                continue;
            };
            for kx in 0..self.p.kernel[1] {
                let Some(ix) = ConvGeom::src(x, kx, self.p.stride[1], self.p.padding[1], self.w)
                else {
                    continue;
                };
                f((plane * self.h + iy) * self.w + ix);
            }
        }
    }

    /// Number of in-bounds input positions under one window.
    fn window_count(&self, plane: usize, y: usize, x: usize) -> usize {
        let mut n = 0;
        self.window(plane, y, x, |_| n += 1);
        n
    }
}

fn max_pool<T: WithDType>(x: &[T], out: &mut [T], indices: &mut [usize], g: &PoolGeom) {
    let mut o = 0;
    for plane in 0..g.planes {
        for y in 0..g.oh {
            for xo in 0..g.ow {
                let mut best = (f64::NEG_INFINITY, NO_INDEX);
                g.window(plane, y, xo, |i| {
                    let v = x[i].to_f64();
                    if best.1 == NO_INDEX || v > best.0 {
                        best = (v, i);
                    }
                });
                out[o] = T::from_f64(if best.1 == NO_INDEX { 0.0 } else { best.0 });
                indices[o] = best.1;
                o += 1;
            }
        }
    }
}

fn avg_pool<T: WithDType>(x: &[T], out: &mut [T], g: &PoolGeom) {
    let mut o = 0;
    for plane in 0..g.planes {
        for y in 0..g.oh {
            for xo in 0..g.ow {
                let (mut acc, mut count) = (0.0, 0usize);
                g.window(plane, y, xo, |i| {
                    acc += x[i].to_f64();
                    count += 1;
                });
                out[o] = T::from_f64(if count == 0 { 0.0 } else { acc / count as f64 });
                o += 1;
            }
        }
    }
}

fn avg_pool_backward<T: WithDType>(grad: &[T], dx: &mut [T], g: &PoolGeom) {
    dx.iter_mut().for_each(|v| *v = T::zero());
    let mut o = 0;
    for plane in 0..g.planes {
        for y in 0..g.oh {
            for xo in 0..g.ow {
                let count = g.window_count(plane, y, xo);
                if count == 0 {
                    o += 1;
                    continue;
                }
                let share = grad[o].to_f64() / count as f64;
                g.window(plane, y, xo, |i| dx[i] = T::from_f64(dx[i].to_f64() + share));
                o += 1;
            }
        }
    }
}

impl Tensor {
    // Softmax

    /// Softmax along `dim`, subtracting the maximum first.
    pub fn softmax_to(&self, dim: usize, dst: &mut Tensor) -> Result<()> {
        self.shape().dim(dim)?;
        self.expect_like(dst)?;
        let src = self.detached_from(dst);
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        let (sl, dl) = (src.layout(), dst.layout());
        let size = sl.dims()[dim];
        let inner: usize = sl.dims()[dim + 1..].iter().product();
        let outer: usize = sl.dims()[..dim].iter().product();
        with_same!((&*s, &mut *d), (a, b) => {
            for q in 0..outer * inner {
                let (o, k) = (q / inner, q % inner);
                let pos = |i: usize| (o * size + i) * inner + k;
                let mut max = f64::NEG_INFINITY;
                for i in 0..size {
                    max = max.max(a[sl.physical(pos(i))].to_f64());
                }
                let mut sum = 0.0;
                for i in 0..size {
                    sum += (a[sl.physical(pos(i))].to_f64() - max).exp();
                }
                for i in 0..size {
                    let e = (a[sl.physical(pos(i))].to_f64() - max).exp();
                    b[dl.physical(pos(i))] = WithDType::from_f64(e / sum);
                }
            }
        }, return Err(Error::DTypeMismatch { expected: src.dtype(), got: dst.dtype() }));
        Ok(())
    }

    pub fn softmax(&self, dim: usize) -> Result<Tensor> {
        let mut out = self.zeros_like();
        self.softmax_to(dim, &mut out)?;
        Ok(out)
    }

    /// Softmax backward from the cached output `self`:
    /// `dst = y ⊙ (g - Σ(y ⊙ g))` along `dim`, without forming the Jacobian.
    pub fn softmax_grad_to(&self, grad: &Tensor, dim: usize, dst: &mut Tensor) -> Result<()> {
        self.shape().dim(dim)?;
        self.shape().expect_eq(grad.shape())?;
        expect_dtype(self.dtype(), grad.dtype())?;
        self.expect_like(dst)?;
        let y = self.detached_from(dst);
        let g = grad.detached_from(dst);
        let reads = ReadPair::new(&y, &g)?;
        let mut d = dst.write_storage()?;
        let (yl, gl, dl) = (y.layout(), g.layout(), dst.layout());
        let size = yl.dims()[dim];
        let inner: usize = yl.dims()[dim + 1..].iter().product();
        let outer: usize = yl.dims()[..dim].iter().product();
        with_same3!((reads.first(), reads.second(), &mut *d), (ys, gs, out) => {
            for q in 0..outer * inner {
                let (o, k) = (q / inner, q % inner);
                let pos = |i: usize| (o * size + i) * inner + k;
                let mut dot = 0.0;
                for i in 0..size {
                    dot += ys[yl.physical(pos(i))].to_f64() * gs[gl.physical(pos(i))].to_f64();
                }
                for i in 0..size {
                    let yi = ys[yl.physical(pos(i))].to_f64();
                    let gi = gs[gl.physical(pos(i))].to_f64();
                    out[dl.physical(pos(i))] = WithDType::from_f64(yi * (gi - dot));
                }
            }
        }, return Err(Error::DTypeMismatch { expected: y.dtype(), got: dst.dtype() }));
        Ok(())
    }

    // Activation gradients from cached outputs

    /// `dst = grad ⊙ y ⊙ (1 - y)` where `self` is the sigmoid output `y`.
    pub fn sigmoid_grad_to(&self, grad: &Tensor, dst: &mut Tensor) -> Result<()> {
        self.zip_to(grad, dst, |y, g| g * y * (1.0 - y))
    }

    /// `dst = grad ⊙ (1 - y²)` where `self` is the tanh output `y`.
    pub fn tanh_grad_to(&self, grad: &Tensor, dst: &mut Tensor) -> Result<()> {
        self.zip_to(grad, dst, |y, g| g * (1.0 - y * y))
    }

    // Dropout

    /// Overwrite `self` with an inverted-dropout mask: each element is 0 with
    /// probability `rate` and `1 / (1 - rate)` otherwise.
    pub fn fill_dropout_mask<R: Rng + ?Sized>(&mut self, rate: f64, rng: &mut R) -> Result<()> {
        if !(0.0..1.0).contains(&rate) {
            crate::bail!("dropout rate {rate} outside [0, 1)");
        }
        let keep = 1.0 / (1.0 - rate);
        self.fill_with(|| if rng.gen::<f64>() < rate { 0.0 } else { keep })
    }

    // Pooling

    /// Output shape of 2-D pooling over `self` (`[N, C, H, W]`).
    pub fn pool2d_shape(&self, params: &Pool2dParams) -> Result<Shape> {
        Ok(PoolGeom::new(self, params)?.output_shape(self))
    }

    /// Max pooling. `indices` receives, per output element, the flat input
    /// position of the window maximum (`NO_INDEX` for all-padding windows).
    pub fn max_pool2d_to(
        &self,
        params: &Pool2dParams,
        dst: &mut Tensor,
        indices: &mut [usize],
    ) -> Result<()> {
        let g = PoolGeom::new(self, params)?;
        g.output_shape(self).expect_eq(dst.shape())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        if indices.len() != dst.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: dst.shape().clone(),
                expected: dst.elem_count(),
                got: indices.len(),
            });
        }
        contiguous(self, "max_pool2d")?;
        contiguous(dst, "max_pool2d")?;
        let src = self.detached_from(dst);
        let (so, doff) = (src.layout().offset(), dst.layout().offset());
        let (sn, dn) = (src.elem_count(), dst.elem_count());
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        with_same!((&*s, &mut *d),
            (a, b) => max_pool(&a[so..so + sn], &mut b[doff..doff + dn], indices, &g),
            return Err(Error::DTypeMismatch { expected: src.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// Route each output gradient (`self`) to its recorded input position.
    /// `dst` has the input's shape and is overwritten.
    pub fn max_pool2d_backward_to(&self, indices: &[usize], dst: &mut Tensor) -> Result<()> {
        expect_dtype(self.dtype(), dst.dtype())?;
        if indices.len() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got: indices.len(),
            });
        }
        let n = dst.elem_count();
        if let Some(&bad) = indices.iter().find(|&&i| i != NO_INDEX && i >= n) {
            return Err(Error::IndexOutOfRange {
                index: vec![bad],
                shape: dst.shape().clone(),
            });
        }
        contiguous(self, "max_pool2d_backward")?;
        contiguous(dst, "max_pool2d_backward")?;
        let grad = self.detached_from(dst);
        let (go, gn, doff) = (grad.layout().offset(), grad.elem_count(), dst.layout().offset());
        let s = grad.read_storage()?;
        let mut d = dst.write_storage()?;
        with_same!((&*s, &mut *d), (a, b) => {
            let out = &mut b[doff..doff + n];
            out.iter_mut().for_each(|v| *v = WithDType::zero());
            for (gv, &i) in a[go..go + gn].iter().zip(indices) {
                if i != NO_INDEX {
                    out[i] = WithDType::from_f64(out[i].to_f64() + gv.to_f64());
                }
            }
        }, return Err(Error::DTypeMismatch { expected: grad.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// Average pooling over the in-bounds cells of each window; padding
    /// does not count towards the divisor.
    pub fn avg_pool2d_to(&self, params: &Pool2dParams, dst: &mut Tensor) -> Result<()> {
        let g = PoolGeom::new(self, params)?;
        g.output_shape(self).expect_eq(dst.shape())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        contiguous(self, "avg_pool2d")?;
        contiguous(dst, "avg_pool2d")?;
        let src = self.detached_from(dst);
        let (so, doff) = (src.layout().offset(), dst.layout().offset());
        let (sn, dn) = (src.elem_count(), dst.elem_count());
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        with_same!((&*s, &mut *d), (a, b) => avg_pool(&a[so..so + sn], &mut b[doff..doff + dn], &g),
            return Err(Error::DTypeMismatch { expected: src.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// Spread each output gradient (`self`) evenly over the in-bounds cells
    /// of its window.
    /// `dst` has the forward input's shape and is overwritten.
    pub fn avg_pool2d_backward_to(
        &self,
        params: &Pool2dParams,
        dst: &mut Tensor,
    ) -> Result<()> {
        let g = PoolGeom::new(dst, params)?;
        g.output_shape(dst).expect_eq(self.shape())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        contiguous(self, "avg_pool2d_backward")?;
        contiguous(dst, "avg_pool2d_backward")?;
        let grad = self.detached_from(dst);
        let (go, gn) = (grad.layout().offset(), grad.elem_count());
        let (doff, dn) = (dst.layout().offset(), dst.elem_count());
        let s = grad.read_storage()?;
        let mut d = dst.write_storage()?;
        with_same!((&*s, &mut *d),
            (a, b) => avg_pool_backward(&a[go..go + gn], &mut b[doff..doff + dn], &g),
            return Err(Error::DTypeMismatch { expected: grad.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// Mean over H and W: `[N, C, H, W] -> [N, C]`.
    pub fn global_avg_pool2d_to(&self, dst: &mut Tensor) -> Result<()> {
        let [n, c, h, w] = dims4(self)?;
        Shape::from((n, c)).expect_eq(dst.shape())?;
        let view = Shape::from((n, c, h * w));
        if self.is_contiguous() {
            self.view(view)?.reduce_dim_to(crate::op::ReduceOp::Mean, 2, dst)
        } else {
            self.clone().view(view)?.reduce_dim_to(crate::op::ReduceOp::Mean, 2, dst)
        }
    }

    /// Backward of global average pooling: every input position of plane
    /// `(n, c)` receives `grad[n, c] / (H * W)`.
    pub fn global_avg_pool2d_backward_to(&self, dst: &mut Tensor) -> Result<()> {
        let [n, c, h, w] = dims4(dst)?;
        Shape::from((n, c)).expect_eq(self.shape())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        contiguous(dst, "global_avg_pool2d_backward")?;
        let grad = self.detached_from(dst);
        let area = (h * w) as f64;
        let (doff, dn) = (dst.layout().offset(), dst.elem_count());
        let gl = grad.layout();
        let s = grad.read_storage()?;
        let mut d = dst.write_storage()?;
        with_same!((&*s, &mut *d), (a, b) => {
            for (i, v) in b[doff..doff + dn].iter_mut().enumerate() {
                let plane = i / (h * w).max(1);
                *v = WithDType::from_f64(a[gl.physical(plane)].to_f64() / area);
            }
        }, return Err(Error::DTypeMismatch { expected: grad.dtype(), got: dst.dtype() }));
        Ok(())
    }

    // Convolution

    /// Output shape of convolving `self` with `kernel`.
    pub fn conv_shape(&self, kernel: &Tensor, params: &Conv2dParams) -> Result<Shape> {
        Ok(ConvGeom::new(self, kernel, params)?.output_shape(self.rank()))
    }

    /// Sliding-window weighted sum plus optional per-channel bias.
    ///
    /// Works on `[N, C, H, W]` with `[O, C, KH, KW]` kernels and on
    /// `[N, C, L]` with `[O, C, K]` kernels (use a unit height in `params`).
    pub fn conv2d_to(
        &self,
        kernel: &Tensor,
        bias: Option<&Tensor>,
        params: &Conv2dParams,
        dst: &mut Tensor,
    ) -> Result<()> {
        let g = ConvGeom::new(self, kernel, params)?;
        g.output_shape(self.rank()).expect_eq(dst.shape())?;
        expect_dtype(self.dtype(), kernel.dtype())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        if let Some(b) = bias {
            Shape::from(g.o).expect_eq(b.shape())?;
            expect_dtype(self.dtype(), b.dtype())?;
        }
        for t in [self, kernel, &*dst] {
            contiguous(t, "conv2d")?;
        }
        let x = self.detached_from(dst);
        let k = kernel.detached_from(dst);
        let (xo, xn) = (x.layout().offset(), x.elem_count());
        let (ko, kn) = (k.layout().offset(), k.elem_count());
        let (doff, dn) = (dst.layout().offset(), dst.elem_count());
        {
            let reads = ReadPair::new(&x, &k)?;
            let mut d = dst.write_storage()?;
            with_same3!((reads.first(), reads.second(), &mut *d), (a, b, c) => {
                conv_forward(&a[xo..xo + xn], &b[ko..ko + kn], &mut c[doff..doff + dn], &g)
            }, return Err(Error::DTypeMismatch { expected: x.dtype(), got: dst.dtype() }));
        }
        if let Some(bias) = bias {
            let bias = bias.detached_from(dst);
            let bl = bias.layout().clone();
            let s = bias.read_storage()?;
            let mut d = dst.write_storage()?;
            with_same!((&*s, &mut *d), (a, b) => {
                if bl.is_contiguous() {
                    add_channel_bias(&mut b[doff..doff + dn], a, bl.offset(), g.n, g.o)
                } else {
                    let strided: Vec<_> = bl.strided_indices().map(|i| a[i]).collect();
                    add_channel_bias(&mut b[doff..doff + dn], &strided, 0, g.n, g.o)
                }
            }, return Err(Error::DTypeMismatch { expected: bias.dtype(), got: dst.dtype() }));
        }
        Ok(())
    }

    /// Gradient w.r.t. the convolution input. `self` is the output gradient;
    /// `dst` has the forward input's shape.
    pub fn conv2d_input_grad_to(
        &self,
        kernel: &Tensor,
        params: &Conv2dParams,
        dst: &mut Tensor,
    ) -> Result<()> {
        let g = ConvGeom::new(dst, kernel, params)?;
        g.output_shape(dst.rank()).expect_eq(self.shape())?;
        expect_dtype(self.dtype(), kernel.dtype())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        for t in [self, kernel, &*dst] {
            contiguous(t, "conv2d_input_grad")?;
        }
        let grad = self.detached_from(dst);
        let k = kernel.detached_from(dst);
        let (go, gn) = (grad.layout().offset(), grad.elem_count());
        let (ko, kn) = (k.layout().offset(), k.elem_count());
        let (doff, dn) = (dst.layout().offset(), dst.elem_count());
        let reads = ReadPair::new(&grad, &k)?;
        let mut d = dst.write_storage()?;
        with_same3!((reads.first(), reads.second(), &mut *d), (a, b, c) => {
            conv_input_grad(&a[go..go + gn], &b[ko..ko + kn], &mut c[doff..doff + dn], &g)
        }, return Err(Error::DTypeMismatch { expected: grad.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// Gradient w.r.t. the kernel, summed over the batch. `self` is the
    /// forward input; `dst` has the kernel's shape.
    pub fn conv2d_kernel_grad_to(
        &self,
        grad: &Tensor,
        params: &Conv2dParams,
        dst: &mut Tensor,
    ) -> Result<()> {
        let g = ConvGeom::new(self, dst, params)?;
        g.output_shape(self.rank()).expect_eq(grad.shape())?;
        expect_dtype(self.dtype(), grad.dtype())?;
        expect_dtype(self.dtype(), dst.dtype())?;
        for t in [self, grad, &*dst] {
            contiguous(t, "conv2d_kernel_grad")?;
        }
        let x = self.detached_from(dst);
        let gr = grad.detached_from(dst);
        let (xo, xn) = (x.layout().offset(), x.elem_count());
        let (go, gn) = (gr.layout().offset(), gr.elem_count());
        let (doff, dn) = (dst.layout().offset(), dst.elem_count());
        let reads = ReadPair::new(&x, &gr)?;
        let mut d = dst.write_storage()?;
        with_same3!((reads.first(), reads.second(), &mut *d), (a, b, c) => {
            conv_kernel_grad(&a[xo..xo + xn], &b[go..go + gn], &mut c[doff..doff + dn], &g)
        }, return Err(Error::DTypeMismatch { expected: x.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// Gradient w.r.t. the bias: per-channel sum of the output gradient
    /// (`self`, `[N, O, ...]`) over batch and positions into `dst` (`[O]`).
    pub fn conv2d_bias_grad_to(&self, dst: &mut Tensor) -> Result<()> {
        if self.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: self.rank(),
            });
        }
        let (n, c) = (self.dims()[0], self.dims()[1]);
        Shape::from(c).expect_eq(dst.shape())?;
        contiguous(self, "conv2d_bias_grad")?;
        contiguous(dst, "conv2d_bias_grad")?;
        let grad = self.detached_from(dst);
        let (go, gn, doff) = (grad.layout().offset(), grad.elem_count(), dst.layout().offset());
        let s = grad.read_storage()?;
        let mut d = dst.write_storage()?;
        with_slice!(&*s, a => with_slice!(&mut *d, b => {
            channel_sum(&a[go..go + gn], b, doff, n, c)
        }));
        Ok(())
    }
}
