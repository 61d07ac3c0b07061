// Parallel conversion/copy
//
// Large dtype conversions and strided-to-contiguous copies can be split
// across a bounded rayon pool. The destination is cut into disjoint
// contiguous chunks; each worker walks the matching logical range of the
// (possibly strided) source and writes only its own chunk, so there is no
// shared mutable state and no merge step. The caller blocks until every
// chunk is written. Small inputs run inline on the calling thread.

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::dtype::{cast, DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::storage::{with_any_pair, with_same};
use crate::tensor::Tensor;

/// Default element count below which copies stay on the calling thread.
pub const DEFAULT_MIN_CHUNK: usize = 1 << 15;

/// Configuration for [`ConvertPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Upper bound on worker threads.
    pub max_threads: usize,
    /// Minimum elements per chunk.
    pub min_chunk: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ParallelConfig {
            max_threads: cpus.min(8),
            min_chunk: DEFAULT_MIN_CHUNK,
        }
    }
}

impl ParallelConfig {
    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn with_min_chunk(mut self, n: usize) -> Self {
        self.min_chunk = n;
        self
    }

    /// Replace out-of-domain values with defaults.
    fn validated(mut self) -> Self {
        if self.max_threads == 0 {
            tracing::warn!("parallel copy: max_threads = 0, using 1");
            self.max_threads = 1;
        }
        if self.min_chunk == 0 {
            tracing::warn!(
                default = DEFAULT_MIN_CHUNK,
                "parallel copy: min_chunk = 0, using default"
            );
            self.min_chunk = DEFAULT_MIN_CHUNK;
        }
        self
    }
}

/// A bounded worker pool for large conversions and copies.
pub struct ConvertPool {
    pool: ThreadPool,
    config: ParallelConfig,
}

impl std::fmt::Debug for ConvertPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertPool")
            .field("config", &self.config)
            .finish()
    }
}

impl ConvertPool {
    pub fn new(config: ParallelConfig) -> Result<Self> {
        let config = config.validated();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_threads)
            .thread_name(|i| format!("tessel-convert-{i}"))
            .build()
            .map_err(|e| Error::msg(format!("failed to build conversion pool: {e}")))?;
        Ok(ConvertPool { pool, config })
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Copy `src` into `dst` with dtype conversion, splitting the work when
    /// it is large enough. Same contract as [`Tensor::copy_to`].
    pub fn copy(&self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        src.shape().expect_eq(dst.shape())?;
        let n = dst.elem_count();
        let small = n < self.config.min_chunk.saturating_mul(2);
        if small || self.config.max_threads == 1 || !dst.is_contiguous() {
            return src.copy_to(dst);
        }
        let chunk = n.div_ceil(self.config.max_threads).max(self.config.min_chunk);
        tracing::trace!(
            elems = n,
            chunk,
            threads = self.config.max_threads,
            from = %src.dtype(),
            to = %dst.dtype(),
            "parallel copy"
        );
        let src = src.detached_from(dst);
        let doff = dst.layout().offset();
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        let sl = src.layout();
        if s.dtype() != d.dtype() {
            with_any_pair!((&*s, &mut *d), (a, b) => {
                par_copy(a, sl, &mut b[doff..doff + n], chunk, &self.pool, cast)
            });
            return Ok(());
        }
        with_same!((&*s, &mut *d), (a, b) => {
            par_copy(a, sl, &mut b[doff..doff + n], chunk, &self.pool, |v| v)
        }, return Err(Error::DTypeMismatch { expected: src.dtype(), got: dst.dtype() }));
        Ok(())
    }

    /// A contiguous copy of `src` converted to `dtype`.
    pub fn convert(&self, src: &Tensor, dtype: DType) -> Result<Tensor> {
        let mut out = Tensor::zeros(src.shape().clone(), dtype);
        self.copy(src, &mut out)?;
        Ok(out)
    }
}

fn par_copy<T: WithDType, U: WithDType>(
    src: &[T],
    sl: &Layout,
    dst: &mut [U],
    chunk: usize,
    pool: &ThreadPool,
    conv: impl Fn(T) -> U + Sync,
) {
    pool.install(|| {
        dst.par_chunks_mut(chunk).enumerate().for_each(|(ci, out)| {
            let start = ci * chunk;
            let range = sl.strided_range(start, start + out.len());
            for (d, si) in out.iter_mut().zip(range) {
                *d = conv(src[si]);
            }
        })
    });
}

impl Tensor {
    /// [`Tensor::copy_to`] on a conversion pool.
    pub fn copy_to_parallel(&self, dst: &mut Tensor, pool: &ConvertPool) -> Result<()> {
        pool.copy(self, dst)
    }

    /// [`Tensor::to_dtype`] on a conversion pool.
    pub fn to_dtype_parallel(&self, dtype: DType, pool: &ConvertPool) -> Result<Tensor> {
        pool.convert(self, dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_equals_serial_on_strided_source() -> Result<()> {
        let data: Vec<f64> = (0..40_000).map(|v| (v as f64) * 0.37 - 5000.0).collect();
        let src = Tensor::from_slice(&data, (200, 200))?.t()?;
        let pool = ConvertPool::new(
            ParallelConfig::default()
                .with_max_threads(4)
                .with_min_chunk(1000),
        )?;
        let mut par = Tensor::zeros((200, 200), DType::I16);
        src.copy_to_parallel(&mut par, &pool)?;
        let serial = src.to_dtype(DType::I16)?;
        assert_eq!(par.to_vec::<i16>()?, serial.to_vec::<i16>()?);
        Ok(())
    }

    #[test]
    fn parallel_integer_copy_is_exact() -> Result<()> {
        let data: Vec<i64> = (0..8_000).map(|v| (1i64 << 60) + 2 * v + 1).collect();
        let src = Tensor::from_slice(&data, 8_000)?;
        let pool = ConvertPool::new(
            ParallelConfig::default()
                .with_max_threads(4)
                .with_min_chunk(500),
        )?;
        assert_eq!(src.to_dtype_parallel(DType::I64, &pool)?.to_vec::<i64>()?, data);
        let narrowed = src.to_dtype_parallel(DType::I32, &pool)?;
        assert!(narrowed.to_vec::<i32>()?.iter().all(|&v| v == i32::MAX));
        Ok(())
    }

    #[test]
    fn small_copies_run_inline() -> Result<()> {
        let pool = ConvertPool::new(ParallelConfig::default())?;
        let src = Tensor::from_slice(&[1.5f32, -2.5], 2)?;
        let out = pool.convert(&src, DType::I32)?;
        assert_eq!(out.to_vec::<i32>()?, vec![1, -2]);
        Ok(())
    }

    #[test]
    fn zero_threads_corrected() -> Result<()> {
        let pool = ConvertPool::new(
            ParallelConfig::default()
                .with_max_threads(0)
                .with_min_chunk(0),
        )?;
        assert_eq!(pool.config().max_threads, 1);
        assert_eq!(pool.config().min_chunk, DEFAULT_MIN_CHUNK);
        Ok(())
    }
}
