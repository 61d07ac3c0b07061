// Storage — The typed flat buffer behind a tensor
//
// One variant per DType. Kernels are generic over `T: WithDType` and the
// dispatch macros below pick the instantiation at runtime:
//
//   with_slice!(storage, v => body)             one buffer, any dtype
//   with_same!((a, b), (x, y) => body, else)    two buffers of the same dtype
//   with_same3!(...)                            three buffers of the same dtype
//   with_any_pair!((src, dst), (x, y) => body)  two buffers, every combination
//
// The last one is only used by conversion kernels (copy with cast, compare
// into a mask), which legitimately cross dtypes.

use crate::dtype::{DType, WithDType, I48};

/// A typed, flat element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I48(Vec<I48>),
    I64(Vec<i64>),
}

macro_rules! with_slice {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            $crate::storage::Storage::F32($v) => $body,
            $crate::storage::Storage::F64($v) => $body,
            $crate::storage::Storage::I8($v) => $body,
            $crate::storage::Storage::I16($v) => $body,
            $crate::storage::Storage::I32($v) => $body,
            $crate::storage::Storage::I48($v) => $body,
            $crate::storage::Storage::I64($v) => $body,
        }
    };
}

macro_rules! with_same {
    (($a:expr, $b:expr), ($x:ident, $y:ident) => $body:expr, $mismatch:expr) => {
        match ($a, $b) {
            ($crate::storage::Storage::F32($x), $crate::storage::Storage::F32($y)) => $body,
            ($crate::storage::Storage::F64($x), $crate::storage::Storage::F64($y)) => $body,
            ($crate::storage::Storage::I8($x), $crate::storage::Storage::I8($y)) => $body,
            ($crate::storage::Storage::I16($x), $crate::storage::Storage::I16($y)) => $body,
            ($crate::storage::Storage::I32($x), $crate::storage::Storage::I32($y)) => $body,
            ($crate::storage::Storage::I48($x), $crate::storage::Storage::I48($y)) => $body,
            ($crate::storage::Storage::I64($x), $crate::storage::Storage::I64($y)) => $body,
            _ => $mismatch,
        }
    };
}

macro_rules! with_same3 {
    (($a:expr, $b:expr, $c:expr), ($x:ident, $y:ident, $z:ident) => $body:expr, $mismatch:expr) => {
        match ($a, $b, $c) {
            (
                $crate::storage::Storage::F32($x),
                $crate::storage::Storage::F32($y),
                $crate::storage::Storage::F32($z),
            ) => $body,
            (
                $crate::storage::Storage::F64($x),
                $crate::storage::Storage::F64($y),
                $crate::storage::Storage::F64($z),
            ) => $body,
            (
                $crate::storage::Storage::I8($x),
                $crate::storage::Storage::I8($y),
                $crate::storage::Storage::I8($z),
            ) => $body,
            (
                $crate::storage::Storage::I16($x),
                $crate::storage::Storage::I16($y),
                $crate::storage::Storage::I16($z),
            ) => $body,
            (
                $crate::storage::Storage::I32($x),
                $crate::storage::Storage::I32($y),
                $crate::storage::Storage::I32($z),
            ) => $body,
            (
                $crate::storage::Storage::I48($x),
                $crate::storage::Storage::I48($y),
                $crate::storage::Storage::I48($z),
            ) => $body,
            (
                $crate::storage::Storage::I64($x),
                $crate::storage::Storage::I64($y),
                $crate::storage::Storage::I64($z),
            ) => $body,
            _ => $mismatch,
        }
    };
}

macro_rules! with_any_pair {
    (($a:expr, $b:expr), ($x:ident, $y:ident) => $body:expr) => {
        $crate::storage::with_slice!($a, $x => $crate::storage::with_slice!($b, $y => $body))
    };
}

pub(crate) use {with_any_pair, with_same, with_same3, with_slice};

impl Storage {
    /// A zero-filled buffer of `len` elements.
    pub fn zeros(dtype: DType, len: usize) -> Storage {
        Self::filled(dtype, len, 0.0)
    }

    /// A buffer of `len` copies of `value`, saturated to `dtype`.
    pub fn filled(dtype: DType, len: usize, value: f64) -> Storage {
        fn fill<T: WithDType>(len: usize, value: f64) -> Storage {
            T::into_storage(vec![T::from_f64(value); len])
        }
        match dtype {
            DType::F32 => fill::<f32>(len, value),
            DType::F64 => fill::<f64>(len, value),
            DType::I8 => fill::<i8>(len, value),
            DType::I16 => fill::<i16>(len, value),
            DType::I32 => fill::<i32>(len, value),
            DType::I48 => fill::<I48>(len, value),
            DType::I64 => fill::<i64>(len, value),
        }
    }

    /// Build a buffer of `dtype` from f64 values, saturating each one.
    pub fn from_f64(dtype: DType, data: &[f64]) -> Storage {
        fn convert<T: WithDType>(data: &[f64]) -> Storage {
            T::into_storage(data.iter().map(|&v| T::from_f64(v)).collect())
        }
        match dtype {
            DType::F32 => convert::<f32>(data),
            DType::F64 => convert::<f64>(data),
            DType::I8 => convert::<i8>(data),
            DType::I16 => convert::<i16>(data),
            DType::I32 => convert::<i32>(data),
            DType::I48 => convert::<I48>(data),
            DType::I64 => convert::<i64>(data),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I8(_) => DType::I8,
            Storage::I16(_) => DType::I16,
            Storage::I32(_) => DType::I32,
            Storage::I48(_) => DType::I48,
            Storage::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        with_slice!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one element as f64. Panics on out-of-bounds like slice indexing;
    /// callers validate indices through `Layout::flat_index` first.
    pub(crate) fn get_f64(&self, idx: usize) -> f64 {
        with_slice!(self, v => v[idx].to_f64())
    }

    pub(crate) fn set_f64(&mut self, idx: usize, value: f64) {
        fn set<T: WithDType>(v: &mut [T], idx: usize, value: f64) {
            v[idx] = T::from_f64(value);
        }
        with_slice!(self, v => set(v, idx, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_f64_saturates_per_dtype() {
        let s = Storage::from_f64(DType::I8, &[-500.0, 1.7, 500.0]);
        assert_eq!(s, Storage::I8(vec![-128, 1, 127]));
        let s = Storage::from_f64(DType::I48, &[1e20]);
        assert_eq!(s.get_f64(0), I48::MAX as f64);
    }

    #[test]
    fn filled_and_set() {
        let mut s = Storage::filled(DType::I16, 3, 2.0);
        s.set_f64(1, 70000.0);
        assert_eq!(s, Storage::I16(vec![2, i16::MAX, 2]));
        assert_eq!(s.dtype(), DType::I16);
        assert_eq!(s.len(), 3);
    }
}
