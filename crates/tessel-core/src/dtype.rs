use std::fmt;

use num_traits::{Bounded, NumCast, Zero};

use crate::storage::Storage;

// DType — Supported element types
//
// Every tensor carries a DType that selects the typed buffer behind it:
//
//   F32  — 32-bit float, the default for layers and parameters
//   F64  — 64-bit float
//   I8   — signed byte, quantized activations and masks
//   I16  — 16-bit signed integer
//   I32  — 32-bit signed integer
//   I48  — 48-bit signed integer, kept in an i64 lane
//   I64  — 64-bit signed integer
//
// CONVERSION RULE:
//
// Conversions follow one saturating rule regardless of the target width:
// values outside the representable range clamp to the nearest bound, floats
// truncate toward zero, NaN becomes zero for integer targets. Integer to
// integer conversions stay in an i64 lane and never round; anything touching
// a float goes through f64. f64 -> f32 clamps finite values to ±f32::MAX instead of
// overflowing to infinity. Nothing ever wraps.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    F32,
    F64,
    I8,
    I16,
    I32,
    I48,
    I64,
}

impl DType {
    /// Every dtype, in declaration order.
    pub const ALL: [DType; 7] = [
        DType::F32,
        DType::F64,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I48,
        DType::I64,
    ];

    /// Size of one logical element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I8 => 1,
            DType::I16 => 2,
            DType::I32 => 4,
            DType::I48 => 6,
            DType::I64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_int(&self) -> bool {
        !self.is_float()
    }

    /// Convert an f64 to the nearest value representable in this dtype,
    /// returned as f64.
    pub fn saturate(&self, v: f64) -> f64 {
        match self {
            DType::F32 => f32::from_f64(v).to_f64(),
            DType::F64 => v,
            DType::I8 => i8::from_f64(v).to_f64(),
            DType::I16 => i16::from_f64(v).to_f64(),
            DType::I32 => i32::from_f64(v).to_f64(),
            DType::I48 => I48::from_f64(v).to_f64(),
            DType::I64 => i64::from_f64(v).to_f64(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I48 => "i48",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

/// A 48-bit signed integer stored in an `i64` lane.
///
/// The inner value is always within `[I48::MIN, I48::MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct I48(i64);

impl I48 {
    pub const MAX: i64 = (1 << 47) - 1;
    pub const MIN: i64 = -(1 << 47);

    /// Clamp an i64 into the 48-bit range.
    pub fn new(v: i64) -> Self {
        I48(v.clamp(Self::MIN, Self::MAX))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<I48> for i64 {
    fn from(v: I48) -> i64 {
        v.0
    }
}

// WithDType — Trait that connects Rust types to the DType enum
//
// Generic kernels are written once over `T: WithDType`; the storage enum
// dispatches to the right instantiation. Arithmetic happens in f64 and is
// written back through `from_f64`, which is where the saturating rule lives.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType: Copy + Send + Sync + PartialOrd + fmt::Debug + 'static {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64.
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64, saturating.
    fn from_f64(v: f64) -> Self;

    /// The value in an i64 lane; `None` for float types.
    fn to_i64(self) -> Option<i64> {
        None
    }

    /// Create a value of this type from an i64, saturating.
    fn from_i64(v: i64) -> Self {
        Self::from_f64(v as f64)
    }

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    /// Wrap a typed buffer in the storage enum.
    fn into_storage(data: Vec<Self>) -> Storage;

    /// Borrow the typed buffer if the storage holds this type.
    fn slice(storage: &Storage) -> Option<&[Self]>;

    /// Mutably borrow the typed buffer if the storage holds this type.
    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;
}

fn saturate_int<T: Bounded + NumCast + Zero>(v: f64) -> T {
    if v.is_nan() {
        return T::zero();
    }
    num_traits::cast::<f64, T>(v).unwrap_or_else(|| {
        if v > 0.0 {
            T::max_value()
        } else {
            T::min_value()
        }
    })
}

fn saturate_i64<T: Bounded + NumCast>(v: i64) -> T {
    num_traits::cast::<i64, T>(v).unwrap_or_else(|| {
        if v > 0 {
            T::max_value()
        } else {
            T::min_value()
        }
    })
}

/// Convert one element between element types under the saturating rule.
#[inline]
pub fn cast<T: WithDType, U: WithDType>(v: T) -> U {
    match v.to_i64() {
        Some(i) => U::from_i64(i),
        None => U::from_f64(v.to_f64()),
    }
}

macro_rules! with_dtype_impl {
    ($ty:ty, $variant:ident) => {
        fn into_storage(data: Vec<Self>) -> Storage {
            Storage::$variant(data)
        }

        fn slice(storage: &Storage) -> Option<&[Self]> {
            match storage {
                Storage::$variant(v) => Some(v.as_slice()),
                _ => None,
            }
        }

        fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
            match storage {
                Storage::$variant(v) => Some(v.as_mut_slice()),
                _ => None,
            }
        }
    };
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        if v.is_finite() {
            v.clamp(f32::MIN as f64, f32::MAX as f64) as f32
        } else {
            v as f32
        }
    }
    with_dtype_impl!(f32, F32);
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
    with_dtype_impl!(f64, F64);
}

macro_rules! int_with_dtype {
    ($ty:ty, $variant:ident) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$variant;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                saturate_int::<$ty>(v)
            }
            fn to_i64(self) -> Option<i64> {
                Some(self as i64)
            }
            fn from_i64(v: i64) -> Self {
                saturate_i64::<$ty>(v)
            }
            with_dtype_impl!($ty, $variant);
        }
    };
}

int_with_dtype!(i8, I8);
int_with_dtype!(i16, I16);
int_with_dtype!(i32, I32);
int_with_dtype!(i64, I64);

impl WithDType for I48 {
    const DTYPE: DType = DType::I48;
    fn to_f64(self) -> f64 {
        self.0 as f64
    }
    fn from_f64(v: f64) -> Self {
        I48::new(saturate_int::<i64>(v))
    }
    fn to_i64(self) -> Option<i64> {
        Some(self.0)
    }
    fn from_i64(v: i64) -> Self {
        I48::new(v)
    }
    with_dtype_impl!(I48, I48);
}
