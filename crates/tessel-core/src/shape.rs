use std::fmt;

// Shape — Dimension sizes of a tensor, outermost first
//
// Rank 0 is a scalar holding one element. Any zero-sized dimension makes
// the element count zero; such shapes are representable, but layers and
// graph inputs treat them (and scalars) as empty and refuse them.
//
// Strides derived here are always the contiguous row-major ones. Views with
// other strides carry them in their Layout.

/// Dimension sizes of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of the dims; 1 for a scalar.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Scalars and shapes with a zero-sized dimension.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0.contains(&0)
    }

    /// Row-major strides, e.g. `[12, 4, 1]` for `[2, 3, 4]`.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut acc = 1;
        let mut strides: Vec<usize> = self
            .0
            .iter()
            .rev()
            .map(|&d| {
                let s = acc;
                acc *= d;
                s
            })
            .collect();
        strides.reverse();
        strides
    }

    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        match self.0.get(d) {
            Some(&n) => Ok(n),
            None => Err(crate::Error::DimOutOfRange {
                dim: d,
                rank: self.rank(),
            }),
        }
    }

    /// Innermost dimension; a scalar counts as `1`.
    pub fn last_dim(&self) -> usize {
        self.0.last().map_or(1, |&d| d)
    }

    /// Copy of `self` whose innermost dimension is `size`. A scalar becomes
    /// `[size]`.
    pub fn with_last_dim(&self, size: usize) -> Shape {
        let mut dims = self.0.clone();
        match dims.last_mut() {
            Some(last) => *last = size,
            None => dims.push(size),
        }
        Shape(dims)
    }

    pub fn expect_rank(&self, expected: usize) -> crate::Result<()> {
        match self.rank() {
            r if r == expected => Ok(()),
            got => Err(crate::Error::RankMismatch { expected, got }),
        }
    }

    /// `ShapeMismatch` naming `self` as the expected shape.
    pub fn expect_eq(&self, other: &Shape) -> crate::Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(crate::Error::ShapeMismatch {
                expected: self.clone(),
                got: other.clone(),
            })
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut sep = "";
        for d in &self.0 {
            write!(f, "{sep}{d}")?;
            sep = ", ";
        }
        f.write_str("]")
    }
}

macro_rules! shape_from_tuple {
    ($($d:ident),*) => {
        impl From<($(shape_from_tuple!(@usize $d),)*)> for Shape {
            fn from(($($d,)*): ($(shape_from_tuple!(@usize $d),)*)) -> Self {
                Shape(vec![$($d),*])
            }
        }
    };
    (@usize $d:ident) => { usize };
}

shape_from_tuple!();
shape_from_tuple!(a, b);
shape_from_tuple!(a, b, c);
shape_from_tuple!(a, b, c, d);

impl From<usize> for Shape {
    fn from(n: usize) -> Self {
        Shape(vec![n])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
