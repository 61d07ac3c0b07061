//! # tessel-core
//!
//! Typed n-dimensional tensors and the CPU kernels behind them.
//!
//! This crate provides:
//! - [`Tensor`]: typed buffer + layout, with views that share storage and
//!   `_to` operations that write into caller-supplied destinations
//! - [`Shape`] / [`Layout`]: shape, strides and offset
//! - [`DType`]: F32, F64, I8, I16, I32, I48, I64 with one saturating
//!   conversion rule
//! - op descriptors ([`UnaryOp`], [`BinaryOp`], [`CmpOp`], [`ReduceOp`]) and
//!   pooling/convolution geometry
//! - [`ConvertPool`]: bounded parallel conversion for large copies
// - error: the library-wide Error enum and Result alias
// - cpu: slice kernels shared by every op
// - ops / nn_ops: Tensor methods (elementwise, matmul, softmax, pooling, conv)

pub mod dtype;
pub mod error;
pub mod layout;
pub mod nn_ops;
pub mod op;
pub mod ops;
pub mod parallel;
pub mod shape;
pub mod storage;
pub mod tensor;

mod cpu;

pub use dtype::{DType, WithDType, I48};
pub use error::{Error, Result};
pub use layout::Layout;
pub use nn_ops::NO_INDEX;
pub use op::{sigmoid, BinaryOp, CmpOp, Conv2dParams, Pool2dParams, ReduceOp, UnaryOp};
pub use parallel::{ConvertPool, ParallelConfig};
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;
