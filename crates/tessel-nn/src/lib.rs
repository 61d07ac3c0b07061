//! # tessel-nn
//!
//! Layers, models and losses for tessel.
//!
//! Every operator implements the [`Layer`] trait:
//!
//! 1. **init** validates the input shape, creates parameters and sizes
//!    every buffer the layer will write
//! 2. **forward** / **backward** overwrite those buffers and return a borrow
//!    of the output / input gradient
//! 3. **Model** chains layers and is a layer itself
//!
//! Operators: [`Dense`], [`Relu`], [`Sigmoid`], [`Tanh`], [`Softmax`],
//! [`Dropout`], [`MaxPool2d`], [`AvgPool2d`], [`GlobalAvgPool2d`],
//! [`Conv1d`], [`Conv2d`], [`Lstm`], and the reshape layers [`Flatten`],
//! [`Reshape`], [`Squeeze`], [`Unsqueeze`], [`Transpose`].

pub mod activation;
pub mod conv;
pub mod dense;
pub mod dropout;
pub mod init;
pub mod layer;
pub mod loss;
pub mod model;
pub mod parameter;
pub mod pool;
pub mod recurrent;
pub mod reshape;

pub use activation::{Relu, Sigmoid, Softmax, Tanh};
pub use conv::{Conv1d, Conv2d};
pub use dense::Dense;
pub use dropout::{Dropout, DropoutConfig, DEFAULT_DROPOUT_RATE};
pub use layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState, ParamKind, Params};
pub use loss::{CategoricalCrossEntropy, CrossEntropy, Loss, Mse};
pub use model::Model;
pub use parameter::Parameter;
pub use pool::{AvgPool2d, GlobalAvgPool2d, MaxPool2d};
pub use recurrent::Lstm;
pub use reshape::{Flatten, Reshape, Squeeze, Transpose, Unsqueeze};
