//! # tessel
//!
//! A small tensor engine for layered numerical models.
//!
//! This is the facade crate: it re-exports the tensor core and the layer
//! library, and adds the graph-compiled execution mode and backend
//! capability negotiation.
//!
//! ```rust
//! use tessel::prelude::*;
//!
//! let mut model = Model::new()
//!     .add(Dense::new(3, 2, LayerConfig::default().seed(0)))
//!     .add(Sigmoid::new(LayerConfig::default()));
//! model.init(&Shape::from((4, 3)))?;
//! let y = model.forward(&Tensor::ones((4, 3), DType::F32))?;
//! assert_eq!(y.dims(), &[4, 2]);
//! # Ok::<(), tessel::Error>(())
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `tessel-core` | Tensor, Shape, DType, Layout, destination kernels, parallel conversion |
//! | `tessel-nn` | Layer trait, Dense, activations, dropout, pooling, convolution, LSTM, reshape layers, Model, losses |
//! | `tessel` | ExpressionGraph, backend capabilities, prelude |

pub use tessel_core::{
    bail, sigmoid, BinaryOp, CmpOp, Conv2dParams, ConvertPool, DType, Error, Layout,
    ParallelConfig, Pool2dParams, ReduceOp, Result, Shape, Storage, Tensor, UnaryOp, WithDType,
    I48, NO_INDEX,
};

/// Layers, models and losses.
pub mod nn {
    pub use tessel_nn::*;
}

pub mod backend;
pub mod graph;

pub use backend::{Backend, Capabilities, CpuBackend, ExecutionMode};
pub use graph::{CompileStats, ExpressionGraph, GraphState, GraphTensor};

/// Everything needed to build and run a model.
pub mod prelude {
    pub use crate::backend::{Backend, Capabilities, CpuBackend, ExecutionMode};
    pub use crate::graph::{ExpressionGraph, GraphState, GraphTensor};
    pub use tessel_core::{
        Conv2dParams, ConvertPool, DType, Error, ParallelConfig, Pool2dParams, Result, Shape,
        Tensor,
    };
    pub use tessel_nn::{
        AvgPool2d, CategoricalCrossEntropy, Conv1d, Conv2d, CrossEntropy, Dense, Dropout,
        DropoutConfig, Flatten, GlobalAvgPool2d, Layer, LayerConfig, LayerKind, LayerState, Loss,
        Lstm, MaxPool2d, Model, Mse, ParamKind, Parameter, Relu, Reshape, Sigmoid, Softmax,
        Squeeze, Tanh, Transpose, Unsqueeze,
    };
}
