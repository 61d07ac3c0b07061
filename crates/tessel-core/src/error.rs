use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within tessel.
///
/// Shape errors, lifecycle errors and graph-state errors share one enum so
/// that `?` works across tensors, layers and graphs alike. Configuration
/// mistakes are not represented here: they are corrected to defaults at
/// construction time and reported through `tracing::warn!`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two tensors (or a tensor and an operation) disagree on shape.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Wrong number of dimensions.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between operands or between source and destination.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("dim {dim} does not exist in a rank-{rank} tensor")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element index outside the tensor bounds.
    #[error("index {index:?} out of range for shape {shape}")]
    IndexOutOfRange { index: Vec<usize>, shape: Shape },

    /// `start + len` runs past the end of `dim`.
    #[error("cannot narrow dim {dim} (size {dim_size}) to {start}..{start}+{len}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// A host buffer does not fill the requested shape.
    #[error("shape {shape} holds {expected} elements but {got} were given")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("cannot multiply [{m}x{k1}] by [{k2}x{n}]: inner dims differ")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    #[error("cannot reshape {src} elements into {dst_shape} ({dst} elements)")]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A shape with no dimensions or a zero-sized dimension where data is required.
    #[error("empty shape {shape} is not allowed here")]
    EmptyShape { shape: Shape },

    /// The operation needs a row-major buffer but got a strided view.
    #[error("{op} requires a contiguous tensor")]
    NotContiguous { op: &'static str },

    /// A layer was used before `init`.
    #[error("layer `{layer}` is not initialized")]
    NotInitialized { layer: String },

    /// `backward` was called without a preceding `forward`.
    #[error("layer `{layer}`: backward called before forward")]
    BackwardBeforeForward { layer: String },

    /// An expression graph entry point was called in the wrong state.
    #[error("cannot {op} while the graph is {state}")]
    GraphState { op: &'static str, state: &'static str },

    /// A graph tensor handle was used with a graph that did not create it.
    #[error("graph tensor #{node} belongs to graph {owner}, not graph {graph}")]
    ForeignNode { node: usize, owner: u64, graph: u64 },

    /// Attempted to write data into a constant graph node.
    #[error("graph tensor #{node} is a constant and cannot be written")]
    ConstantNode { node: usize },

    /// The node's buffer was recycled by the compiled plan.
    #[error("graph tensor #{node} is an intermediate whose buffer was reused; mark it as an output")]
    NodeNotRetained { node: usize },

    /// A backend does not offer the requested capability.
    #[error("backend `{backend}` does not support {what}")]
    Unsupported { backend: String, what: String },

    /// An error raised inside a named layer.
    #[error("layer `{layer}`: {source}")]
    Layer {
        layer: String,
        #[source]
        source: Box<Error>,
    },

    /// Anything without a dedicated variant.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Attach the name of the layer the error happened in.
    ///
    /// Errors that already carry a layer name are returned unchanged.
    pub fn in_layer(self, layer: &str) -> Self {
        match self {
            e @ (Error::Layer { .. }
            | Error::NotInitialized { .. }
            | Error::BackwardBeforeForward { .. }) => e,
            e => Error::Layer {
                layer: layer.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// Strip layer context, returning the innermost error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Layer { source, .. } => source.root(),
            e => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// `return Err(Error::Msg(format!(...)))`.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
