// Backend — Which execution modes a compute backend offers
//
// A backend advertises whether it can run layers eagerly (each kernel runs
// when called), through compiled expression graphs, or both, and which of
// the two it recommends. Callers negotiate a mode before building their
// pipeline:
//
//   let mode = CpuBackend.negotiate(None)?;                 // recommended
//   let mode = CpuBackend.negotiate(Some(ExecutionMode::Graph))?;
//
// A descriptor that recommends a mode it does not support is corrected at
// construction (with a warning) rather than rejected.

use std::fmt;

use tessel_core::{Error, Result};

/// How layer computations are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Kernels run as soon as they are called.
    Eager,
    /// Operations are recorded into an expression graph, compiled, then
    /// replayed.
    Graph,
}

impl ExecutionMode {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMode::Eager => "eager",
            ExecutionMode::Graph => "graph",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a backend supports and prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities {
    eager: bool,
    graph: bool,
    recommended: ExecutionMode,
}

impl Capabilities {
    /// Build a descriptor. A backend that supports nothing is given eager
    /// execution; an unsupported recommendation is replaced by a supported
    /// mode.
    pub fn new(eager: bool, graph: bool, recommended: ExecutionMode) -> Self {
        let eager = if !eager && !graph {
            tracing::warn!("backend supports no execution mode, enabling eager");
            true
        } else {
            eager
        };
        let mut caps = Capabilities {
            eager,
            graph,
            recommended,
        };
        if !caps.supports(recommended) {
            let fallback = if eager {
                ExecutionMode::Eager
            } else {
                ExecutionMode::Graph
            };
            tracing::warn!(
                recommended = %recommended,
                using = %fallback,
                "recommended execution mode is not supported"
            );
            caps.recommended = fallback;
        }
        caps
    }

    pub fn eager(&self) -> bool {
        self.eager
    }

    pub fn graph(&self) -> bool {
        self.graph
    }

    pub fn recommended(&self) -> ExecutionMode {
        self.recommended
    }

    pub fn supports(&self, mode: ExecutionMode) -> bool {
        match mode {
            ExecutionMode::Eager => self.eager,
            ExecutionMode::Graph => self.graph,
        }
    }

    /// `requested` if supported, the recommendation if nothing was
    /// requested, `None` otherwise.
    pub fn negotiate(&self, requested: Option<ExecutionMode>) -> Option<ExecutionMode> {
        match requested {
            None => Some(self.recommended),
            Some(mode) if self.supports(mode) => Some(mode),
            Some(_) => None,
        }
    }
}

/// A compute backend.
pub trait Backend {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Pick the execution mode to use, failing with `Error::Unsupported`
    /// when the requested one is not offered.
    fn negotiate(&self, requested: Option<ExecutionMode>) -> Result<ExecutionMode> {
        let caps = self.capabilities();
        let mode = caps.negotiate(requested).ok_or_else(|| Error::Unsupported {
            backend: self.name().to_string(),
            what: format!(
                "{} execution",
                requested.unwrap_or(caps.recommended()).name()
            ),
        })?;
        tracing::debug!(backend = self.name(), mode = %mode, "execution mode negotiated");
        Ok(mode)
    }
}

/// The built-in CPU backend: both modes, eager recommended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new(true, true, ExecutionMode::Eager)
    }
}
