// Expression graphs — Record once, compile, replay many times
//
// An ExpressionGraph is the deferred counterpart of calling tensor kernels
// directly. Operations on GraphTensor handles are recorded, not executed;
// `compile` freezes them into a flat instruction tape over pre-allocated
// buffers; `compute` replays that tape against whatever was last written
// into the input nodes.
//
//   let mut g = ExpressionGraph::new();
//   let x = g.input((batch, 4), DType::F32)?;
//   let w = g.constant(&weights)?;
//   let y = g.dense(x, w, None)?;
//   let y = g.relu(y)?;
//   g.compile()?;
//   g.write(x, &batch_a)?;
//   g.compute()?;
//   let out = g.value(y)?;
//
// STATE MACHINE:
//
//   Building --compile--> Compiled --compute--> Executing --> Compiled
//      ^                     |
//      +------ reset --------+
//
// Every entry point checks the state first and fails with
// `Error::GraphState` when called in the wrong one. Shapes are inferred
// and checked while recording, so a plan that compiles cannot fail on
// shape at replay time.
//
// Handles carry the id of the graph that created them; using one with a
// different graph (or with this graph after `clear`) is `Error::ForeignNode`.

mod plan;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tessel_core::{BinaryOp, DType, Error, Result, Shape, Tensor, UnaryOp};

pub use plan::CompileStats;
use plan::{Instruction, Plan};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);

fn next_graph_id() -> u64 {
    NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where an expression graph is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphState {
    /// Accepting new nodes.
    Building,
    /// Frozen into a plan; inputs can be written and the plan computed.
    Compiled,
    /// Inside `compute`.
    Executing,
}

impl GraphState {
    pub fn name(&self) -> &'static str {
        match self {
            GraphState::Building => "building",
            GraphState::Compiled => "compiled",
            GraphState::Executing => "executing",
        }
    }
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to a node of an [`ExpressionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphTensor {
    id: usize,
    graph: u64,
    dtype: DType,
    constant: bool,
}

impl GraphTensor {
    /// Position of the node in recording order.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn graph_id(&self) -> u64 {
        self.graph
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }
}

#[derive(Debug, Clone)]
pub(crate) enum NodeOp {
    Input,
    Constant(Tensor),
    Unary(UnaryOp, usize),
    Binary(BinaryOp, usize, usize),
    Affine { src: usize, mul: f64, add: f64 },
    MatMul(usize, usize),
    AddRow(usize, usize),
    Dense { x: usize, w: usize, b: Option<usize> },
    Softmax { src: usize, dim: usize },
    Reshape(usize),
    SumRows(usize),
}

impl NodeOp {
    pub(crate) fn is_source(&self) -> bool {
        matches!(self, NodeOp::Input | NodeOp::Constant(_))
    }

    pub(crate) fn operands(&self) -> impl Iterator<Item = usize> {
        let ops: [Option<usize>; 3] = match *self {
            NodeOp::Input | NodeOp::Constant(_) => [None; 3],
            NodeOp::Unary(_, a)
            | NodeOp::Affine { src: a, .. }
            | NodeOp::Softmax { src: a, .. }
            | NodeOp::Reshape(a)
            | NodeOp::SumRows(a) => [Some(a), None, None],
            NodeOp::Binary(_, a, b) | NodeOp::MatMul(a, b) | NodeOp::AddRow(a, b) => {
                [Some(a), Some(b), None]
            }
            NodeOp::Dense { x, w, b } => [Some(x), Some(w), b],
        };
        ops.into_iter().flatten()
    }

    /// The tape entry for this node; sources have none.
    pub(crate) fn instruction(&self, slot: &[usize], dst: usize) -> Option<Instruction> {
        let instr = match *self {
            NodeOp::Input | NodeOp::Constant(_) => return None,
            NodeOp::Unary(op, src) => Instruction::Unary {
                op,
                src: slot[src],
                dst,
            },
            NodeOp::Binary(op, lhs, rhs) => Instruction::Binary {
                op,
                lhs: slot[lhs],
                rhs: slot[rhs],
                dst,
            },
            NodeOp::Affine { src, mul, add } => Instruction::Affine {
                src: slot[src],
                mul,
                add,
                dst,
            },
            NodeOp::MatMul(lhs, rhs) => Instruction::MatMul {
                lhs: slot[lhs],
                rhs: slot[rhs],
                dst,
            },
            NodeOp::AddRow(src, row) => Instruction::AddRow {
                src: slot[src],
                row: slot[row],
                dst,
            },
            NodeOp::Dense { x, w, b } => Instruction::Dense {
                x: slot[x],
                w: slot[w],
                b: b.map(|b| slot[b]),
                dst,
            },
            NodeOp::Softmax { src, dim } => Instruction::Softmax {
                src: slot[src],
                dim,
                dst,
            },
            NodeOp::Reshape(src) => Instruction::Reshape {
                src: slot[src],
                dst,
            },
            NodeOp::SumRows(src) => Instruction::SumRows {
                src: slot[src],
                dst,
            },
        };
        Some(instr)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) op: NodeOp,
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
}

/// A recorded tensor computation, compiled into a replayable plan.
#[derive(Debug)]
pub struct ExpressionGraph {
    id: u64,
    state: GraphState,
    nodes: Vec<Node>,
    outputs: Vec<bool>,
    plan: Option<Plan>,
}

impl Default for ExpressionGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionGraph {
    pub fn new() -> Self {
        ExpressionGraph {
            id: next_graph_id(),
            state: GraphState::Building,
            nodes: Vec::new(),
            outputs: Vec::new(),
            plan: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Number of recorded nodes, sources included.
    pub fn tensor_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of recorded operations (nodes that are not inputs or
    /// constants).
    pub fn operation_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.op.is_source()).count()
    }

    /// Statistics of the current plan.
    pub fn stats(&self) -> Option<&CompileStats> {
        self.plan.as_ref().map(|p| &p.stats)
    }

    pub fn shape(&self, t: GraphTensor) -> Result<&Shape> {
        Ok(&self.node(t)?.shape)
    }

    fn expect_state(&self, op: &'static str, expected: GraphState) -> Result<()> {
        if self.state != expected {
            return Err(Error::GraphState {
                op,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn node(&self, t: GraphTensor) -> Result<&Node> {
        if t.graph != self.id {
            return Err(Error::ForeignNode {
                node: t.id,
                owner: t.graph,
                graph: self.id,
            });
        }
        self.nodes
            .get(t.id)
            .ok_or_else(|| Error::msg(format!("graph tensor #{} does not exist", t.id)))
    }

    fn push(&mut self, op: NodeOp, shape: Shape, dtype: DType) -> GraphTensor {
        let constant = matches!(op, NodeOp::Constant(_));
        let id = self.nodes.len();
        self.nodes.push(Node { op, shape, dtype });
        self.outputs.push(false);
        GraphTensor {
            id,
            graph: self.id,
            dtype,
            constant,
        }
    }

    // Sources

    /// A node whose data is written with [`write`](Self::write) before each
    /// `compute`.
    pub fn input(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<GraphTensor> {
        self.expect_state("add an input", GraphState::Building)?;
        let shape = shape.into();
        if shape.is_empty() {
            return Err(Error::EmptyShape { shape });
        }
        Ok(self.push(NodeOp::Input, shape, dtype))
    }

    /// A node whose data is a copy of `value`, baked into the plan at
    /// compile time.
    pub fn constant(&mut self, value: &Tensor) -> Result<GraphTensor> {
        self.expect_state("add a constant", GraphState::Building)?;
        let (shape, dtype) = (value.shape().clone(), value.dtype());
        Ok(self.push(NodeOp::Constant(value.clone()), shape, dtype))
    }

    // Recording

    fn operand(&self, t: GraphTensor) -> Result<(&Shape, DType)> {
        self.expect_state("record an operation", GraphState::Building)?;
        let node = self.node(t)?;
        Ok((&node.shape, node.dtype))
    }

    fn pair(&self, a: GraphTensor, b: GraphTensor) -> Result<(&Shape, &Shape, DType)> {
        let (sa, da) = self.operand(a)?;
        let (sb, db) = self.operand(b)?;
        if da != db {
            return Err(Error::DTypeMismatch {
                expected: da,
                got: db,
            });
        }
        Ok((sa, sb, da))
    }

    fn unary(&mut self, op: UnaryOp, x: GraphTensor) -> Result<GraphTensor> {
        let (shape, dtype) = self.operand(x)?;
        let shape = shape.clone();
        Ok(self.push(NodeOp::Unary(op, x.id), shape, dtype))
    }

    fn binary(&mut self, op: BinaryOp, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
        let (sa, sb, dtype) = self.pair(a, b)?;
        sa.expect_eq(sb)?;
        let shape = sa.clone();
        Ok(self.push(NodeOp::Binary(op, a.id, b.id), shape, dtype))
    }

    pub fn add(&mut self, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn relu(&mut self, x: GraphTensor) -> Result<GraphTensor> {
        self.unary(UnaryOp::Relu, x)
    }

    pub fn sigmoid(&mut self, x: GraphTensor) -> Result<GraphTensor> {
        self.unary(UnaryOp::Sigmoid, x)
    }

    pub fn tanh(&mut self, x: GraphTensor) -> Result<GraphTensor> {
        self.unary(UnaryOp::Tanh, x)
    }

    pub fn exp(&mut self, x: GraphTensor) -> Result<GraphTensor> {
        self.unary(UnaryOp::Exp, x)
    }

    pub fn neg(&mut self, x: GraphTensor) -> Result<GraphTensor> {
        self.unary(UnaryOp::Neg, x)
    }

    /// `x · mul + add`
    pub fn affine(&mut self, x: GraphTensor, mul: f64, add: f64) -> Result<GraphTensor> {
        let (shape, dtype) = self.operand(x)?;
        let shape = shape.clone();
        Ok(self.push(NodeOp::Affine { src: x.id, mul, add }, shape, dtype))
    }

    /// `[m, k] · [k, n] -> [m, n]`, or `[k] · [k, n] -> [n]`.
    pub fn matmul(&mut self, a: GraphTensor, b: GraphTensor) -> Result<GraphTensor> {
        let (sa, sb, dtype) = self.pair(a, b)?;
        let shape = matmul_shape(sa, sb)?;
        Ok(self.push(NodeOp::MatMul(a.id, b.id), shape, dtype))
    }

    /// Add the `[n]` vector `row` to every row of `x`.
    pub fn add_row(&mut self, x: GraphTensor, row: GraphTensor) -> Result<GraphTensor> {
        let (sx, sr, dtype) = self.pair(x, row)?;
        check_row(sx, sr)?;
        let shape = sx.clone();
        Ok(self.push(NodeOp::AddRow(x.id, row.id), shape, dtype))
    }

    /// `x · w + b`, recorded as a single fused operation.
    pub fn dense(
        &mut self,
        x: GraphTensor,
        w: GraphTensor,
        b: Option<GraphTensor>,
    ) -> Result<GraphTensor> {
        let (sx, sw, dtype) = self.pair(x, w)?;
        let shape = matmul_shape(sx, sw)?;
        if let Some(b) = b {
            let (_, sb, _) = self.pair(x, b)?;
            check_row(&shape, sb)?;
        }
        let op = NodeOp::Dense {
            x: x.id,
            w: w.id,
            b: b.map(|b| b.id),
        };
        Ok(self.push(op, shape, dtype))
    }

    pub fn softmax(&mut self, x: GraphTensor, dim: usize) -> Result<GraphTensor> {
        let (shape, dtype) = self.operand(x)?;
        shape.dim(dim)?;
        let shape = shape.clone();
        Ok(self.push(NodeOp::Softmax { src: x.id, dim }, shape, dtype))
    }

    /// Same elements, new shape.
    pub fn reshape(&mut self, x: GraphTensor, shape: impl Into<Shape>) -> Result<GraphTensor> {
        let shape = shape.into();
        let (src, dtype) = self.operand(x)?;
        if src.elem_count() != shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: src.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        Ok(self.push(NodeOp::Reshape(x.id), shape, dtype))
    }

    /// Column sums over the batch: `[m, n] -> [n]`.
    pub fn sum_rows(&mut self, x: GraphTensor) -> Result<GraphTensor> {
        let (shape, dtype) = self.operand(x)?;
        let out = match shape.rank() {
            1 => shape.clone(),
            2 => Shape::from(shape.dims()[1]),
            r => {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: r,
                })
            }
        };
        Ok(self.push(NodeOp::SumRows(x.id), out, dtype))
    }

    /// Keep `t` readable after `compute`. Once any node is marked, unmarked
    /// intermediates share buffers and can no longer be read.
    pub fn mark_output(&mut self, t: GraphTensor) -> Result<()> {
        self.expect_state("mark an output", GraphState::Building)?;
        self.node(t)?;
        self.outputs[t.id] = true;
        Ok(())
    }

    // Plan

    /// Freeze the recorded nodes into a plan.
    pub fn compile(&mut self) -> Result<()> {
        self.expect_state("compile", GraphState::Building)?;
        let plan = Plan::compile(&self.nodes, &self.outputs)?;
        tracing::debug!(graph = self.id, stats = %plan.stats, "graph compiled");
        self.plan = Some(plan);
        self.state = GraphState::Compiled;
        Ok(())
    }

    fn compiled(&self, op: &'static str) -> Result<&Plan> {
        self.expect_state(op, GraphState::Compiled)?;
        self.plan.as_ref().ok_or(Error::GraphState {
            op,
            state: self.state.name(),
        })
    }

    /// Copy `data` into the input node `t`.
    pub fn write(&mut self, t: GraphTensor, data: &Tensor) -> Result<()> {
        self.compiled("write an input")?;
        match self.node(t)?.op {
            NodeOp::Input => {}
            NodeOp::Constant(_) => return Err(Error::ConstantNode { node: t.id }),
            _ => {
                return Err(Error::msg(format!(
                    "graph tensor #{} is computed, not an input",
                    t.id
                )))
            }
        }
        let plan = self
            .plan
            .as_mut()
            .ok_or_else(|| Error::msg("graph has no plan"))?;
        let slot = plan.node_slot[t.id];
        data.copy_to(&mut plan.slots[slot])
    }

    /// Replay the plan against the current inputs.
    pub fn compute(&mut self) -> Result<()> {
        self.compiled("compute")?;
        let plan = self
            .plan
            .as_mut()
            .ok_or_else(|| Error::msg("graph has no plan"))?;
        self.state = GraphState::Executing;
        tracing::trace!(graph = self.id, instructions = plan.tape.len(), "compute");
        let res = plan.run();
        self.state = GraphState::Compiled;
        res
    }

    /// The data of node `t` after the last `compute` (or the written /
    /// baked data for sources).
    pub fn value(&self, t: GraphTensor) -> Result<&Tensor> {
        let plan = self.compiled("read a value")?;
        self.node(t)?;
        if !plan.retained[t.id] {
            return Err(Error::NodeNotRetained { node: t.id });
        }
        Ok(&plan.slots[plan.node_slot[t.id]])
    }

    /// Drop the plan and go back to recording. Nodes are kept.
    pub fn reset(&mut self) {
        self.plan = None;
        self.state = GraphState::Building;
    }

    /// Drop the plan and every node. Existing handles become foreign.
    pub fn clear(&mut self) {
        self.reset();
        self.nodes.clear();
        self.outputs.clear();
        self.id = next_graph_id();
    }
}

fn matmul_shape(a: &Shape, b: &Shape) -> Result<Shape> {
    b.expect_rank(2)?;
    let (k2, n) = (b.dims()[0], b.dims()[1]);
    let (m, k1) = match a.dims() {
        [k] => (1, *k),
        [m, k] => (*m, *k),
        _ => {
            return Err(Error::RankMismatch {
                expected: 2,
                got: a.rank(),
            })
        }
    };
    if k1 != k2 {
        return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
    }
    Ok(if a.rank() == 1 {
        Shape::from(n)
    } else {
        Shape::from((m, n))
    })
}

fn check_row(x: &Shape, row: &Shape) -> Result<()> {
    row.expect_rank(1)?;
    if x.rank() == 0 || x.rank() > 2 || row.elem_count() != x.last_dim() {
        return Err(Error::ShapeMismatch {
            expected: Shape::from(x.last_dim()),
            got: row.clone(),
        });
    }
    Ok(())
}
