// Plan — Compile a recorded graph into a replayable instruction tape
//
// COMPONENTS:
//
//   Instruction  — one kernel call with pre-resolved buffer slots
//   Plan         — slot buffers, node → slot map and the instruction tape
//   CompileStats — what compilation produced
//
// MEMORY PLANNING:
//
// Every node gets a buffer slot. Inputs, constants and nodes marked as
// outputs own their slot for the life of the plan. When at least one node
// is marked, the remaining intermediates share slots: a slot is released
// after the last instruction that reads it and handed to the next
// intermediate with the same shape and dtype (a register allocator over
// the tape). A node's slot is always acquired before its operands' slots
// are released, so no instruction reads and writes the same buffer.
//
// When nothing is marked every node keeps its own slot and stays readable
// after `compute`.
//
// All slot tensors are allocated once, at compile time. Replaying the tape
// only calls destination kernels.

use std::fmt;
use std::time::Instant;

use tessel_core::{BinaryOp, DType, Error, Result, Shape, Tensor, UnaryOp};

use super::{Node, NodeOp};

/// A single operation of the compiled tape. Operands are slot indices.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Instruction {
    Unary {
        op: UnaryOp,
        src: usize,
        dst: usize,
    },
    Binary {
        op: BinaryOp,
        lhs: usize,
        rhs: usize,
        dst: usize,
    },
    Affine {
        src: usize,
        mul: f64,
        add: f64,
        dst: usize,
    },
    MatMul {
        lhs: usize,
        rhs: usize,
        dst: usize,
    },
    AddRow {
        src: usize,
        row: usize,
        dst: usize,
    },
    /// `dst = x · w (+ b)`
    Dense {
        x: usize,
        w: usize,
        b: Option<usize>,
        dst: usize,
    },
    Softmax {
        src: usize,
        dim: usize,
        dst: usize,
    },
    Reshape {
        src: usize,
        dst: usize,
    },
    SumRows {
        src: usize,
        dst: usize,
    },
}

/// Statistics from compiling an expression graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Recorded nodes, sources included.
    pub num_nodes: usize,
    pub num_inputs: usize,
    pub num_constants: usize,
    /// Length of the instruction tape.
    pub num_instructions: usize,
    /// Distinct buffers allocated.
    pub num_slots: usize,
    /// Nodes that were given a slot released by an earlier node.
    pub num_reused: usize,
    pub compile_time_us: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} instructions ({} nodes, {} inputs, {} constants), {} slots ({} reused), compiled in {}μs",
            self.num_instructions,
            self.num_nodes,
            self.num_inputs,
            self.num_constants,
            self.num_slots,
            self.num_reused,
            self.compile_time_us,
        )
    }
}

/// The compiled form of an expression graph.
#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) slots: Vec<Tensor>,
    /// Slot of every node, by node id.
    pub(crate) node_slot: Vec<usize>,
    /// Whether the node's value survives `compute`.
    pub(crate) retained: Vec<bool>,
    pub(crate) tape: Vec<Instruction>,
    pub(crate) stats: CompileStats,
}

/// Free slots waiting for a node with the same shape and dtype.
#[derive(Default)]
struct SlotPool {
    free: Vec<(usize, Shape, DType)>,
}

impl SlotPool {
    fn take(&mut self, shape: &Shape, dtype: DType) -> Option<usize> {
        let pos = self
            .free
            .iter()
            .position(|(_, s, d)| s == shape && *d == dtype)?;
        Some(self.free.swap_remove(pos).0)
    }

    fn give(&mut self, slot: usize, shape: &Shape, dtype: DType) {
        self.free.push((slot, shape.clone(), dtype));
    }
}

impl Plan {
    /// Validate `nodes` and build the tape. `outputs[i]` marks node i.
    pub(crate) fn compile(nodes: &[Node], outputs: &[bool]) -> Result<Plan> {
        let start = Instant::now();
        let reuse = outputs.iter().any(|&o| o);

        // 1. Validate ordering and find each node's last reader.
        let mut last_use: Vec<Option<usize>> = vec![None; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for src in node.op.operands() {
                if src >= i {
                    return Err(Error::msg(format!(
                        "graph tensor #{i} reads #{src}, which is not recorded before it"
                    )));
                }
                last_use[src] = Some(i);
            }
        }

        // 2. Assign slots.
        let pinned = |i: usize| !reuse || outputs[i] || nodes[i].op.is_source();
        let mut pool = SlotPool::default();
        let mut slot_shapes: Vec<(Shape, DType)> = Vec::new();
        let mut node_slot = Vec::with_capacity(nodes.len());
        let mut released = vec![false; nodes.len()];
        let mut num_reused = 0;
        for (i, node) in nodes.iter().enumerate() {
            let reused = if pinned(i) {
                None
            } else {
                pool.take(&node.shape, node.dtype)
            };
            let slot = match reused {
                Some(s) => {
                    num_reused += 1;
                    s
                }
                None => {
                    slot_shapes.push((node.shape.clone(), node.dtype));
                    slot_shapes.len() - 1
                }
            };
            node_slot.push(slot);

            for src in node.op.operands() {
                if last_use[src] == Some(i) && !pinned(src) && !released[src] {
                    released[src] = true;
                    pool.give(node_slot[src], &nodes[src].shape, nodes[src].dtype);
                }
            }
            if last_use[i].is_none() && !pinned(i) {
                pool.give(slot, &node.shape, node.dtype);
            }
        }

        // 3. Allocate every slot once and bake constants.
        let mut slots: Vec<Tensor> = slot_shapes
            .iter()
            .map(|(s, d)| Tensor::zeros(s, *d))
            .collect();
        for (i, node) in nodes.iter().enumerate() {
            if let NodeOp::Constant(value) = &node.op {
                value.copy_to(&mut slots[node_slot[i]])?;
            }
        }

        // 4. Emit the tape.
        let tape: Vec<Instruction> = nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.op.instruction(&node_slot, node_slot[i]))
            .collect();

        let stats = CompileStats {
            num_nodes: nodes.len(),
            num_inputs: nodes
                .iter()
                .filter(|n| matches!(n.op, NodeOp::Input))
                .count(),
            num_constants: nodes
                .iter()
                .filter(|n| matches!(n.op, NodeOp::Constant(_)))
                .count(),
            num_instructions: tape.len(),
            num_slots: slots.len(),
            num_reused,
            compile_time_us: start.elapsed().as_micros() as u64,
        };
        Ok(Plan {
            slots,
            retained: (0..nodes.len()).map(pinned).collect(),
            node_slot,
            tape,
            stats,
        })
    }

    /// Replay the tape once.
    pub(crate) fn run(&mut self) -> Result<()> {
        for instr in &self.tape {
            execute(instr, &mut self.slots)?;
        }
        Ok(())
    }
}

/// Read access to every slot except the one being written.
struct Operands<'a> {
    before: &'a [Tensor],
    after: &'a [Tensor],
    dst: usize,
}

impl Operands<'_> {
    fn get(&self, slot: usize) -> Result<&Tensor> {
        let t = if slot < self.dst {
            self.before.get(slot)
        } else if slot > self.dst {
            self.after.get(slot - self.dst - 1)
        } else {
            None
        };
        t.ok_or_else(|| Error::msg(format!("slot {slot} is not readable while writing it")))
    }
}

fn split(slots: &mut [Tensor], dst: usize) -> Result<(Operands<'_>, &mut Tensor)> {
    if dst >= slots.len() {
        return Err(Error::msg(format!("slot {dst} out of range")));
    }
    let (before, rest) = slots.split_at_mut(dst);
    let (out, after) = rest
        .split_first_mut()
        .ok_or_else(|| Error::msg(format!("slot {dst} out of range")))?;
    Ok((Operands { before, after, dst }, out))
}

fn execute(instr: &Instruction, slots: &mut [Tensor]) -> Result<()> {
    match *instr {
        Instruction::Unary { op, src, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(src)?.unary_to(op, out)
        }
        Instruction::Binary { op, lhs, rhs, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(lhs)?.binary_to(op, ops.get(rhs)?, out)
        }
        Instruction::Affine { src, mul, add, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(src)?.affine_to(mul, add, out)
        }
        Instruction::MatMul { lhs, rhs, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(lhs)?.matmul_to(ops.get(rhs)?, out)
        }
        Instruction::AddRow { src, row, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(src)?.add_row_to(ops.get(row)?, out)
        }
        Instruction::Dense { x, w, b, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(x)?.matmul_to(ops.get(w)?, out)?;
            match b {
                Some(b) => out.add_row_assign(ops.get(b)?),
                None => Ok(()),
            }
        }
        Instruction::Softmax { src, dim, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(src)?.softmax_to(dim, out)
        }
        Instruction::Reshape { src, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(src)?.copy_flat_to(out)
        }
        Instruction::SumRows { src, dst } => {
            let (ops, out) = split(slots, dst)?;
            ops.get(src)?.sum_rows_to(out)
        }
    }
}
