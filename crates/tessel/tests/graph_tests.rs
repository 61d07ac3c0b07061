// Expression graph tests — record, compile, then replay against new inputs

use tessel::prelude::*;
use tessel::CompileStats;

fn assert_close(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!((g - e).abs() < tol, "elem {}: {} vs {} (tol={})", i, g, e, tol);
    }
}

fn matrix(data: &[f64], rows: usize, cols: usize) -> Tensor {
    Tensor::from_f64_slice(data, (rows, cols), DType::F64).unwrap()
}

const W: [f64; 6] = [1.0, -1.0, 0.5, 2.0, -0.5, 0.0];
const B: [f64; 2] = [0.25, -1.0];

/// `2 · relu(x · W + b) + 1` on the host, for a `[rows, 3]` input.
fn reference(x: &[f64]) -> Vec<f64> {
    let mut out = Vec::new();
    for row in x.chunks(3) {
        for j in 0..2 {
            let h: f64 = (0..3).map(|k| row[k] * W[k * 2 + j]).sum::<f64>() + B[j];
            out.push(2.0 * h.max(0.0) + 1.0);
        }
    }
    out
}

struct Mlp {
    graph: ExpressionGraph,
    x: GraphTensor,
    y: GraphTensor,
}

fn mlp(mark: bool) -> tessel::Result<Mlp> {
    let mut graph = ExpressionGraph::new();
    let x = graph.input((2, 3), DType::F64)?;
    let w = graph.constant(&matrix(&W, 3, 2))?;
    let b = graph.constant(&Tensor::from_f64_slice(&B, 2, DType::F64)?)?;
    let h = graph.dense(x, w, Some(b))?;
    let r = graph.relu(h)?;
    let y = graph.affine(r, 2.0, 1.0)?;
    if mark {
        graph.mark_output(y)?;
    }
    Ok(Mlp { graph, x, y })
}

// State machine

#[test]
fn test_recording_after_compile_fails() -> tessel::Result<()> {
    let Mlp { mut graph, x, y } = mlp(false)?;
    graph.compile()?;
    assert_eq!(graph.state(), GraphState::Compiled);

    let err = graph.relu(y).unwrap_err();
    assert!(matches!(err, Error::GraphState { state: "compiled", .. }));
    assert!(matches!(
        graph.input(3, DType::F64),
        Err(Error::GraphState { .. })
    ));
    assert!(matches!(graph.add(x, x), Err(Error::GraphState { .. })));
    assert!(matches!(graph.compile(), Err(Error::GraphState { .. })));
    Ok(())
}

#[test]
fn test_compute_before_compile_fails() -> tessel::Result<()> {
    let Mlp { mut graph, x, .. } = mlp(false)?;
    let err = graph.compute().unwrap_err();
    assert!(matches!(err, Error::GraphState { state: "building", .. }));
    assert!(matches!(
        graph.write(x, &Tensor::zeros((2, 3), DType::F64)),
        Err(Error::GraphState { .. })
    ));
    assert!(graph.stats().is_none());
    Ok(())
}

// Replay

#[test]
fn test_repeated_compute_follows_inputs() -> tessel::Result<()> {
    let Mlp { mut graph, x, y } = mlp(false)?;
    graph.compile()?;

    let first = [1.0, 2.0, 3.0, -1.0, 0.0, 1.0];
    graph.write(x, &matrix(&first, 2, 3))?;
    graph.compute()?;
    assert_eq!(graph.state(), GraphState::Compiled);
    assert_close(&graph.value(y)?.to_f64_vec()?, &reference(&first), 1e-12);

    let second = [-2.0, 0.5, 4.0, 3.0, 3.0, -3.0];
    graph.write(x, &matrix(&second, 2, 3))?;
    graph.compute()?;
    assert_close(&graph.value(y)?.to_f64_vec()?, &reference(&second), 1e-12);
    assert_ne!(reference(&first), reference(&second));
    Ok(())
}

#[test]
fn test_graph_matches_eager_dense() -> tessel::Result<()> {
    let w = matrix(&W, 3, 2);
    let b = Tensor::from_f64_slice(&B, 2, DType::F64)?;
    let mut fc = Dense::new(
        3,
        2,
        LayerConfig::default()
            .dtype(DType::F64)
            .with_parameter(ParamKind::Weights, w.clone())
            .with_parameter(ParamKind::Biases, b.clone()),
    );
    let mut sig = Sigmoid::new(LayerConfig::default().dtype(DType::F64));

    let mut graph = ExpressionGraph::new();
    let gx = graph.input((4, 3), DType::F64)?;
    let gw = graph.constant(&w)?;
    let gb = graph.constant(&b)?;
    let h = graph.dense(gx, gw, Some(gb))?;
    let y = graph.sigmoid(h)?;
    graph.compile()?;

    let data: Vec<f64> = (0..12).map(|i| (i as f64 - 6.0) * 0.3).collect();
    let x = Tensor::from_f64_slice(&data, (4, 3), DType::F64)?;
    fc.init(x.shape())?;
    let h = fc.forward(&x)?.clone();
    sig.init(h.shape())?;
    let eager = sig.forward(&h)?.to_f64_vec()?;

    graph.write(gx, &x)?;
    graph.compute()?;
    assert_close(&graph.value(y)?.to_f64_vec()?, &eager, 1e-12);
    Ok(())
}

#[test]
fn test_softmax_reshape_and_sum_rows() -> tessel::Result<()> {
    let mut graph = ExpressionGraph::new();
    let x = graph.input(6, DType::F64)?;
    let m = graph.reshape(x, (2, 3))?;
    let p = graph.softmax(m, 1)?;
    let s = graph.sum_rows(p)?;
    let e = graph.exp(x)?;
    let n = graph.neg(e)?;
    assert_eq!(graph.shape(s)?, &Shape::from(3));
    graph.compile()?;

    graph.write(x, &Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], 6, DType::F64)?)?;
    graph.compute()?;
    let probs = graph.value(p)?.to_f64_vec()?;
    assert_close(&[probs[..3].iter().sum(), probs[3..].iter().sum()], &[1.0, 1.0], 1e-12);
    let sums = graph.value(s)?.to_f64_vec()?;
    assert_close(&[sums.iter().sum()], &[2.0], 1e-12);
    assert_close(&graph.value(n)?.to_f64_vec()?[..1], &[-std::f64::consts::E], 1e-12);
    Ok(())
}

// Inputs and constants

#[test]
fn test_writes_are_checked() -> tessel::Result<()> {
    let mut graph = ExpressionGraph::new();
    let x = graph.input((1, 2), DType::F32)?;
    let c = graph.constant(&Tensor::ones((1, 2), DType::F32))?;
    let y = graph.add(x, c)?;
    graph.compile()?;

    let err = graph.write(c, &Tensor::zeros((1, 2), DType::F32)).unwrap_err();
    assert!(matches!(err, Error::ConstantNode { .. }));
    assert!(graph.write(y, &Tensor::zeros((1, 2), DType::F32)).is_err());
    assert!(matches!(
        graph.write(x, &Tensor::zeros((2, 2), DType::F32)),
        Err(Error::ShapeMismatch { .. })
    ));

    // Values convert into the input's dtype.
    graph.write(x, &Tensor::from_f64_slice(&[1.5, -3.0], (1, 2), DType::F64)?)?;
    graph.compute()?;
    assert_eq!(graph.value(y)?.to_vec::<f32>()?, vec![2.5, -2.0]);
    assert_eq!(graph.value(c)?.to_vec::<f32>()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn test_constant_is_a_snapshot() -> tessel::Result<()> {
    let mut source = Tensor::full(2, 3.0, DType::F64);
    let mut graph = ExpressionGraph::new();
    let x = graph.input(2, DType::F64)?;
    let c = graph.constant(&source)?;
    let y = graph.mul(x, c)?;
    source.fill(100.0)?;
    graph.compile()?;
    graph.write(x, &Tensor::ones(2, DType::F64))?;
    graph.compute()?;
    assert_eq!(graph.value(y)?.to_f64_vec()?, vec![3.0, 3.0]);
    Ok(())
}

// Lifecycle

#[test]
fn test_reset_keeps_nodes() -> tessel::Result<()> {
    let Mlp { mut graph, x, y } = mlp(false)?;
    graph.compile()?;
    let count = graph.tensor_count();

    graph.reset();
    assert_eq!(graph.state(), GraphState::Building);
    assert_eq!(graph.tensor_count(), count);
    let z = graph.sub(y, y)?;
    graph.compile()?;

    graph.write(x, &matrix(&[1.0; 6], 2, 3))?;
    graph.compute()?;
    assert_eq!(graph.value(z)?.to_f64_vec()?, vec![0.0; 4]);
    Ok(())
}

#[test]
fn test_clear_invalidates_handles() -> tessel::Result<()> {
    let Mlp { mut graph, x, .. } = mlp(false)?;
    let old_id = graph.id();
    graph.clear();
    assert_eq!(graph.tensor_count(), 0);
    assert_ne!(graph.id(), old_id);
    assert!(matches!(graph.relu(x), Err(Error::ForeignNode { .. })));

    let Mlp { graph: other, .. } = mlp(false)?;
    assert_ne!(other.id(), graph.id());
    assert!(matches!(other.shape(x), Err(Error::ForeignNode { .. })));
    Ok(())
}

#[test]
fn test_marked_outputs_share_intermediate_buffers() -> tessel::Result<()> {
    let mut graph = ExpressionGraph::new();
    let x = graph.input(4, DType::F32)?;
    let a = graph.relu(x)?;
    let b = graph.tanh(a)?;
    let c = graph.sigmoid(b)?;
    let d = graph.affine(c, 1.0, 0.0)?;
    graph.mark_output(d)?;
    graph.compile()?;

    let stats: &CompileStats = graph.stats().unwrap();
    assert_eq!(stats.num_nodes, 5);
    assert_eq!(stats.num_instructions, 4);
    assert!(stats.num_reused > 0);
    assert!(stats.num_slots < stats.num_nodes);

    graph.write(x, &Tensor::zeros(4, DType::F32))?;
    graph.compute()?;
    assert_eq!(graph.value(d)?.to_vec::<f32>()?, vec![0.5; 4]);
    assert!(matches!(graph.value(b), Err(Error::NodeNotRetained { .. })));
    assert!(graph.value(x).is_ok());
    Ok(())
}

#[test]
fn test_marked_and_unmarked_plans_agree() -> tessel::Result<()> {
    let data = [0.5, -1.5, 2.0, 1.0, 1.0, -0.25];
    let mut results = Vec::new();
    for mark in [false, true] {
        let Mlp { mut graph, x, y } = mlp(mark)?;
        graph.compile()?;
        graph.write(x, &matrix(&data, 2, 3))?;
        graph.compute()?;
        results.push(graph.value(y)?.to_f64_vec()?);
    }
    assert_eq!(results[0], results[1]);
    Ok(())
}

// Backend negotiation

struct GraphOnly;

impl Backend for GraphOnly {
    fn name(&self) -> &str {
        "graph-only"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new(false, true, ExecutionMode::Graph)
    }
}

#[test]
fn test_backend_negotiation() -> tessel::Result<()> {
    assert_eq!(CpuBackend.negotiate(None)?, ExecutionMode::Eager);
    assert_eq!(
        CpuBackend.negotiate(Some(ExecutionMode::Graph))?,
        ExecutionMode::Graph
    );

    assert_eq!(GraphOnly.negotiate(None)?, ExecutionMode::Graph);
    let err = GraphOnly.negotiate(Some(ExecutionMode::Eager)).unwrap_err();
    assert!(matches!(err, Error::Unsupported { ref backend, .. } if backend == "graph-only"));
    Ok(())
}

#[test]
fn test_negotiated_mode_drives_execution() -> tessel::Result<()> {
    let x = matrix(&[1.0, -2.0, 0.5, 3.0, 0.0, -1.0], 2, 3);
    let mut outputs = Vec::new();
    for mode in [ExecutionMode::Eager, ExecutionMode::Graph] {
        let out = match CpuBackend.negotiate(Some(mode))? {
            ExecutionMode::Eager => {
                let mut relu = Relu::new(LayerConfig::default().dtype(DType::F64));
                relu.init(x.shape())?;
                relu.forward(&x)?.to_f64_vec()?
            }
            ExecutionMode::Graph => {
                let mut graph = ExpressionGraph::new();
                let gx = graph.input((2, 3), DType::F64)?;
                let y = graph.relu(gx)?;
                graph.compile()?;
                graph.write(gx, &x)?;
                graph.compute()?;
                graph.value(y)?.to_f64_vec()?
            }
        };
        outputs.push(out);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], vec![1.0, 0.0, 0.5, 3.0, 0.0, 0.0]);
    Ok(())
}
