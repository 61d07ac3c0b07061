// Integration tests for tessel-nn through the facade
//
// Layer lifecycle, the reference values every operator must reproduce, and
// a model + loss training step on the CPU.

use rand::rngs::StdRng;
use rand::SeedableRng;

use tessel::prelude::*;

fn assert_close(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            (g - e).abs() < tol,
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn f64_config() -> LayerConfig {
    LayerConfig::default().dtype(DType::F64).seed(3)
}

fn vector(data: &[f64]) -> Tensor {
    Tensor::from_f64_slice(data, data.len(), DType::F64).unwrap()
}

// Lifecycle

#[test]
fn test_output_shape_matches_forward() -> tessel::Result<()> {
    let cfg = || LayerConfig::default().seed(11);
    let padded = Pool2dParams {
        kernel: [3, 3],
        stride: [2, 2],
        padding: [1, 1],
    };
    let strided = Conv2dParams {
        stride: [2, 2],
        padding: [1, 1],
    };
    let mut cases: Vec<(Box<dyn Layer>, Shape)> = vec![
        (Box::new(Dense::new(4, 3, cfg())), Shape::from((2, 4))),
        (Box::new(Dense::new(4, 3, cfg())), Shape::from(4)),
        (Box::new(Relu::new(cfg())), Shape::from((2, 5))),
        (Box::new(Sigmoid::new(cfg())), Shape::from((2, 5))),
        (Box::new(Tanh::new(cfg())), Shape::from((2, 5))),
        (Box::new(Softmax::new(cfg())), Shape::from((2, 5))),
        (
            Box::new(Dropout::new(DropoutConfig::default().training(true), cfg())),
            Shape::from((2, 5)),
        ),
        (
            Box::new(MaxPool2d::new(Pool2dParams::square(2), cfg())),
            Shape::from((1, 2, 4, 4)),
        ),
        (Box::new(AvgPool2d::new(padded, cfg())), Shape::from((1, 2, 5, 5))),
        (Box::new(GlobalAvgPool2d::new(cfg())), Shape::from((2, 3, 4, 4))),
        (
            Box::new(Conv2d::new(2, 4, [3, 3], strided, cfg())),
            Shape::from((1, 2, 7, 7)),
        ),
        (Box::new(Conv1d::new(3, 2, 3, 1, 1, cfg())), Shape::from((2, 3, 6))),
        (Box::new(Lstm::new(3, 4, cfg())), Shape::from((2, 3))),
        (Box::new(Flatten::new(cfg())), Shape::from((2, 3, 2, 2))),
        (
            Box::new(Flatten::range(1, Some(3), cfg())),
            Shape::from((2, 3, 2, 2)),
        ),
        (Box::new(Reshape::new((4, 3), cfg())), Shape::from((2, 6))),
        (Box::new(Squeeze::new(cfg())), Shape::from((2, 1, 3))),
        (Box::new(Unsqueeze::new(1, cfg())), Shape::from((2, 3))),
        (Box::new(Transpose::dims(1, 2, cfg())), Shape::from((2, 3, 4))),
        (
            Box::new(
                Model::new()
                    .add(Dense::new(4, 6, cfg()))
                    .add(Relu::new(cfg()))
                    .add(Dense::new(6, 2, cfg())),
            ),
            Shape::from((5, 4)),
        ),
    ];

    let mut rng = StdRng::seed_from_u64(0);
    for (layer, shape) in cases.iter_mut() {
        let expected = layer.output_shape(shape)?;
        assert_eq!(layer.state(), LayerState::Uninitialized);
        layer.init(shape)?;
        let x = Tensor::rand_uniform(&*shape, DType::F32, -1.0, 1.0, &mut rng);
        let got = layer.forward(&x)?.shape().clone();
        assert_eq!(got, expected, "layer {}", layer.name());
        let g = Tensor::ones(&expected, DType::F32);
        let dx = layer.backward(&g)?.shape().clone();
        assert_eq!(&dx, &*shape, "layer {}", layer.name());
    }
    Ok(())
}

#[test]
fn test_lifecycle_errors() -> tessel::Result<()> {
    let mut dense = Dense::new(2, 2, LayerConfig::default().name("fc"));
    let x = Tensor::ones((1, 2), DType::F32);
    let err = dense.forward(&x).unwrap_err();
    assert!(matches!(err, Error::NotInitialized { ref layer } if layer == "fc"));

    dense.init(x.shape())?;
    let err = dense.backward(&x).unwrap_err();
    assert!(matches!(err, Error::BackwardBeforeForward { .. }));

    let err = dense.forward(&Tensor::ones((1, 3), DType::F32)).unwrap_err();
    assert!(matches!(err.root(), Error::ShapeMismatch { .. }));
    Ok(())
}

// Activations

#[test]
fn test_sigmoid_reference_values() -> tessel::Result<()> {
    let mut sig = Sigmoid::new(f64_config());
    let x = vector(&[0.0, 10.0, -2.0]);
    sig.init(x.shape())?;
    let y = sig.forward(&x)?.to_f64_vec()?;
    assert_close(&y[..2], &[0.5, 0.9999546], 1e-6);

    let dx = sig.backward(&vector(&[1.0, 1.0, 1.0]))?.to_f64_vec()?;
    let expected: Vec<f64> = y.iter().map(|o| o * (1.0 - o)).collect();
    assert_close(&dx, &expected, 1e-6);
    Ok(())
}

#[test]
fn test_tanh_reference_values() -> tessel::Result<()> {
    let mut tanh = Tanh::new(f64_config());
    let x = vector(&[0.0, 1.0]);
    tanh.init(x.shape())?;
    let y = tanh.forward(&x)?.to_f64_vec()?;
    assert_close(&y, &[0.0, 0.7615942], 1e-6);

    let dx = tanh.backward(&vector(&[1.0, 1.0]))?.to_f64_vec()?;
    let expected: Vec<f64> = y.iter().map(|o| 1.0 - o * o).collect();
    assert_close(&dx, &expected, 1e-9);
    Ok(())
}

#[test]
fn test_relu_reference_values() -> tessel::Result<()> {
    let mut relu = Relu::new(f64_config());
    let x = vector(&[-1.0, 0.0, 1.0, -2.0, 2.0]);
    relu.init(x.shape())?;
    assert_eq!(relu.forward(&x)?.to_f64_vec()?, vec![0.0, 0.0, 1.0, 0.0, 2.0]);
    let dx = relu.backward(&vector(&[1.0; 5]))?;
    assert_eq!(dx.to_f64_vec()?, vec![0.0, 0.0, 1.0, 0.0, 1.0]);
    Ok(())
}

#[test]
fn test_softmax_is_a_distribution() -> tessel::Result<()> {
    let mut softmax = Softmax::new(f64_config());
    let x = vector(&[1.0, 2.0, 3.0]);
    softmax.init(x.shape())?;
    let y = softmax.forward(&x)?.to_f64_vec()?;
    assert!(y.iter().all(|&p| p >= 0.0));
    assert!((y.iter().sum::<f64>() - 1.0).abs() < 1e-6);
    assert!(y[0] < y[1] && y[1] < y[2]);
    Ok(())
}

// Dropout

#[test]
fn test_dropout_rate_zero_is_identity() -> tessel::Result<()> {
    let x = vector(&[0.5, -1.0, 2.0, 3.5]);
    let g = vector(&[1.0, 2.0, 3.0, 4.0]);
    for training in [false, true] {
        let mut drop = Dropout::new(
            DropoutConfig::default().rate(0.0).training(training),
            f64_config(),
        );
        drop.init(x.shape())?;
        assert_eq!(drop.forward(&x)?.to_f64_vec()?, x.to_f64_vec()?);
        assert_eq!(drop.backward(&g)?.to_f64_vec()?, g.to_f64_vec()?);
    }
    Ok(())
}

#[test]
fn test_dropout_seeded_mask() -> tessel::Result<()> {
    let mut drop = Dropout::new(
        DropoutConfig::default().rate(0.5).training(true).seed(42),
        f64_config(),
    );
    let x = Tensor::ones(10, DType::F64);
    drop.init(x.shape())?;
    let y = drop.forward(&x)?.to_f64_vec()?;
    assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
    assert!(y.contains(&0.0), "nothing dropped: {y:?}");
    assert!(y.contains(&2.0), "nothing kept: {y:?}");

    let dx = drop.backward(&Tensor::ones(10, DType::F64))?.to_f64_vec()?;
    assert_eq!(dx, y);
    Ok(())
}

#[test]
fn test_dropout_with_caller_rng() -> tessel::Result<()> {
    use rand::rngs::mock::StepRng;
    // 0.0, 0.5, 0.0, 0.5, ... against rate 0.5: drop, keep, drop, keep
    let mut drop = Dropout::with_rng(
        DropoutConfig::default().rate(0.5).training(true),
        f64_config(),
        StepRng::new(0, 1 << 63),
    );
    let x = vector(&[3.0, 3.0, 3.0, 3.0, 3.0, 3.0]);
    drop.init(x.shape())?;
    let y = drop.forward(&x)?.to_f64_vec()?;
    assert_eq!(y, vec![0.0, 6.0, 0.0, 6.0, 0.0, 6.0]);
    Ok(())
}

#[test]
fn test_dropout_inference_mode_passes_through() -> tessel::Result<()> {
    let mut drop = Dropout::new(DropoutConfig::default().seed(1), f64_config());
    assert!(!drop.is_training());
    let x = vector(&[1.0, 2.0, 3.0]);
    drop.init(x.shape())?;
    assert_eq!(drop.forward(&x)?.to_f64_vec()?, vec![1.0, 2.0, 3.0]);
    assert!(drop.mask().is_none());
    Ok(())
}

// Pooling

#[test]
fn test_max_pool_gradient_goes_to_argmax() -> tessel::Result<()> {
    let x = Tensor::from_f64_slice(
        &[
            1.0, 5.0, 2.0, 0.0, //
            3.0, 4.0, 8.0, 1.0, //
            0.0, 2.0, 1.0, 1.0, //
            9.0, 1.0, 3.0, 7.0,
        ],
        (1, 1, 4, 4),
        DType::F64,
    )?;
    let mut pool = MaxPool2d::new(Pool2dParams::square(2), f64_config());
    pool.init(x.shape())?;
    assert_eq!(pool.forward(&x)?.to_f64_vec()?, vec![5.0, 8.0, 9.0, 7.0]);
    assert_eq!(pool.indices(), &[1, 6, 12, 15]);

    let g = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (1, 1, 2, 2), DType::F64)?;
    let dx = pool.backward(&g)?.to_f64_vec()?;
    for (i, v) in dx.iter().enumerate() {
        match i {
            1 => assert_eq!(*v, 1.0),
            6 => assert_eq!(*v, 2.0),
            12 => assert_eq!(*v, 3.0),
            15 => assert_eq!(*v, 4.0),
            _ => assert_eq!(*v, 0.0, "gradient leaked to {i}"),
        }
    }
    Ok(())
}

#[test]
fn test_avg_pool_gradient_is_uniform() -> tessel::Result<()> {
    let x = Tensor::from_f64_slice(
        &(0..16).map(f64::from).collect::<Vec<_>>(),
        (1, 1, 4, 4),
        DType::F64,
    )?;
    let mut pool = AvgPool2d::new(Pool2dParams::square(2), f64_config());
    pool.init(x.shape())?;
    assert_eq!(pool.forward(&x)?.to_f64_vec()?, vec![2.5, 4.5, 10.5, 12.5]);

    let g = Tensor::from_f64_slice(&[4.0, 8.0, 0.0, 2.0], (1, 1, 2, 2), DType::F64)?;
    let dx = pool.backward(&g)?.to_f64_vec()?;
    // Window (0, 0) covers flat positions 0, 1, 4, 5.
    assert_eq!([dx[0], dx[1], dx[4], dx[5]], [1.0; 4]);
    assert_eq!([dx[2], dx[3], dx[6], dx[7]], [2.0; 4]);
    assert_eq!([dx[10], dx[11], dx[14], dx[15]], [0.5; 4]);
    assert_eq!(dx.iter().sum::<f64>(), 14.0);
    Ok(())
}

#[test]
fn test_global_avg_pool() -> tessel::Result<()> {
    let x = Tensor::from_f64_slice(
        &(0..8).map(f64::from).collect::<Vec<_>>(),
        (1, 2, 2, 2),
        DType::F64,
    )?;
    let mut pool = GlobalAvgPool2d::new(f64_config());
    pool.init(x.shape())?;
    assert_eq!(pool.forward(&x)?.to_f64_vec()?, vec![1.5, 5.5]);
    let dx = pool.backward(&Tensor::from_f64_slice(&[4.0, 8.0], (1, 2), DType::F64)?)?;
    assert_eq!(
        dx.to_f64_vec()?,
        vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]
    );
    Ok(())
}

// Dense

#[test]
fn test_dense_forward_backward_values() -> tessel::Result<()> {
    let w = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64)?;
    let b = vector(&[0.5, -0.5]);
    let mut fc = Dense::new(
        2,
        2,
        f64_config()
            .with_parameter(ParamKind::Weights, w)
            .with_parameter(ParamKind::Biases, b),
    );
    let x = Tensor::from_f64_slice(&[1.0, 2.0], (1, 2), DType::F64)?;
    fc.init(x.shape())?;
    assert_eq!(fc.forward(&x)?.to_f64_vec()?, vec![7.5, 9.5]);

    let g = Tensor::ones((1, 2), DType::F64);
    assert_eq!(fc.backward(&g)?.to_f64_vec()?, vec![3.0, 7.0]);
    let gw = fc.parameter(ParamKind::Weights).and_then(|p| p.grad()).unwrap();
    assert_eq!(gw.to_f64_vec()?, vec![1.0, 1.0, 2.0, 2.0]);
    let gb = fc.parameter(ParamKind::Biases).and_then(|p| p.grad()).unwrap();
    assert_eq!(gb.to_f64_vec()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn test_frozen_layer_has_no_gradients() -> tessel::Result<()> {
    let mut fc = Dense::new(3, 2, f64_config().can_learn(false));
    let x = Tensor::ones((2, 3), DType::F64);
    fc.init(x.shape())?;
    fc.forward(&x)?;
    fc.backward(&Tensor::ones((2, 2), DType::F64))?;
    assert!(!fc.can_learn());
    assert!(fc.parameters().iter().all(|p| p.grad().is_none()));
    Ok(())
}

// Recurrent

#[test]
fn test_lstm_state_carries_between_steps() -> tessel::Result<()> {
    // Zero weights: every sigmoid gate is 0.5 and the candidate is tanh(bias).
    let cfg = f64_config()
        .with_parameter(ParamKind::Weights, Tensor::zeros((3, 4), DType::F64))
        .with_parameter(ParamKind::Biases, vector(&[0.0, 0.0, 1.0, 0.0]));
    let mut lstm = Lstm::new(2, 1, cfg);
    let x = Tensor::from_f64_slice(&[0.3, -0.7], (1, 2), DType::F64)?;
    lstm.init(x.shape())?;

    let g = 1f64.tanh();
    let c1 = 0.5 * g;
    let h1 = 0.5 * c1.tanh();
    assert_close(&lstm.forward(&x)?.to_f64_vec()?, &[h1], 1e-12);

    let c2 = 0.5 * c1 + 0.5 * g;
    let h2 = 0.5 * c2.tanh();
    assert_close(&lstm.forward(&x)?.to_f64_vec()?, &[h2], 1e-12);
    let (h, c) = lstm.state();
    assert_close(&h.to_f64_vec()?, &[h2], 1e-12);
    assert_close(&c.to_f64_vec()?, &[c2], 1e-12);

    lstm.reset_state()?;
    assert_close(&lstm.forward(&x)?.to_f64_vec()?, &[h1], 1e-12);
    Ok(())
}

// Reshape layers

#[test]
fn test_reshape_layers_route_gradients_back() -> tessel::Result<()> {
    // [N, L] -> [N, 1, L] -> conv -> [N, 2, L] -> [N, L, 2] -> [N, 2L] -> dense
    let mut model = Model::new()
        .add(Unsqueeze::new(1, f64_config()))
        .add(Conv1d::new(1, 2, 3, 1, 1, f64_config()))
        .add(Transpose::dims(1, 2, f64_config()))
        .add(Flatten::new(f64_config()))
        .add(Dense::new(8, 1, f64_config()));
    let x = Tensor::from_f64_slice(
        &[1.0, -1.0, 2.0, 0.5, 0.0, 3.0, -2.0, 1.0],
        (2, 4),
        DType::F64,
    )?;
    model.init(x.shape())?;
    assert_eq!(model.forward(&x)?.dims(), &[2, 1]);
    let dx = model.backward(&Tensor::ones((2, 1), DType::F64))?;
    assert_eq!(dx.dims(), &[2, 4]);
    assert!(dx.to_f64_vec()?.iter().all(|v| v.is_finite()));

    let mut squeeze = Squeeze::dims(&[1], f64_config());
    let col = Tensor::from_f64_slice(&[1.0, 2.0, 3.0], (3, 1), DType::F64)?;
    squeeze.init(col.shape())?;
    assert_eq!(squeeze.forward(&col)?.dims(), &[3]);
    let back = squeeze.backward(&vector(&[4.0, 5.0, 6.0]))?;
    assert_eq!(back.dims(), &[3, 1]);
    assert_eq!(back.to_f64_vec()?, vec![4.0, 5.0, 6.0]);
    Ok(())
}

// Model

#[test]
fn test_model_matches_manual_chain() -> tessel::Result<()> {
    let w1 = Tensor::from_f64_slice(&[0.5, -1.0, 1.5, 2.0, 0.0, -0.5], (2, 3), DType::F64)?;
    let w2 = Tensor::from_f64_slice(&[1.0, -2.0, 0.5], (3, 1), DType::F64)?;
    let dense1 = || {
        Dense::new(
            2,
            3,
            f64_config()
                .bias(false)
                .with_parameter(ParamKind::Weights, w1.clone()),
        )
    };
    let dense2 = || {
        Dense::new(
            3,
            1,
            f64_config()
                .bias(false)
                .with_parameter(ParamKind::Weights, w2.clone()),
        )
    };

    let mut model = Model::named("mlp")
        .add(dense1())
        .add(Relu::new(f64_config()))
        .add(dense2());
    let x = Tensor::from_f64_slice(&[1.0, 2.0, -1.0, 0.5], (2, 2), DType::F64)?;
    model.init(x.shape())?;
    let y = model.forward(&x)?.to_f64_vec()?;

    let (mut a, mut r, mut b) = (dense1(), Relu::new(f64_config()), dense2());
    a.init(x.shape())?;
    let h = a.forward(&x)?.clone();
    r.init(h.shape())?;
    let h = r.forward(&h)?.clone();
    b.init(h.shape())?;
    let expected = b.forward(&h)?.to_f64_vec()?;
    assert_close(&y, &expected, 1e-12);

    assert_eq!(model.len(), 3);
    assert_eq!(model.named_parameters().len(), 2);
    Ok(())
}

#[test]
fn test_gradient_step_reduces_mse() -> tessel::Result<()> {
    let mut model = Model::new()
        .add(Dense::new(2, 4, f64_config().seed(5)))
        .add(Tanh::new(f64_config()))
        .add(Dense::new(4, 1, f64_config().seed(6)));
    let x = Tensor::from_f64_slice(&[0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.5, -0.5], (4, 2), DType::F64)?;
    let target = Tensor::from_f64_slice(&[1.0, -1.0, 0.5, 0.0], (4, 1), DType::F64)?;
    model.init(x.shape())?;
    let mut mse = Mse::new();

    let mut losses = Vec::new();
    for _ in 0..5 {
        let pred = model.forward(&x)?.clone();
        losses.push(mse.compute(&pred, &target)?);
        let grad = mse.gradient(&pred, &target)?.clone();
        model.backward(&grad)?;
        for i in 0..model.len() {
            let Some(layer) = model.layer_mut(i) else {
                continue;
            };
            for kind in [ParamKind::Weights, ParamKind::Biases] {
                let Some(p) = layer.parameter_mut(kind) else {
                    continue;
                };
                let mut step = p.data().clone();
                p.grad().unwrap().affine_to(-0.05, 0.0, &mut step)?;
                p.data_mut().add_assign(&step)?;
            }
        }
    }
    assert!(
        losses.windows(2).all(|w| w[1] < w[0]),
        "loss did not decrease: {losses:?}"
    );
    Ok(())
}

// Conversion

#[test]
fn test_parallel_copy_equals_serial() -> tessel::Result<()> {
    let data: Vec<f64> = (0..5000).map(|i| (i as f64 - 2500.0) * 17.3).collect();
    let x = Tensor::from_f64_slice(&data, (100, 50), DType::F64)?;
    let pool = ConvertPool::new(
        ParallelConfig::default()
            .with_max_threads(4)
            .with_min_chunk(64),
    )?;

    for dtype in [DType::I8, DType::I16, DType::F32, DType::I48] {
        let mut parallel = Tensor::zeros((100, 50), dtype);
        x.copy_to_parallel(&mut parallel, &pool)?;
        let serial = x.to_dtype(dtype)?;
        assert_eq!(parallel.to_f64_vec()?, serial.to_f64_vec()?, "{dtype}");
    }

    let mut narrow = Tensor::zeros((100, 50), DType::I16);
    x.copy_to_parallel(&mut narrow, &pool)?;
    let v = narrow.to_f64_vec()?;
    assert_eq!(v[0], -32768.0);
    assert_eq!(v[4999], 32767.0);
    Ok(())
}

#[test]
fn test_integer_copies_keep_every_bit() -> tessel::Result<()> {
    let data: Vec<i64> = (0..4096).map(|i| i64::MAX - 2 * i).collect();
    let x = Tensor::from_slice(&data, 4096)?;
    let pool = ConvertPool::new(
        ParallelConfig::default()
            .with_max_threads(4)
            .with_min_chunk(256),
    )?;
    assert_eq!(x.to_dtype(DType::I64)?.to_vec::<i64>()?, data);
    assert_eq!(x.to_dtype_parallel(DType::I64, &pool)?.to_vec::<i64>()?, data);
    assert_eq!(x.clone().to_vec::<i64>()?, data);
    Ok(())
}

#[test]
fn test_narrowing_saturates() -> tessel::Result<()> {
    let x = vector(&[300.0, -300.0, 1e18, -1e18, 2.9]);
    assert_eq!(
        x.to_dtype(DType::I8)?.to_f64_vec()?,
        vec![127.0, -128.0, 127.0, -128.0, 2.0]
    );
    let i48 = x.to_dtype(DType::I48)?.to_f64_vec()?;
    assert_eq!(i48[2], ((1i64 << 47) - 1) as f64);
    assert_eq!(i48[3], (-(1i64 << 47)) as f64);
    Ok(())
}
