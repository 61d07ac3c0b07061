// Dropout — Regularization via random zeroing
//
// In training mode every element is zeroed with probability p and the
// survivors are scaled by 1/(1-p), so the expected activation is unchanged.
// The mask (0 or 1/(1-p) per element) is kept from forward and backward
// multiplies the incoming gradient by the very same mask.
//
// In inference mode, or with p = 0, the layer is the identity both ways.
// Layers start in inference mode; call `set_training(true)` to enable.
//
// The generator is owned by the layer. It is either a seeded `StdRng`, which
// makes the mask sequence reproducible, or any `RngCore` the caller hands to
// `Dropout::with_rng`.

use std::fmt;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tessel_core::{Result, Shape, Tensor};

use crate::layer::{Layer, LayerBase, LayerConfig, LayerKind, LayerState};

/// Rate used when the configured one is outside `[0, 1)`.
pub const DEFAULT_DROPOUT_RATE: f64 = 0.5;

/// Dropout-specific options.
#[derive(Debug, Clone, PartialEq)]
pub struct DropoutConfig {
    /// Probability of zeroing an element, in `[0, 1)`.
    pub rate: f64,
    /// Start in training mode.
    pub training: bool,
    /// Seed for the mask generator. Falls back to the layer seed, then to
    /// entropy.
    pub seed: Option<u64>,
}

impl Default for DropoutConfig {
    fn default() -> Self {
        DropoutConfig {
            rate: DEFAULT_DROPOUT_RATE,
            training: false,
            seed: None,
        }
    }
}

impl DropoutConfig {
    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validated(mut self) -> Self {
        if !(0.0..1.0).contains(&self.rate) {
            tracing::warn!(
                rate = self.rate,
                default = DEFAULT_DROPOUT_RATE,
                "dropout rate outside [0, 1), using default"
            );
            self.rate = DEFAULT_DROPOUT_RATE;
        }
        self
    }
}

/// Inverted dropout.
pub struct Dropout {
    base: LayerBase,
    rate: f64,
    training: bool,
    rng: Box<dyn RngCore + Send>,
    mask: Tensor,
    masked: bool,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("base", &self.base)
            .field("rate", &self.rate)
            .field("training", &self.training)
            .field("masked", &self.masked)
            .finish_non_exhaustive()
    }
}

impl Dropout {
    /// Dropout drawing its masks from a `StdRng` seeded by `dropout.seed`,
    /// then `config.seed`, then entropy.
    pub fn new(dropout: DropoutConfig, config: LayerConfig) -> Self {
        let rng = match dropout.seed.or(config.seed) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(dropout, config, rng)
    }

    /// Dropout drawing its masks from `rng`. `dropout.seed` is ignored.
    pub fn with_rng(
        dropout: DropoutConfig,
        config: LayerConfig,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        let dropout = dropout.validated();
        let rng: Box<dyn RngCore + Send> = Box::new(rng);
        let base = LayerBase::new(LayerKind::Dropout, config);
        let mask = Tensor::empty(base.dtype());
        Dropout {
            base,
            rate: dropout.rate,
            training: dropout.training,
            rng,
            mask,
            masked: false,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// The mask applied by the last training-mode forward pass.
    pub fn mask(&self) -> Option<&Tensor> {
        self.masked.then_some(&self.mask)
    }

    fn compute_forward(&mut self, input: &Tensor) -> Result<()> {
        self.masked = self.training && self.rate > 0.0;
        if self.masked {
            self.mask.fill_dropout_mask(self.rate, &mut *self.rng)?;
            input.mul_to(&self.mask, &mut self.base.output)
        } else {
            input.copy_to(&mut self.base.output)
        }
    }
}

impl Layer for Dropout {
    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.base.validate_input(input, &[])?;
        Ok(input.clone())
    }

    fn init(&mut self, input: &Shape) -> Result<()> {
        self.base.validate_input(input, &[])?;
        self.mask = Tensor::zeros(input, self.base.dtype());
        self.masked = false;
        self.base.finish_init(input, input.clone());
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        self.base.begin_forward(input)?;
        self.compute_forward(input)
            .map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::ForwardComplete);
        Ok(&self.base.output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<&Tensor> {
        self.base.begin_backward(grad_output)?;
        let res = if self.masked {
            grad_output.mul_to(&self.mask, &mut self.base.grad_input)
        } else {
            grad_output.copy_to(&mut self.base.grad_input)
        };
        res.map_err(|e| self.base.context(e))?;
        self.base.set_state(LayerState::BackwardComplete);
        Ok(&self.base.grad_input)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::DType;

    #[test]
    fn invalid_rate_corrected() {
        for bad in [1.0, -0.1, 3.0, f64::NAN] {
            let d = Dropout::new(DropoutConfig::default().rate(bad), LayerConfig::default());
            assert_eq!(d.rate(), DEFAULT_DROPOUT_RATE);
        }
        let d = Dropout::new(DropoutConfig::default().rate(0.2), LayerConfig::default());
        assert_eq!(d.rate(), 0.2);
        assert!(!d.is_training());
    }

    #[test]
    fn inference_mode_is_identity() -> Result<()> {
        let mut d = Dropout::new(DropoutConfig::default().rate(0.9), LayerConfig::default());
        let x = Tensor::from_slice(&[1.0f32, 2.0, 3.0], 3)?;
        d.init(x.shape())?;
        assert_eq!(d.forward(&x)?.to_vec::<f32>()?, vec![1.0, 2.0, 3.0]);
        assert!(d.mask().is_none());
        Ok(())
    }

    #[test]
    fn caller_supplied_rng_drives_the_mask() -> Result<()> {
        use rand::rngs::mock::StepRng;
        // draws alternate 0.0, 0.5, 0.0, ... as f64 in [0, 1)
        let rng = StepRng::new(0, 1 << 63);
        let mut d = Dropout::with_rng(
            DropoutConfig::default().rate(0.5).training(true),
            LayerConfig::default().dtype(DType::F64),
            rng,
        );
        let x = Tensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], 4, DType::F64)?;
        d.init(x.shape())?;
        assert_eq!(d.forward(&x)?.to_f64_vec()?, vec![0.0, 4.0, 0.0, 8.0]);
        let mask = d.mask().map(|m| m.to_f64_vec()).transpose()?;
        assert_eq!(mask, Some(vec![0.0, 2.0, 0.0, 2.0]));
        let g = Tensor::ones(4, DType::F64);
        assert_eq!(d.backward(&g)?.to_f64_vec()?, vec![0.0, 2.0, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn same_seed_same_mask() -> Result<()> {
        let make = || {
            Dropout::new(
                DropoutConfig::default().rate(0.5).training(true).seed(42),
                LayerConfig::default().dtype(DType::F64),
            )
        };
        let x = Tensor::ones(32, DType::F64);
        let (mut a, mut b) = (make(), make());
        a.init(x.shape())?;
        b.init(x.shape())?;
        let ya = a.forward(&x)?.to_f64_vec()?;
        let yb = b.forward(&x)?.to_f64_vec()?;
        assert_eq!(ya, yb);
        let ga = a.backward(&x)?.to_f64_vec()?;
        assert_eq!(ga, ya);
        Ok(())
    }
}
