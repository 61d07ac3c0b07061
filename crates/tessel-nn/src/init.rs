// Parameter initialization
//
// Layers create their parameters at `init` from a seedable generator, so
// two layers built with the same seed start from identical weights.
//
//   uniform(shape, lo, hi)                  U(lo, hi)
//   xavier_uniform(shape, fan_in, fan_out)  U(-a, a), a = sqrt(6 / (fan_in + fan_out))
//   kaiming_uniform(shape, fan_in)          U(-b, b), b = sqrt(6 / fan_in)
//
// Fans are passed explicitly: a dense layer's weights are stored
// [in, out] while a convolution kernel is [out, in, k...], and only the
// layer knows which axis is which.

use rand::Rng;
use tessel_core::{DType, Result, Shape, Tensor};

pub fn uniform<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    lo: f64,
    hi: f64,
    dtype: DType,
    rng: &mut R,
) -> Result<Tensor> {
    if lo.partial_cmp(&hi) != Some(std::cmp::Ordering::Less) {
        tessel_core::bail!("uniform init: empty range [{lo}, {hi})");
    }
    Ok(Tensor::rand_uniform(shape, dtype, lo, hi, rng))
}

/// Glorot uniform. Used for dense, convolution and recurrent weights.
pub fn xavier_uniform<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    fan_in: usize,
    fan_out: usize,
    dtype: DType,
    rng: &mut R,
) -> Result<Tensor> {
    let a = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    uniform(shape, -a, a, dtype, rng)
}

/// He uniform, for weights feeding a ReLU.
pub fn kaiming_uniform<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    fan_in: usize,
    dtype: DType,
    rng: &mut R,
) -> Result<Tensor> {
    let b = (6.0 / fan_in.max(1) as f64).sqrt();
    uniform(shape, -b, b, dtype, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn xavier_bounds_and_determinism() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let w = xavier_uniform((30, 20), 30, 20, DType::F64, &mut rng)?;
        let a = (6.0f64 / 50.0).sqrt();
        assert!(w.to_vec::<f64>()?.iter().all(|v| v.abs() <= a));

        let mut rng = StdRng::seed_from_u64(11);
        let again = xavier_uniform((30, 20), 30, 20, DType::F64, &mut rng)?;
        assert_eq!(w.to_vec::<f64>()?, again.to_vec::<f64>()?);
        Ok(())
    }

    #[test]
    fn empty_range_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(uniform(3, 1.0, 1.0, DType::F32, &mut rng).is_err());
    }
}
