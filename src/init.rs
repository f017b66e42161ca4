//! Seeded tensor initialisation.
//!
//! candle's own `Tensor::randn` draws from a device-global generator that
//! cannot be seeded on CPU, so every random tensor in this crate is sampled
//! from a caller-owned [`Rng`] instead.

// f64 -> f32 narrowing of sampled values is intended
#![allow(clippy::cast_possible_truncation)]

use candle_core::{Device, Shape, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::{LoraError, Result};

/// Sample an `f32` tensor from `N(0, std²)`.
///
/// # Errors
///
/// Returns an error if `std` is negative or not finite.
pub fn randn<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    std: f64,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    if !(std.is_finite() && std >= 0.0) {
        return Err(LoraError::InvalidConfig(format!(
            "normal std must be non-negative and finite, got {std}"
        )));
    }
    let normal = Normal::new(0.0, std)
        .map_err(|e| LoraError::InvalidConfig(format!("normal std {std}: {e}")))?;
    sample(shape.into(), &normal, rng, device)
}

/// Sample an `f32` tensor from `U(-bound, bound)`.
///
/// # Errors
///
/// Returns an error if `bound` is not strictly positive and finite.
pub fn uniform<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    bound: f64,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    if !(bound.is_finite() && bound > 0.0) {
        return Err(LoraError::InvalidConfig(format!(
            "uniform bound must be positive and finite, got {bound}"
        )));
    }
    let dist = Uniform::new_inclusive(-bound, bound);
    sample(shape.into(), &dist, rng, device)
}

fn sample<R, D>(shape: Shape, dist: &D, rng: &mut R, device: &Device) -> Result<Tensor>
where
    R: Rng + ?Sized,
    D: Distribution<f64>,
{
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| dist.sample(rng) as f32)
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_randn_is_reproducible() -> Result<()> {
        let device = Device::Cpu;
        let a = randn((4, 5), 1.0, &mut StdRng::seed_from_u64(7), &device)?;
        let b = randn((4, 5), 1.0, &mut StdRng::seed_from_u64(7), &device)?;
        assert_eq!(a.dims(), &[4, 5]);
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_uniform_respects_bound() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let t = uniform(1000, 0.25, &mut rng, &Device::Cpu)?;
        let max: f32 = t.abs()?.max(0)?.to_scalar()?;
        assert!(max <= 0.25);
        Ok(())
    }

    #[test]
    fn test_invalid_parameters() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(randn(3, -1.0, &mut rng, &Device::Cpu).is_err());
        assert!(randn(3, f64::NAN, &mut rng, &Device::Cpu).is_err());
        assert!(randn(3, 0.0, &mut rng, &Device::Cpu).is_ok());
        assert!(uniform(3, 0.0, &mut rng, &Device::Cpu).is_err());
    }
}
