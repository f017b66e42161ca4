//! Plain dense layer.

// usize -> f64 for fan-in based init bounds
#![allow(clippy::cast_precision_loss)]

use candle_core::{Device, Module, Tensor};
use candle_nn::Linear;
use rand::Rng;

use crate::error::{LoraError, Result};
use crate::init;
use crate::param::Parameter;
use crate::shape::{check_shape, map_rows};
use crate::traits::{Layer, LayerKind, Trainable};

/// Dense layer computing `y = x @ Wᵀ + b`.
///
/// The weight has shape `(out_features, in_features)`, the optional bias has
/// length `out_features`. Shapes are fixed at construction.
#[derive(Debug, Clone)]
pub struct LinearMap {
    weight: Parameter,
    bias: Option<Parameter>,
    in_features: usize,
    out_features: usize,
}

impl LinearMap {
    /// Build a layer from explicit weight and bias tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight is not 2-D or the bias length does not
    /// match the weight's output dimension.
    pub fn from_tensors(weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        let (out_features, in_features) = match *weight.dims() {
            [out, inp] => (out, inp),
            _ => {
                return Err(LoraError::DimensionMismatch {
                    message: format!("linear weight must be 2-D, got {:?}", weight.dims()),
                })
            }
        };
        let bias = bias
            .map(|b| {
                check_shape(b, &[out_features])?;
                Parameter::new("bias", b)
            })
            .transpose()?;

        Ok(Self {
            weight: Parameter::new("weight", weight)?,
            bias,
            in_features,
            out_features,
        })
    }

    /// Create a layer with weight and bias drawn from
    /// `U(-1/√in, 1/√in)`.
    ///
    /// # Errors
    ///
    /// Returns an error if either dimension is zero.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(LoraError::InvalidConfig(format!(
                "linear dimensions must be > 0, got {in_features} -> {out_features}"
            )));
        }
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = init::uniform((out_features, in_features), bound, rng, device)?;
        let bias = init::uniform(out_features, bound, rng, device)?;
        Self::from_tensors(&weight, Some(&bias))
    }

    /// Copy with independent parameter storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be allocated.
    pub fn deep_clone(&self) -> Result<Self> {
        Ok(Self {
            weight: self.weight.deep_clone()?,
            bias: self.bias.as_ref().map(Parameter::deep_clone).transpose()?,
            in_features: self.in_features,
            out_features: self.out_features,
        })
    }

    /// Weight tensor of shape `(out_features, in_features)`.
    #[must_use]
    pub fn weight(&self) -> Tensor {
        self.weight.tensor()
    }

    /// Bias tensor of length `out_features`, if any.
    #[must_use]
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.as_ref().map(Parameter::tensor)
    }

    /// Input dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Apply `weight` (instead of the stored one) together with the stored
    /// bias.
    ///
    /// # Errors
    ///
    /// Returns an error if `weight` is not `(out, in)` or the input's
    /// trailing dimension is not `in_features`.
    pub fn forward_with_weight(&self, xs: &Tensor, weight: &Tensor) -> Result<Tensor> {
        check_shape(weight, &[self.out_features, self.in_features])?;
        let linear = Linear::new(weight.clone(), self.bias());
        map_rows(xs, self.in_features, self.out_features, |x| {
            Ok(linear.forward(x)?)
        })
    }
}

impl Layer for LinearMap {
    fn kind(&self) -> LayerKind {
        LayerKind::PlainLinear
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_with_weight(xs, &self.weight())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight)
            .chain(self.bias.as_mut())
            .collect()
    }
}

impl Trainable for LinearMap {
    fn freeze(&mut self) {
        for p in self.parameters_mut() {
            p.freeze();
        }
    }

    fn unfreeze(&mut self) {
        for p in self.parameters_mut() {
            p.unfreeze();
        }
    }

    fn is_frozen(&self) -> bool {
        self.parameters().iter().all(|p| !p.is_trainable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward_matches_manual() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[1f32, 2., 3.], [0., -1., 1.]], &device)?;
        let bias = Tensor::new(&[0.5f32, -0.5], &device)?;
        let layer = LinearMap::from_tensors(&weight, Some(&bias))?;

        let x = Tensor::new(&[[1f32, 1., 1.]], &device)?;
        let y = layer.forward(&x)?;
        assert_eq!(y.to_vec2::<f32>()?, vec![vec![6.5, -0.5]]);
        Ok(())
    }

    #[test]
    fn test_linear_forward_shapes() -> Result<()> {
        let device = Device::Cpu;
        let layer = LinearMap::new(10, 2, &mut StdRng::seed_from_u64(123), &device)?;

        let batch = Tensor::zeros((4, 10), DType::F32, &device)?;
        assert_eq!(layer.forward(&batch)?.dims(), &[4, 2]);

        let seq = Tensor::zeros((2, 3, 10), DType::F32, &device)?;
        assert_eq!(layer.forward(&seq)?.dims(), &[2, 3, 2]);

        let single = Tensor::zeros(10, DType::F32, &device)?;
        assert_eq!(layer.forward(&single)?.dims(), &[2]);
        Ok(())
    }

    #[test]
    fn test_linear_rejects_wrong_input() -> Result<()> {
        let device = Device::Cpu;
        let layer = LinearMap::new(10, 2, &mut StdRng::seed_from_u64(0), &device)?;
        let x = Tensor::zeros((1, 9), DType::F32, &device)?;
        assert!(matches!(
            layer.forward(&x),
            Err(LoraError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_linear_rejects_bad_bias() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::zeros((2, 3), DType::F32, &device)?;
        let bias = Tensor::zeros(3, DType::F32, &device)?;
        assert!(LinearMap::from_tensors(&weight, Some(&bias)).is_err());
        Ok(())
    }

    #[test]
    fn test_linear_freeze() -> Result<()> {
        let mut layer = LinearMap::new(4, 4, &mut StdRng::seed_from_u64(1), &Device::Cpu)?;
        assert!(!layer.is_frozen());
        layer.freeze();
        assert!(layer.is_frozen());
        assert!(layer.parameters().iter().all(|p| !p.is_trainable()));
        layer.unfreeze();
        assert!(!layer.is_frozen());
        Ok(())
    }
}
