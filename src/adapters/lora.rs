//! LoRA (Low-Rank Adaptation) correction term.
//!
//! LoRA reduces the number of trainable parameters by expressing a weight
//! update as a product of two thin matrices: `ΔW = α · (A @ B)ᵀ` where
//! `A ∈ R^{in×r}` and `B ∈ R^{r×out}`.
//!
// usize -> f64 for the init std
#![allow(clippy::cast_precision_loss)]

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LoraError, Result};
use crate::init;
use crate::param::Parameter;
use crate::shape::{check_shape, map_rows};
use crate::traits::{AdapterConfig, Layer, LayerKind, Mergeable, Trainable};

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scale applied to the correction output. Used as-is, not divided by `r`.
    pub alpha: f64,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { r: 4, alpha: 8.0 }
    }
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(LoraError::InvalidConfig("rank must be > 0".into()));
        }
        if !self.alpha.is_finite() {
            return Err(LoraError::InvalidConfig(format!(
                "alpha must be finite, got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

impl LoraConfig {
    /// Validate the rank against the dimensions of the map being adapted.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidRank`] unless `1 <= r <= min(in, out)`.
    pub fn validate_for(&self, in_features: usize, out_features: usize) -> Result<()> {
        let max = in_features.min(out_features);
        if self.r == 0 || self.r > max {
            return Err(LoraError::InvalidRank { rank: self.r, max });
        }
        self.validate()
    }
}

/// Rank-`r` additive correction to a dense map of shape `in → out`.
///
/// Computes `α · (x @ A @ B)`. `A` starts as `N(0, 1/r)` noise and `B` as
/// zeros, so a freshly built correction contributes exactly nothing.
#[derive(Debug, Clone)]
pub struct LowRankCorrection {
    /// Down projection: `(in_features, r)`
    lora_a: Parameter,
    /// Up projection: `(r, out_features)`
    lora_b: Parameter,
    config: LoraConfig,
    in_features: usize,
    out_features: usize,
}

impl LowRankCorrection {
    /// Create a correction with the standard initialisation.
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `config` - LoRA configuration
    /// * `rng` - Random source for `A`
    /// * `device` - Device to create tensors on
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidRank`] unless `1 <= r <= min(in, out)`.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        config: LoraConfig,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        config.validate_for(in_features, out_features)?;

        let std = 1.0 / (config.r as f64).sqrt();
        let a = init::randn((in_features, config.r), std, rng, device)?;
        let b = Tensor::zeros((config.r, out_features), DType::F32, device)?;

        Self::assemble(&a, &b, config, in_features, out_features)
    }

    /// Create a correction from explicit factors `A (in, r)` and `B (r, out)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the factors are not 2-D, their inner dimensions
    /// disagree, or the rank is invalid for their outer dimensions.
    pub fn from_factors(a: &Tensor, b: &Tensor, alpha: f64) -> Result<Self> {
        let (in_features, r) = a.dims2().map_err(|_| LoraError::DimensionMismatch {
            message: format!("lora_a must be 2-D, got {:?}", a.dims()),
        })?;
        let out_features = match *b.dims() {
            [_, out] => out,
            _ => {
                return Err(LoraError::DimensionMismatch {
                    message: format!("lora_b must be 2-D, got {:?}", b.dims()),
                })
            }
        };
        check_shape(b, &[r, out_features])?;
        let config = LoraConfig { r, alpha };
        config.validate_for(in_features, out_features)?;

        Self::assemble(a, b, config, in_features, out_features)
    }

    fn assemble(
        a: &Tensor,
        b: &Tensor,
        config: LoraConfig,
        in_features: usize,
        out_features: usize,
    ) -> Result<Self> {
        Ok(Self {
            lora_a: Parameter::new("lora_a", a)?,
            lora_b: Parameter::new("lora_b", b)?,
            config,
            in_features,
            out_features,
        })
    }

    /// Factor `A`, shape `(in_features, r)`.
    #[must_use]
    pub fn lora_a(&self) -> Tensor {
        self.lora_a.tensor()
    }

    /// Factor `B`, shape `(r, out_features)`.
    #[must_use]
    pub fn lora_b(&self) -> Tensor {
        self.lora_b.tensor()
    }

    /// Get the scale.
    #[must_use]
    pub fn alpha(&self) -> f64 {
        self.config.alpha
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &LoraConfig {
        &self.config
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

    /// Number of trainable parameters, `r · (in + out)`.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.config.r * (self.in_features + self.out_features)
    }

    /// The weight update in the `(out, in)` layout of a dense weight:
    /// `α · (A @ B)ᵀ`.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix product fails.
    pub fn delta_weight(&self) -> Result<Tensor> {
        let ab = self.lora_a().matmul(&self.lora_b())?;
        Ok(ab.affine(self.config.alpha, 0.0)?.t()?)
    }
}

impl Layer for LowRankCorrection {
    fn kind(&self) -> LayerKind {
        LayerKind::LowRankCorrection
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (a, b) = (self.lora_a(), self.lora_b());
        map_rows(xs, self.in_features, self.out_features, |x| {
            let down = x.matmul(&a)?;
            let up = down.matmul(&b)?;
            Ok(up.affine(self.config.alpha, 0.0)?)
        })
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.lora_a, &self.lora_b]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.lora_a, &mut self.lora_b]
    }
}

impl Mergeable for LowRankCorrection {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        check_shape(base_weight, &[self.out_features, self.in_features])?;
        Ok(base_weight.add(&self.delta_weight()?)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        check_shape(merged_weight, &[self.out_features, self.in_features])?;
        Ok(merged_weight.sub(&self.delta_weight()?)?)
    }
}

impl Trainable for LowRankCorrection {
    fn freeze(&mut self) {
        self.lora_a.freeze();
        self.lora_b.freeze();
    }

    fn unfreeze(&mut self) {
        self.lora_a.unfreeze();
        self.lora_b.unfreeze();
    }

    fn is_frozen(&self) -> bool {
        !self.lora_a.is_trainable() && !self.lora_b.is_trainable()
    }
}
