//! Dense layer wrapped with a low-rank correction.

use candle_core::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adapters::lora::{LoraConfig, LowRankCorrection};
use crate::error::{LoraError, Result};
use crate::linear::LinearMap;
use crate::traits::{Layer, LayerKind, Mergeable};

/// How an [`AdaptedLinear`] combines its base map with the correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// `y = linear(x) + correction(x)`: two products per call.
    #[default]
    Unmerged,
    /// `y = x @ (W + α·(A@B)ᵀ)ᵀ + b`: the combined weight is rebuilt on
    /// every call so it tracks `A` and `B` while they are still training.
    Merged,
}

/// A [`LinearMap`] plus a [`LowRankCorrection`] of matching dimensions.
///
/// Both forward variants are numerically equivalent up to rounding.
#[derive(Debug, Clone)]
pub struct AdaptedLinear {
    linear: LinearMap,
    lora: LowRankCorrection,
    mode: MergeMode,
}

impl AdaptedLinear {
    /// Wrap `linear` with a freshly initialised correction.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidRank`] unless
    /// `1 <= r <= min(in_features, out_features)`.
    pub fn new<R: Rng + ?Sized>(
        linear: LinearMap,
        config: LoraConfig,
        mode: MergeMode,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let lora = LowRankCorrection::new(
            linear.in_features(),
            linear.out_features(),
            config,
            rng,
            device,
        )?;
        Ok(Self { linear, lora, mode })
    }

    /// Combine an existing map and correction.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::ShapeMismatch`] if their dimensions disagree.
    pub fn from_parts(linear: LinearMap, lora: LowRankCorrection, mode: MergeMode) -> Result<Self> {
        let expected = (linear.in_features(), linear.out_features());
        if (lora.in_features(), lora.out_features()) != expected {
            return Err(LoraError::ShapeMismatch {
                expected: vec![linear.in_features(), linear.out_features()],
                actual: vec![lora.in_features(), lora.out_features()],
            });
        }
        Ok(Self { linear, lora, mode })
    }

    /// The wrapped base map.
    #[must_use]
    pub fn linear(&self) -> &LinearMap {
        &self.linear
    }

    /// Mutable access to the wrapped base map.
    pub fn linear_mut(&mut self) -> &mut LinearMap {
        &mut self.linear
    }

    /// The correction term.
    #[must_use]
    pub fn lora(&self) -> &LowRankCorrection {
        &self.lora
    }

    /// Mutable access to the correction term.
    pub fn lora_mut(&mut self) -> &mut LowRankCorrection {
        &mut self.lora
    }

    /// Current forward variant.
    #[must_use]
    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Switch the forward variant.
    pub fn set_mode(&mut self, mode: MergeMode) {
        self.mode = mode;
    }

    /// `W + α·(A@B)ᵀ`, shape `(out_features, in_features)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix product fails.
    pub fn merged_weight(&self) -> Result<Tensor> {
        self.lora.merge(&self.linear.weight())
    }

    /// Fold the correction into the base weight once and drop `A` and `B`.
    ///
    /// The result is a plain, trainable [`LinearMap`] computing the same
    /// function as `self`.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged weight cannot be built.
    pub fn into_merged_linear(self) -> Result<LinearMap> {
        let weight = self.merged_weight()?;
        LinearMap::from_tensors(&weight, self.linear.bias().as_ref())
    }
}

impl Layer for AdaptedLinear {
    fn kind(&self) -> LayerKind {
        LayerKind::Composite
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self.mode {
            MergeMode::Unmerged => {
                let base = self.linear.forward(xs)?;
                let delta = self.lora.forward(xs)?;
                Ok(base.add(&delta)?)
            }
            MergeMode::Merged => self
                .linear
                .forward_with_weight(xs, &self.merged_weight()?),
        }
    }

    fn children(&self) -> Vec<(String, &dyn Layer)> {
        vec![
            ("linear".to_string(), &self.linear as &dyn Layer),
            ("lora".to_string(), &self.lora as &dyn Layer),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Layer)> {
        vec![
            ("linear".to_string(), &mut self.linear as &mut dyn Layer),
            ("lora".to_string(), &mut self.lora as &mut dyn Layer),
        ]
    }
}
