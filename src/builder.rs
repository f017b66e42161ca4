//! Building an adapted model from a trained base model.
//!
//! The adapted model is constructed fresh: every dense weight is copied into
//! new storage and wrapped according to an explicit per-layer role, so
//! training the adapted model can never move the base model's weights.

use candle_core::Device;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::adapted::{AdaptedLinear, MergeMode};
use crate::adapters::lora::LoraConfig;
use crate::error::{LoraError, Result};
use crate::model::{DenseLayer, MultilayerPerceptron};

/// What a dense slot becomes in the adapted model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum LayerRole {
    /// Copied as a plain dense layer.
    #[default]
    Plain,
    /// Copied and wrapped with a fresh low-rank correction.
    Adapted {
        /// Rank and scale of the correction.
        lora: LoraConfig,
        /// Forward variant.
        #[serde(default)]
        mode: MergeMode,
    },
}

/// Builder for a LoRA-adapted copy of a [`MultilayerPerceptron`].
///
/// # Example
///
/// ```rust,ignore
/// let adapted = AdaptedModelBuilder::new(&base)
///     .adapt_all(LoraConfig { r: 4, alpha: 8.0 }, MergeMode::Merged)
///     .build(&mut rng, &device)?;
/// ```
#[derive(Debug, Clone)]
pub struct AdaptedModelBuilder<'a> {
    base: &'a MultilayerPerceptron,
    roles: Vec<LayerRole>,
}

impl<'a> AdaptedModelBuilder<'a> {
    /// Start from `base` with every dense slot plain.
    #[must_use]
    pub fn new(base: &'a MultilayerPerceptron) -> Self {
        Self {
            base,
            roles: vec![LayerRole::Plain; base.dense_layers().len()],
        }
    }

    /// Set the role of dense slot `index` (0 is the input layer).
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::LayerIndex`] if there is no such slot.
    pub fn role(mut self, index: usize, role: LayerRole) -> Result<Self> {
        let len = self.roles.len();
        let slot = self
            .roles
            .get_mut(index)
            .ok_or(LoraError::LayerIndex { index, len })?;
        *slot = role;
        Ok(self)
    }

    /// Set every role at once.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::LayerIndex`] if `roles` does not have one entry
    /// per dense slot.
    pub fn roles(mut self, roles: Vec<LayerRole>) -> Result<Self> {
        if roles.len() != self.roles.len() {
            return Err(LoraError::LayerIndex {
                index: roles.len(),
                len: self.roles.len(),
            });
        }
        self.roles = roles;
        Ok(self)
    }

    /// Adapt every dense slot with the same configuration.
    #[must_use]
    pub fn adapt_all(mut self, lora: LoraConfig, mode: MergeMode) -> Self {
        for slot in &mut self.roles {
            *slot = LayerRole::Adapted {
                lora: lora.clone(),
                mode,
            };
        }
        self
    }

    /// Build the adapted model.
    ///
    /// Slots of the base model that are themselves adapted contribute only
    /// their base map.
    ///
    /// # Errors
    ///
    /// Returns an error if a rank is invalid for its layer.
    pub fn build<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        device: &Device,
    ) -> Result<MultilayerPerceptron> {
        let dense = self
            .base
            .dense_layers()
            .iter()
            .zip(&self.roles)
            .enumerate()
            .map(|(index, (slot, role))| {
                let linear = slot.linear().deep_clone()?;
                match role {
                    LayerRole::Plain => {
                        debug!(index, "copied plain layer");
                        Ok(DenseLayer::Plain(linear))
                    }
                    LayerRole::Adapted { lora, mode } => {
                        debug!(index, rank = lora.r, alpha = lora.alpha, ?mode, "adapted layer");
                        AdaptedLinear::new(linear, lora.clone(), *mode, rng, device)
                            .map(DenseLayer::Adapted)
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;
        MultilayerPerceptron::from_layers(dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init;
    use crate::model::MlpConfig;
    use crate::traits::{Layer, LayerKind};
    use candle_core::Tensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn base(rng: &mut StdRng) -> MultilayerPerceptron {
        let config = MlpConfig {
            num_features: 12,
            num_hidden_1: 8,
            num_hidden_2: 6,
            num_classes: 4,
        };
        MultilayerPerceptron::new(&config, rng, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_adapt_all_preserves_function_at_init() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(0);
        let base = base(&mut rng);
        let adapted = AdaptedModelBuilder::new(&base)
            .adapt_all(LoraConfig { r: 2, alpha: 8.0 }, MergeMode::Merged)
            .build(&mut rng, &device)?;

        assert!(adapted
            .dense_layers()
            .iter()
            .all(|slot| slot.as_adapted().is_some()));

        let x = init::randn((5, 12), 1.0, &mut rng, &device)?;
        let y_base = base.forward(&x)?;
        let y_adapted = adapted.forward(&x)?;
        assert_eq!(y_base.to_vec2::<f32>()?, y_adapted.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_mixed_roles() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let base = base(&mut rng);
        let adapted = AdaptedModelBuilder::new(&base)
            .role(
                1,
                LayerRole::Adapted {
                    lora: LoraConfig { r: 3, alpha: 1.0 },
                    mode: MergeMode::Unmerged,
                },
            )?
            .build(&mut rng, &Device::Cpu)?;

        let kinds: Vec<LayerKind> = adapted.dense_layers().iter().map(Layer::kind).collect();
        assert_eq!(
            kinds,
            vec![
                LayerKind::PlainLinear,
                LayerKind::Composite,
                LayerKind::PlainLinear
            ]
        );
        let slot = adapted.dense_layers()[1].as_adapted().unwrap();
        assert_eq!(slot.lora().rank(), 3);
        assert_eq!(slot.mode(), MergeMode::Unmerged);
        Ok(())
    }

    #[test]
    fn test_role_out_of_range() {
        let mut rng = StdRng::seed_from_u64(2);
        let base = base(&mut rng);
        let result = AdaptedModelBuilder::new(&base).role(3, LayerRole::Plain);
        assert!(matches!(
            result,
            Err(LoraError::LayerIndex { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_invalid_rank_fails_build() {
        let mut rng = StdRng::seed_from_u64(3);
        let base = base(&mut rng);
        // last layer is 6 -> 4, so rank 5 is too large
        let result = AdaptedModelBuilder::new(&base)
            .adapt_all(LoraConfig { r: 5, alpha: 1.0 }, MergeMode::Merged)
            .build(&mut rng, &Device::Cpu);
        assert!(matches!(
            result,
            Err(LoraError::InvalidRank { rank: 5, max: 4 })
        ));
    }

    #[test]
    fn test_copies_do_not_alias_base() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(4);
        let base = base(&mut rng);
        let adapted = AdaptedModelBuilder::new(&base).build(&mut rng, &device)?;

        let base_weight = base.dense_layers()[0].linear().weight();
        let copy = adapted.dense_layers()[0].linear();
        let original: Vec<Vec<f32>> = base_weight.to_vec2()?;

        let zeros = Tensor::zeros((8, 12), candle_core::DType::F32, &device)?;
        copy.parameters()[0].set(&zeros)?;

        assert_eq!(base.dense_layers()[0].linear().weight().to_vec2::<f32>()?, original);
        Ok(())
    }

    #[test]
    fn test_role_serde() {
        let role = LayerRole::Adapted {
            lora: LoraConfig { r: 4, alpha: 8.0 },
            mode: MergeMode::Merged,
        };
        let json = serde_json::to_string(&role).unwrap();
        assert_eq!(
            json,
            r#"{"role":"adapted","lora":{"r":4,"alpha":8.0},"mode":"merged"}"#
        );
        let back: LayerRole = serde_json::from_str(&json).unwrap();
        assert_eq!(back, role);
    }
}
