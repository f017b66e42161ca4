//! Configuration of a complete pretrain-then-adapt run.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::adapters::adapted::MergeMode;
use crate::adapters::lora::LoraConfig;
use crate::builder::LayerRole;
use crate::error::{LoraError, Result};
use crate::model::{MlpConfig, NUM_DENSE_LAYERS};
use crate::traits::AdapterConfig;
use crate::training::TrainingConfig;

/// Everything needed to reproduce a run: seed, architecture, both training
/// phases, and how the base model is adapted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Seed for the run's random number generator.
    pub seed: u64,
    /// Perceptron layer sizes.
    pub model: MlpConfig,
    /// Training of the base model.
    pub pretrain: TrainingConfig,
    /// Training of the adapted model.
    pub finetune: TrainingConfig,
    /// Correction applied to every adapted layer.
    pub lora: LoraConfig,
    /// Forward variant of adapted layers.
    pub merge_mode: MergeMode,
    /// Indices of the dense layers to adapt; `None` adapts all of them.
    pub adapt_layers: Option<Vec<usize>>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 123,
            model: MlpConfig::default(),
            pretrain: TrainingConfig::default(),
            finetune: TrainingConfig {
                learning_rate: 0.003,
                ..TrainingConfig::default()
            },
            lora: LoraConfig::default(),
            merge_mode: MergeMode::Merged,
            adapt_layers: None,
        }
    }
}

impl ExperimentConfig {
    /// Read a JSON configuration; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the
    /// configuration is invalid.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| LoraError::Io(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| LoraError::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.pretrain.validate()?;
        self.finetune.validate()?;
        self.lora.validate()?;
        if let Some(indices) = &self.adapt_layers {
            if let Some(&index) = indices.iter().find(|&&i| i >= NUM_DENSE_LAYERS) {
                return Err(LoraError::LayerIndex {
                    index,
                    len: NUM_DENSE_LAYERS,
                });
            }
        }
        Ok(())
    }

    /// Per-layer roles for the three dense layers of the perceptron.
    #[must_use]
    pub fn layer_roles(&self) -> Vec<LayerRole> {
        let adapted = LayerRole::Adapted {
            lora: self.lora.clone(),
            mode: self.merge_mode,
        };
        (0..NUM_DENSE_LAYERS)
            .map(|i| match &self.adapt_layers {
                Some(indices) if !indices.contains(&i) => LayerRole::Plain,
                _ => adapted.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = ExperimentConfig::default();
        assert_eq!(config.seed, 123);
        assert_eq!(config.pretrain.epochs, 10);
        assert!((config.pretrain.learning_rate - 0.03).abs() < 1e-12);
        assert!((config.finetune.learning_rate - 0.003).abs() < 1e-12);
        assert_eq!(config.lora, LoraConfig { r: 4, alpha: 8.0 });
        assert_eq!(config.merge_mode, MergeMode::Merged);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"seed": 7, "lora": {"r": 2, "alpha": 4.0}, "adapt_layers": [0, 2]}"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.model, MlpConfig::default());
        assert_eq!(config.lora.r, 2);

        let roles = config.layer_roles();
        assert!(matches!(roles[0], LayerRole::Adapted { .. }));
        assert_eq!(roles[1], LayerRole::Plain);
        assert!(matches!(roles[2], LayerRole::Adapted { .. }));
    }

    #[test]
    fn test_invalid_layer_index() {
        let config = ExperimentConfig {
            adapt_layers: Some(vec![3]),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LoraError::LayerIndex { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            ExperimentConfig::from_json_file("/nonexistent/lora.json"),
            Err(LoraError::Io(_))
        ));
    }
}
