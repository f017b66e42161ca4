//! Structural parameter freezing and parameter walks over a layer tree.
//!
//! Freezing decides purely on [`LayerKind`]: parameters owned directly by a
//! [`LayerKind::PlainLinear`] node are frozen, [`LayerKind::Composite`] nodes
//! are descended depth-first, and [`LayerKind::LowRankCorrection`] nodes are
//! left untouched. Names and positions play no part.

use candle_core::Var;
use tracing::debug;

use crate::param::Parameter;
use crate::traits::{Layer, LayerKind};

/// Freeze every parameter owned by a plain dense layer anywhere under
/// `layer`, leaving low-rank correction factors trainable.
///
/// Returns how many parameters were newly frozen. Applying it twice
/// freezes nothing the second time.
pub fn freeze_linear_layers(layer: &mut dyn Layer) -> usize {
    freeze_recursive(layer, "")
}

fn freeze_recursive(layer: &mut dyn Layer, prefix: &str) -> usize {
    match layer.kind() {
        LayerKind::PlainLinear => {
            let mut frozen = 0;
            for p in layer.parameters_mut() {
                if p.is_trainable() {
                    p.freeze();
                    debug!(parameter = %qualify(prefix, p.name()), "froze parameter");
                    frozen += 1;
                }
            }
            frozen
        }
        LayerKind::Composite => layer
            .children_mut()
            .into_iter()
            .map(|(name, child)| freeze_recursive(child, &qualify(prefix, &name)))
            .sum(),
        LayerKind::LowRankCorrection | LayerKind::Activation => 0,
    }
}

/// Mark every parameter under `layer` trainable again.
pub fn unfreeze_all(layer: &mut dyn Layer) {
    for p in layer.parameters_mut() {
        p.unfreeze();
    }
    for (_, child) in layer.children_mut() {
        unfreeze_all(child);
    }
}

/// Visit every parameter under `layer` depth-first with its qualified
/// dotted name (e.g. `2.lora.lora_b`).
pub fn visit_parameters<F>(layer: &dyn Layer, f: &mut F)
where
    F: FnMut(&str, &Parameter),
{
    visit_recursive(layer, "", f);
}

fn visit_recursive<F>(layer: &dyn Layer, prefix: &str, f: &mut F)
where
    F: FnMut(&str, &Parameter),
{
    for p in layer.parameters() {
        f(&qualify(prefix, p.name()), p);
    }
    for (name, child) in layer.children() {
        visit_recursive(child, &qualify(prefix, &name), f);
    }
}

/// `(qualified name, trainable)` for every parameter under `layer`.
#[must_use]
pub fn named_parameters(layer: &dyn Layer) -> Vec<(String, bool)> {
    let mut out = Vec::new();
    visit_parameters(layer, &mut |name: &str, p: &Parameter| {
        out.push((name.to_string(), p.is_trainable()));
    });
    out
}

/// The variables an optimizer should update: those of trainable parameters.
#[must_use]
pub fn trainable_vars(layer: &dyn Layer) -> Vec<Var> {
    let mut out = Vec::new();
    visit_parameters(layer, &mut |_: &str, p: &Parameter| {
        if p.is_trainable() {
            out.push(p.var().clone());
        }
    });
    out
}

/// Number of scalar parameters under `layer`, optionally only the
/// trainable ones.
#[must_use]
pub fn count_parameters(layer: &dyn Layer, trainable_only: bool) -> usize {
    let mut total = 0;
    visit_parameters(layer, &mut |_: &str, p: &Parameter| {
        if !trainable_only || p.is_trainable() {
            total += p.num_elements();
        }
    });
    total
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::adapted::{AdaptedLinear, MergeMode};
    use crate::adapters::lora::LoraConfig;
    use crate::linear::LinearMap;
    use crate::model::{DenseLayer, MlpConfig, MultilayerPerceptron};
    use crate::Result;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> MlpConfig {
        MlpConfig {
            num_features: 12,
            num_hidden_1: 8,
            num_hidden_2: 6,
            num_classes: 4,
        }
    }

    fn adapted_mlp(rng: &mut StdRng) -> Result<MultilayerPerceptron> {
        let device = Device::Cpu;
        let base = MultilayerPerceptron::new(&small_config(), rng, &device)?;
        let dense = base
            .dense_layers()
            .iter()
            .map(|layer| {
                AdaptedLinear::new(
                    layer.linear().clone(),
                    LoraConfig { r: 2, alpha: 4.0 },
                    MergeMode::Merged,
                    rng,
                    &device,
                )
                .map(DenseLayer::Adapted)
            })
            .collect::<Result<Vec<_>>>()?;
        MultilayerPerceptron::from_layers(dense)
    }

    #[test]
    fn test_freeze_only_plain_linear() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = adapted_mlp(&mut rng)?;

        let frozen = freeze_linear_layers(&mut model);
        assert_eq!(frozen, 6); // weight + bias for three layers

        for (name, trainable) in named_parameters(&model) {
            if name.contains(".lora.") {
                assert!(trainable, "{name} should stay trainable");
            } else {
                assert!(!trainable, "{name} should be frozen");
            }
        }
        Ok(())
    }

    #[test]
    fn test_freeze_is_idempotent() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = adapted_mlp(&mut rng)?;
        freeze_linear_layers(&mut model);
        let before = named_parameters(&model);
        assert_eq!(freeze_linear_layers(&mut model), 0);
        assert_eq!(named_parameters(&model), before);
        Ok(())
    }

    #[test]
    fn test_named_parameters_order() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let model = adapted_mlp(&mut rng)?;
        let names: Vec<String> = named_parameters(&model).into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "0.linear.weight",
                "0.linear.bias",
                "0.lora.lora_a",
                "0.lora.lora_b",
                "2.linear.weight",
                "2.linear.bias",
                "2.lora.lora_a",
                "2.lora.lora_b",
                "4.linear.weight",
                "4.linear.bias",
                "4.lora.lora_a",
                "4.lora.lora_b",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_count_parameters() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = adapted_mlp(&mut rng)?;
        let dense = (12 * 8 + 8) + (8 * 6 + 6) + (6 * 4 + 4);
        let lora = 2 * (12 + 8) + 2 * (8 + 6) + 2 * (6 + 4);

        assert_eq!(count_parameters(&model, false), dense + lora);
        assert_eq!(count_parameters(&model, true), dense + lora);

        freeze_linear_layers(&mut model);
        assert_eq!(count_parameters(&model, true), lora);
        assert_eq!(trainable_vars(&model).len(), 6);

        unfreeze_all(&mut model);
        assert_eq!(count_parameters(&model, true), dense + lora);
        Ok(())
    }

    #[test]
    fn test_freeze_plain_model_leaves_nothing_trainable() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let mut model = MultilayerPerceptron::new(&small_config(), &mut rng, &Device::Cpu)?;
        freeze_linear_layers(&mut model);
        assert_eq!(count_parameters(&model, true), 0);
        assert!(trainable_vars(&model).is_empty());
        Ok(())
    }

    #[test]
    fn test_freeze_single_linear() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = LinearMap::new(3, 2, &mut rng, &Device::Cpu)?;
        assert_eq!(freeze_linear_layers(&mut layer), 2);
        Ok(())
    }
}
