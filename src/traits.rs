//! Core traits for LoRA layers and the module tree they live in.

use candle_core::Tensor;

use crate::param::Parameter;
use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Structural role of a layer in the module tree.
///
/// Parameter freezing switches on this tag rather than on concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// A plain dense layer owning a weight and optional bias.
    PlainLinear,
    /// A container whose parameters live in its children.
    Composite,
    /// A low-rank correction owning the `A` and `B` factors.
    LowRankCorrection,
    /// A parameter-free element-wise activation.
    Activation,
}

/// A node of a model: forward computation plus access to its parameters
/// and named children.
pub trait Layer: Send + Sync {
    /// Structural role of this layer.
    fn kind(&self) -> LayerKind;

    /// Forward pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the input shape is incompatible with the layer.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Parameters owned directly by this layer (not by its children).
    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    /// Mutable access to the parameters owned directly by this layer.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    /// Named child layers, in forward order.
    fn children(&self) -> Vec<(String, &dyn Layer)> {
        Vec::new()
    }

    /// Mutable access to the named child layers, in forward order.
    fn children_mut(&mut self) -> Vec<(String, &mut dyn Layer)> {
        Vec::new()
    }
}

/// Trait for adapters that can be merged into base weights.
pub trait Mergeable {
    /// Merge adapter weights into base model weights.
    ///
    /// # Arguments
    /// * `base_weight` - The original weight tensor to merge into
    ///
    /// # Returns
    /// New tensor with adapter weights merged
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor>;

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Arguments
    /// * `merged_weight` - Weight tensor with adapter already merged
    ///
    /// # Returns
    /// Original base weight tensor
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor>;
}

/// Trait for layers whose own parameters can be frozen as a unit.
pub trait Trainable {
    /// Freeze all owned parameters (exclude them from optimizer updates).
    fn freeze(&mut self);

    /// Unfreeze all owned parameters.
    fn unfreeze(&mut self);

    /// Check if every owned parameter is frozen.
    #[must_use]
    fn is_frozen(&self) -> bool;
}
