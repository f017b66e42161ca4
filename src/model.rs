//! Multilayer perceptron built from plain or adapted dense layers.

use candle_core::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adapters::adapted::AdaptedLinear;
use crate::error::{LoraError, Result};
use crate::linear::LinearMap;
use crate::param::Parameter;
use crate::traits::{Layer, LayerKind};

/// Dense layers in a perceptron built from an [`MlpConfig`].
pub const NUM_DENSE_LAYERS: usize = 3;

/// Layer sizes of a [`MultilayerPerceptron`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Input features per example (flattened image size).
    pub num_features: usize,
    /// Width of the first hidden layer.
    pub num_hidden_1: usize,
    /// Width of the second hidden layer.
    pub num_hidden_2: usize,
    /// Number of output classes.
    pub num_classes: usize,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            num_features: 784,
            num_hidden_1: 128,
            num_hidden_2: 256,
            num_classes: 10,
        }
    }
}

impl MlpConfig {
    /// Check that every layer size is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidConfig`] otherwise.
    pub fn validate(&self) -> Result<()> {
        if self.widths().contains(&0) {
            return Err(LoraError::InvalidConfig(format!(
                "layer sizes must be > 0, got {:?}",
                self.widths()
            )));
        }
        Ok(())
    }

    fn widths(&self) -> [usize; NUM_DENSE_LAYERS + 1] {
        [
            self.num_features,
            self.num_hidden_1,
            self.num_hidden_2,
            self.num_classes,
        ]
    }
}

/// Rectified linear unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl Layer for ReLU {
    fn kind(&self) -> LayerKind {
        LayerKind::Activation
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.relu()?)
    }
}

/// A dense slot of the perceptron: either a plain map or an adapted one.
#[derive(Debug, Clone)]
pub enum DenseLayer {
    /// Plain dense layer.
    Plain(LinearMap),
    /// Dense layer with a low-rank correction.
    Adapted(AdaptedLinear),
}

impl DenseLayer {
    /// The base map, whether or not it is adapted.
    #[must_use]
    pub fn linear(&self) -> &LinearMap {
        match self {
            Self::Plain(linear) => linear,
            Self::Adapted(adapted) => adapted.linear(),
        }
    }

    /// The adapted layer, if this slot is adapted.
    #[must_use]
    pub fn as_adapted(&self) -> Option<&AdaptedLinear> {
        match self {
            Self::Plain(_) => None,
            Self::Adapted(adapted) => Some(adapted),
        }
    }

    fn inner(&self) -> &dyn Layer {
        match self {
            Self::Plain(linear) => linear as &dyn Layer,
            Self::Adapted(adapted) => adapted as &dyn Layer,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Layer {
        match self {
            Self::Plain(linear) => linear as &mut dyn Layer,
            Self::Adapted(adapted) => adapted as &mut dyn Layer,
        }
    }
}

impl Layer for DenseLayer {
    fn kind(&self) -> LayerKind {
        self.inner().kind()
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.inner().forward(xs)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner().parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner_mut().parameters_mut()
    }

    fn children(&self) -> Vec<(String, &dyn Layer)> {
        self.inner().children()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Layer)> {
        self.inner_mut().children_mut()
    }
}

/// `features → hidden_1 → ReLU → hidden_2 → ReLU → classes`.
///
/// Children are named by their position in the sequence (`0` to `4`), with
/// the activations at `1` and `3`.
#[derive(Debug, Clone)]
pub struct MultilayerPerceptron {
    dense: Vec<DenseLayer>,
    activation: ReLU,
}

impl MultilayerPerceptron {
    /// Create a perceptron with freshly initialised plain layers.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer size is zero.
    pub fn new<R: Rng + ?Sized>(config: &MlpConfig, rng: &mut R, device: &Device) -> Result<Self> {
        config.validate()?;
        let widths = config.widths();
        let dense = widths
            .windows(2)
            .map(|w| LinearMap::new(w[0], w[1], rng, device).map(DenseLayer::Plain))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            dense,
            activation: ReLU,
        })
    }

    /// Assemble a perceptron from explicit dense layers, which must chain
    /// (each layer's input width equals the previous layer's output width).
    ///
    /// # Errors
    ///
    /// Returns an error if `dense` is empty or the widths do not chain.
    pub fn from_layers(dense: Vec<DenseLayer>) -> Result<Self> {
        if dense.is_empty() {
            return Err(LoraError::InvalidConfig(
                "a perceptron needs at least one dense layer".into(),
            ));
        }
        for pair in dense.windows(2) {
            let (prev, next) = (pair[0].linear(), pair[1].linear());
            if prev.out_features() != next.in_features() {
                return Err(LoraError::ShapeMismatch {
                    expected: vec![prev.out_features()],
                    actual: vec![next.in_features()],
                });
            }
        }
        Ok(Self {
            dense,
            activation: ReLU,
        })
    }

    /// Dense layers in forward order.
    #[must_use]
    pub fn dense_layers(&self) -> &[DenseLayer] {
        &self.dense
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.dense[0].linear().in_features()
    }

    /// Output width (number of classes).
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.dense[self.dense.len() - 1].linear().out_features()
    }
}

impl Layer for MultilayerPerceptron {
    fn kind(&self) -> LayerKind {
        LayerKind::Composite
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let last = self.dense.len() - 1;
        let mut hidden = xs.clone();
        for (i, layer) in self.dense.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if i < last {
                hidden = self.activation.forward(&hidden)?;
            }
        }
        Ok(hidden)
    }

    fn children(&self) -> Vec<(String, &dyn Layer)> {
        let last = self.dense.len() - 1;
        let mut out: Vec<(String, &dyn Layer)> = Vec::with_capacity(2 * self.dense.len());
        for (i, layer) in self.dense.iter().enumerate() {
            out.push(((2 * i).to_string(), layer as &dyn Layer));
            if i < last {
                out.push(((2 * i + 1).to_string(), &self.activation as &dyn Layer));
            }
        }
        out
    }

    // The shared activation owns no parameters and is left out here.
    fn children_mut(&mut self) -> Vec<(String, &mut dyn Layer)> {
        self.dense
            .iter_mut()
            .enumerate()
            .map(|(i, layer)| ((2 * i).to_string(), layer as &mut dyn Layer))
            .collect()
    }
}
