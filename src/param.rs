//! Named trainable tensors.

use candle_core::{Tensor, Var};

use crate::Result;

/// A named model parameter backed by a [`Var`], with a trainable flag.
///
/// Frozen parameters enter the forward graph detached, so no gradient is
/// ever computed for them, and they are never handed to an optimizer.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    var: Var,
    trainable: bool,
}

impl Parameter {
    /// Create a trainable parameter initialised from `tensor`.
    ///
    /// The tensor is copied into fresh storage, so later optimizer updates
    /// never alias the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be copied.
    pub fn new(name: impl Into<String>, tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            var: Var::from_tensor(&tensor.detach())?,
            trainable: true,
        })
    }

    /// Deep copy with independent storage, keeping the name and flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be allocated.
    pub fn deep_clone(&self) -> Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            var: Var::from_tensor(&self.var.as_tensor().detach())?,
            trainable: self.trainable,
        })
    }

    /// Local name of the parameter (e.g. `weight`, `lora_a`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tensor to use in a forward pass: tracked when trainable,
    /// detached when frozen.
    #[must_use]
    pub fn tensor(&self) -> Tensor {
        if self.trainable {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }

    /// The underlying variable, for optimizer registration.
    #[must_use]
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// Overwrite the stored values.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes differ.
    pub fn set(&self, values: &Tensor) -> Result<()> {
        Ok(self.var.set(values)?)
    }

    /// Whether the optimizer may update this parameter.
    #[must_use]
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Exclude this parameter from optimizer updates.
    pub fn freeze(&mut self) {
        self.trainable = false;
    }

    /// Include this parameter in optimizer updates.
    pub fn unfreeze(&mut self) {
        self.trainable = true;
    }

    /// Number of scalar elements.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.var.elem_count()
    }

    /// Shape of the parameter.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.var.dims()
    }
}
