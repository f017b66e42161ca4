//! # lora-rs
//!
//! Low-Rank Adaptation (`LoRA`) of dense layers, built from scratch on candle.
//!
//! This crate provides:
//! - **[`LowRankCorrection`]**: a rank-`r` additive term `α · (x @ A @ B)`
//! - **[`AdaptedLinear`]**: a dense layer plus a correction, applied either
//!   as two separate products or through one merged weight
//! - **Rank reduction**: truncated SVD factorization `W ≈ B @ A`
//!   ([`decomposition::factorize`])
//! - **Freezing**: [`freeze_linear_layers`] freezes every plain dense layer
//!   of a model so only correction factors train
//! - **Training**: a generic [`Trainer`] and [`compute_accuracy`] that work
//!   unchanged for base and adapted models
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lora_rs::{AdaptedModelBuilder, LoraConfig, MergeMode, MlpConfig, MultilayerPerceptron};
//! use candle_core::Device;
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut rng = StdRng::seed_from_u64(123);
//! let base = MultilayerPerceptron::new(&MlpConfig::default(), &mut rng, &Device::Cpu)?;
//! // ... train `base` ...
//! let mut adapted = AdaptedModelBuilder::new(&base)
//!     .adapt_all(LoraConfig { r: 4, alpha: 8.0 }, MergeMode::Merged)
//!     .build(&mut rng, &Device::Cpu)?;
//! lora_rs::freeze_linear_layers(&mut adapted);
//! ```
//!
//! ## Architecture
//!
//! Every model component implements the [`Layer`] trait, which exposes a
//! forward pass, the parameters a node owns, and its named children. Each
//! node carries a [`LayerKind`] tag; freezing and parameter walks switch on
//! that tag.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod builder;
pub mod config;
pub mod data;
pub mod decomposition;
pub mod error;
pub mod freeze;
pub mod init;
pub mod linear;
pub mod model;
pub mod param;
pub mod shape;
pub mod training;
pub mod traits;

pub use adapters::adapted::{AdaptedLinear, MergeMode};
pub use adapters::lora::{LoraConfig, LowRankCorrection};
pub use builder::{AdaptedModelBuilder, LayerRole};
pub use config::ExperimentConfig;
#[cfg(feature = "mnist")]
pub use data::load_mnist;
pub use data::{Batches, Dataset};
pub use decomposition::{
    apply_dense, factorize, matrix_rank, rank_deficient_matrix, reconstruction_error,
    singular_values, LowRankFactors,
};
pub use error::{LoraError, Result};
pub use freeze::{
    count_parameters, freeze_linear_layers, named_parameters, trainable_vars, unfreeze_all,
};
pub use linear::LinearMap;
pub use model::{DenseLayer, MlpConfig, MultilayerPerceptron, ReLU};
pub use param::Parameter;
pub use training::{
    compute_accuracy, format_parameter_count, EpochReport, LrSchedule, Trainer, TrainingConfig,
    TrainingState,
};
pub use traits::{AdapterConfig, Layer, LayerKind, Mergeable, Trainable};
