//! Epoch-based training and evaluation.
//!
//! Contents:
//! - learning-rate schedules and step counters
//! - a [`Trainer`] that optimizes whatever parameters of a model are
//!   currently trainable, and [`compute_accuracy`] for evaluation
//!
//! Nothing here knows about LoRA: the same loop trains a base model and its
//! adapted copy, the difference being only which parameters are frozen.

// usize -> f64 for schedule progress and averages
#![allow(clippy::cast_precision_loss)]

use std::time::{Duration, Instant};

use candle_core::{DType, D};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::Dataset;
use crate::error::{LoraError, Result};
use crate::freeze::trainable_vars;
use crate::traits::Layer;

/// Learning rate schedule strategies.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Constant learning rate
    #[default]
    Constant,
    /// Linear warmup from 0 to max LR
    LinearWarmup {
        /// Number of warmup steps
        warmup_steps: usize,
    },
    /// Cosine annealing from max LR to min LR
    CosineAnnealing {
        /// Total number of steps
        total_steps: usize,
        /// Minimum learning rate
        min_lr: f64,
    },
    /// Linear decay from max LR to min LR
    LinearDecay {
        /// Total number of steps
        total_steps: usize,
        /// Minimum learning rate
        min_lr: f64,
    },
}

impl LrSchedule {
    /// Learning rate for optimizer step `step` (0-indexed) given the
    /// configured base rate.
    #[must_use]
    pub fn get_lr(&self, step: usize, base_lr: f64) -> f64 {
        match *self {
            Self::Constant => base_lr,
            Self::LinearWarmup { warmup_steps } => match progress(step, warmup_steps) {
                Some(p) => base_lr * p,
                None => base_lr,
            },
            Self::CosineAnnealing {
                total_steps,
                min_lr,
            } => match progress(step, total_steps) {
                Some(p) => {
                    let cosine = (1.0 + (std::f64::consts::PI * p).cos()) / 2.0;
                    min_lr + (base_lr - min_lr) * cosine
                }
                None => min_lr,
            },
            Self::LinearDecay {
                total_steps,
                min_lr,
            } => match progress(step, total_steps) {
                Some(p) => base_lr - (base_lr - min_lr) * p,
                None => min_lr,
            },
        }
    }
}

/// Fraction of `span` completed at `step`, or `None` once the span is over.
fn progress(step: usize, span: usize) -> Option<f64> {
    (step < span).then(|| step as f64 / span as f64)
}

/// Configuration for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of passes over the training set
    pub epochs: usize,
    /// Base learning rate
    pub learning_rate: f64,
    /// Learning rate schedule
    pub lr_schedule: LrSchedule,
    /// Examples per optimizer step
    pub batch_size: usize,
    /// Reshuffle the training set every epoch
    pub shuffle: bool,
    /// Log the running loss every this many batches
    pub log_every: usize,
    /// Decoupled weight decay (0 gives plain Adam)
    pub weight_decay: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 0.03,
            lr_schedule: LrSchedule::Constant,
            batch_size: 64,
            shuffle: false,
            log_every: 400,
            weight_decay: 0.0,
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LoraError::InvalidConfig`] for a zero epoch count, batch
    /// size or logging interval, or a non-positive learning rate.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(LoraError::InvalidConfig("epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(LoraError::InvalidConfig("batch size must be > 0".into()));
        }
        if self.log_every == 0 {
            return Err(LoraError::InvalidConfig("log_every must be > 0".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "weight decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Training progress counters.
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Epochs started so far
    pub epoch: usize,
    /// Steps within current epoch
    pub steps_in_epoch: usize,
    config: TrainingConfig,
}

impl TrainingState {
    /// Create new training state with the given configuration.
    #[must_use]
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            steps_in_epoch: 0,
            config,
        }
    }

    /// Get the current learning rate based on schedule.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.config
            .lr_schedule
            .get_lr(self.global_step, self.config.learning_rate)
    }

    /// Record one optimizer step.
    pub fn step(&mut self) {
        self.global_step += 1;
        self.steps_in_epoch += 1;
    }

    /// Start a new epoch.
    pub fn new_epoch(&mut self) {
        self.epoch += 1;
        self.steps_in_epoch = 0;
    }

    /// The configuration driving this run.
    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }
}

/// Summary of one finished epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// 1-based epoch number
    pub epoch: usize,
    /// Mean cross-entropy over the epoch's batches
    pub mean_loss: f64,
    /// Fraction of training examples classified correctly after the epoch
    pub train_accuracy: f64,
    /// Wall time since training started
    pub elapsed: Duration,
}

/// Drives an optimizer over a model's trainable parameters.
///
/// The optimizer is built from the parameters that are trainable when the
/// trainer is created; freezing must therefore happen first.
pub struct Trainer<'m> {
    model: &'m dyn Layer,
    optimizer: AdamW,
    state: TrainingState,
}

impl<'m> Trainer<'m> {
    /// Create a trainer for `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the optimizer
    /// cannot be built.
    pub fn new(model: &'m dyn Layer, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let vars = trainable_vars(model);
        if vars.is_empty() {
            warn!("model has no trainable parameters; training will not change it");
        }
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..ParamsAdamW::default()
        };
        let optimizer = AdamW::new(vars, params)?;
        Ok(Self {
            model,
            optimizer,
            state: TrainingState::new(config),
        })
    }

    /// Training progress so far.
    #[must_use]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Run one epoch over `data`, returning the mean batch loss.
    ///
    /// `rng` is only used when the configuration asks for shuffling.
    ///
    /// # Errors
    ///
    /// Returns an error if a forward or backward pass fails.
    pub fn train_epoch<R: Rng + ?Sized>(&mut self, data: &Dataset, rng: &mut R) -> Result<f64> {
        self.state.new_epoch();
        let config = self.state.config().clone();
        let batches = data.iterate_batches(config.batch_size, config.shuffle.then_some(rng))?;
        let num_batches = batches.num_batches();

        let mut total_loss = 0.0;
        for (batch_idx, batch) in batches.enumerate() {
            let (features, targets) = batch?;
            let logits = self.model.forward(&features)?;
            let loss = loss::cross_entropy(&logits, &targets)?;

            self.optimizer.set_learning_rate(self.state.current_lr());
            self.optimizer.backward_step(&loss)?;
            self.state.step();

            let loss_value = f64::from(loss.to_scalar::<f32>()?);
            total_loss += loss_value;
            if batch_idx % config.log_every == 0 {
                info!(
                    epoch = self.state.epoch,
                    batch = batch_idx,
                    loss = loss_value,
                    "Epoch: {:03}/{:03} | Batch {:03}/{:03} | Loss: {:.4}",
                    self.state.epoch,
                    config.epochs,
                    batch_idx,
                    num_batches,
                    loss_value
                );
            }
        }
        Ok(total_loss / num_batches as f64)
    }

    /// Train for the configured number of epochs, measuring training
    /// accuracy after each one.
    ///
    /// # Errors
    ///
    /// Returns an error if any epoch fails.
    pub fn train<R: Rng + ?Sized>(
        &mut self,
        data: &Dataset,
        rng: &mut R,
    ) -> Result<Vec<EpochReport>> {
        let start = Instant::now();
        let epochs = self.state.config().epochs;
        let batch_size = self.state.config().batch_size;
        let mut reports = Vec::with_capacity(epochs);

        for _ in 0..epochs {
            let mean_loss = self.train_epoch(data, rng)?;
            let train_accuracy = compute_accuracy(self.model, data, batch_size)?;
            let elapsed = start.elapsed();
            info!(
                epoch = self.state.epoch,
                accuracy = train_accuracy,
                "Epoch: {:03}/{:03} training accuracy: {:.2}% | Time elapsed: {:.2} min",
                self.state.epoch,
                epochs,
                train_accuracy * 100.0,
                elapsed.as_secs_f64() / 60.0
            );
            reports.push(EpochReport {
                epoch: self.state.epoch,
                mean_loss,
                train_accuracy,
                elapsed,
            });
        }
        info!(
            "Total Training Time: {:.2} min",
            start.elapsed().as_secs_f64() / 60.0
        );
        Ok(reports)
    }
}

/// Fraction of examples in `data` whose arg-max prediction matches the
/// label. Outputs are detached, so no gradient graph is kept.
///
/// # Errors
///
/// Returns an error if `batch_size` is zero or a forward pass fails.
pub fn compute_accuracy(model: &dyn Layer, data: &Dataset, batch_size: usize) -> Result<f64> {
    let mut correct: u64 = 0;
    for batch in data.batches(batch_size)? {
        let (features, targets) = batch?;
        let logits = model.forward(&features)?.detach();
        let predicted = logits.argmax(D::Minus1)?;
        let hits: u32 = predicted
            .eq(&targets)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar()?;
        correct += u64::from(hits);
    }
    Ok(correct as f64 / data.len() as f64)
}

/// Format parameter count with appropriate units.
///
/// # Arguments
/// * `count` - Number of parameters
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
