//! Pretrain a perceptron, then fine-tune a low-rank adapted copy of it.
//!
//! This example demonstrates:
//! - Training a 3-layer perceptron classifier
//! - Building an adapted copy with [`AdaptedModelBuilder`]
//! - Freezing every plain dense layer so only `A` and `B` train
//! - Fine-tuning with the same generic training loop
//!
//! By default a noisy synthetic 10-class set is used. With the `mnist`
//! feature, `--mnist-dir` points at the four uncompressed MNIST IDX files.
//!
//! The fine-tuning task relabels every example as `(label + shift) % classes`
//! (`--label-shift`, default 1), so the pretrained model starts near zero
//! accuracy on it and any gain comes from the correction factors. Pass
//! `--label-shift 0` to fine-tune on the pretraining task.

use std::path::PathBuf;

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::Parser;
use lora_rs::{
    compute_accuracy, count_parameters, format_parameter_count, freeze_linear_layers,
    named_parameters, AdaptedModelBuilder, Dataset, ExperimentConfig, MultilayerPerceptron,
    Trainer,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
#[cfg(feature = "mnist")]
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pretrain, adapt, freeze, fine-tune.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON experiment configuration (missing fields take defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory with the MNIST IDX files
    #[cfg(feature = "mnist")]
    #[arg(long)]
    mnist_dir: Option<PathBuf>,

    /// Training examples in the synthetic set
    #[arg(long, default_value_t = 4096)]
    train_size: usize,

    /// Test examples in the synthetic set
    #[arg(long, default_value_t = 1024)]
    test_size: usize,

    /// Noise standard deviation of the synthetic set
    #[arg(long, default_value_t = 24.0)]
    noise: f64,

    /// Class offset defining the fine-tuning task
    #[arg(long, default_value_t = 1)]
    label_shift: u32,

    /// Override the number of epochs of both phases
    #[arg(short, long)]
    epochs: Option<usize>,
}

fn load_data(
    args: &Args,
    config: &ExperimentConfig,
    rng: &mut StdRng,
    device: &Device,
) -> Result<(Dataset, Dataset)> {
    #[cfg(feature = "mnist")]
    if let Some(dir) = &args.mnist_dir {
        info!(dir = %dir.display(), "loading MNIST");
        return Ok(lora_rs::load_mnist(dir)?);
    }

    // Draw train and test from one set so they share class prototypes
    let features = config.model.num_features;
    let classes = config.model.num_classes;
    let total = args.train_size + args.test_size;
    let all = Dataset::synthetic(total, features, classes, args.noise, rng, device)?;
    let train = Dataset::new(
        all.features().narrow(0, 0, args.train_size)?,
        all.labels().narrow(0, 0, args.train_size)?,
    )?;
    let test = Dataset::new(
        all.features().narrow(0, args.train_size, args.test_size)?,
        all.labels().narrow(0, args.train_size, args.test_size)?,
    )?;
    Ok((train, test))
}

fn shift_labels(data: &Dataset, shift: u32, num_classes: usize) -> Result<Dataset> {
    let classes = u32::try_from(num_classes)?;
    let labels: Vec<u32> = data
        .labels()
        .to_vec1::<u32>()?
        .into_iter()
        .map(|label| (label + shift % classes) % classes)
        .collect();
    let labels = Tensor::from_vec(labels, data.len(), data.labels().device())?;
    Ok(Dataset::new(data.features().clone(), labels)?)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.pretrain.epochs = epochs;
        config.finetune.epochs = epochs;
    }
    config.validate()?;

    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(config.seed);

    println!("=== LoRA From Scratch ===\n");

    let (train, test) = load_data(&args, &config, &mut rng, &device)?;
    println!(
        "Data: {} training / {} test examples, {} features\n",
        train.len(),
        test.len(),
        train.num_features()
    );

    // 1. Pretrain the base model
    let base = MultilayerPerceptron::new(&config.model, &mut rng, &device)?;
    println!("--- Pretraining ---");
    Trainer::new(&base, config.pretrain.clone())?.train(&train, &mut rng)?;
    let base_accuracy = compute_accuracy(&base, &test, config.pretrain.batch_size)?;
    println!("Test accuracy: {:.2}%\n", base_accuracy * 100.0);

    // 2. Adapt a copy and freeze its dense layers
    let mut adapted = AdaptedModelBuilder::new(&base)
        .roles(config.layer_roles())?
        .build(&mut rng, &device)?;
    let classes = config.model.num_classes;
    let tune_train = shift_labels(&train, args.label_shift, classes)?;
    let tune_test = shift_labels(&test, args.label_shift, classes)?;
    let at_init = compute_accuracy(&adapted, &tune_test, config.finetune.batch_size)?;
    println!(
        "Adapted model accuracy on the fine-tuning task at init: {:.2}%",
        at_init * 100.0
    );

    let frozen = freeze_linear_layers(&mut adapted);
    println!("Froze {frozen} dense-layer parameters\n");
    for (name, trainable) in named_parameters(&adapted) {
        println!("  {name}: {trainable}");
    }

    // 3. Fine-tune only the correction factors
    println!("\n--- Fine-tuning ---");
    Trainer::new(&adapted, config.finetune.clone())?.train(&tune_train, &mut rng)?;

    let base_after = compute_accuracy(&base, &tune_test, config.pretrain.batch_size)?;
    let base_original = compute_accuracy(&base, &test, config.pretrain.batch_size)?;
    let adapted_accuracy = compute_accuracy(&adapted, &tune_test, config.finetune.batch_size)?;
    println!("\nTest accuracy original model: {:.2}%", base_after * 100.0);
    println!("Test accuracy LoRA model: {:.2}%", adapted_accuracy * 100.0);
    println!(
        "Original model on its own task (unchanged): {:.2}%",
        base_original * 100.0
    );

    let total = count_parameters(&adapted, false);
    let trainable = count_parameters(&adapted, true);
    println!("\nParameter Statistics:");
    let base_total = count_parameters(&base, false);
    println!("  Base model: {}", format_parameter_count(base_total));
    println!("  Adapted model total: {}", format_parameter_count(total));
    println!(
        "  Adapted model trainable: {} ({:.2}%)",
        format_parameter_count(trainable),
        100.0 * trainable as f64 / total as f64
    );

    Ok(())
}
