//! Unmerged vs merged forward passes of an adapted dense layer.
//!
//! This example demonstrates:
//! - A fresh correction leaves the layer's output unchanged (`B = 0`)
//! - Computing `x@Wᵀ + b + α·x@A@B` and `x@(W + α(A@B)ᵀ)ᵀ + b` gives the
//!   same result once `B` is non-zero
//! - Folding the correction into a plain dense layer

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::Parser;
use lora_rs::{init, AdaptedLinear, Layer, LinearMap, LoraConfig, LowRankCorrection, MergeMode};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Compare unmerged and merged adapted layers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rank of the correction
    #[arg(short, long, default_value_t = 2)]
    rank: usize,

    /// Scale of the correction
    #[arg(short, long, default_value_t = 4.0)]
    alpha: f64,

    /// Seed for the random number generator
    #[arg(long, default_value_t = 123)]
    seed: u64,
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar()?)
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
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let config = LoraConfig {
        r: args.rank,
        alpha: args.alpha,
    };

    println!("=== Merge Equivalence Example ===\n");

    let linear = LinearMap::new(10, 2, &mut rng, &device)?;
    let x = init::randn((1, 10), 1.0, &mut rng, &device)?;
    let original = linear.forward(&x)?;
    println!("Original output:\n{original}");

    // Freshly initialised: B is zero, so both variants reproduce the base layer
    let unmerged = AdaptedLinear::new(
        linear.deep_clone()?,
        config.clone(),
        MergeMode::Unmerged,
        &mut rng,
        &device,
    )?;
    let merged = AdaptedLinear::new(
        linear.deep_clone()?,
        config.clone(),
        MergeMode::Merged,
        &mut rng,
        &device,
    )?;
    println!("Unmerged output at init:\n{}", unmerged.forward(&x)?);
    println!("Merged output at init:\n{}", merged.forward(&x)?);

    // A correction that has moved away from zero, as after fine-tuning
    let a = init::randn((10, config.r), 1.0 / (config.r as f64).sqrt(), &mut rng, &device)?;
    let b = init::randn((config.r, 2), 0.1, &mut rng, &device)?;
    let correction = LowRankCorrection::from_factors(&a, &b, config.alpha)?;

    let mut adapted =
        AdaptedLinear::from_parts(linear.deep_clone()?, correction, MergeMode::Unmerged)?;
    let y_unmerged = adapted.forward(&x)?;
    adapted.set_mode(MergeMode::Merged);
    let y_merged = adapted.forward(&x)?;

    println!("\nWith non-zero B:");
    println!("  unmerged: {y_unmerged}");
    println!("  merged:   {y_merged}");
    println!("  max |unmerged - merged|: {:.3e}", max_abs_diff(&y_unmerged, &y_merged)?);
    println!("  max |adapted - original|: {:.3e}", max_abs_diff(&y_merged, &original)?);

    let folded = adapted.into_merged_linear()?;
    println!(
        "  max |folded - merged|: {:.3e}",
        max_abs_diff(&folded.forward(&x)?, &y_merged)?
    );

    println!("\n✓ Merged and unmerged forms compute the same function");

    Ok(())
}
