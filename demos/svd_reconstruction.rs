//! Low-rank reconstruction of a rank-deficient matrix.
//!
//! This example demonstrates:
//! - Building a 10×10 matrix of rank 2 as a product of two thin matrices
//! - Measuring its numerical rank
//! - Factoring it with truncated SVD into `B (d×r)` and `A (r×k)`
//! - Checking that `W @ x + bias` and `(B @ A) @ x + bias` agree
//! - Comparing parameter counts

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use lora_rs::{
    apply_dense, factorize, init, matrix_rank, rank_deficient_matrix, reconstruction_error,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reconstruct a rank-deficient matrix from its truncated SVD.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rows of W
    #[arg(short, default_value_t = 10)]
    d: usize,

    /// Columns of W
    #[arg(short, default_value_t = 10)]
    k: usize,

    /// True rank used to generate W
    #[arg(long, default_value_t = 2)]
    true_rank: usize,

    /// Seed for the random number generator
    #[arg(long, default_value_t = 0)]
    seed: u64,
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

    println!("=== SVD Reconstruction Example ===\n");

    // Generate a rank-deficient matrix W
    let w = rank_deficient_matrix(args.d, args.k, args.true_rank, &mut rng, &device)?;

    // Evaluate the rank of W and keep exactly that many singular values
    let rank = matrix_rank(&w)?;
    println!("Rank of W: {rank}");

    let factors = factorize(&w, rank)?;
    println!("Shape of B: {:?}", factors.b().shape());
    println!("Shape of A: {:?}", factors.a().shape());
    println!(
        "Reconstruction error ||W - BA||_F: {:.3e}\n",
        reconstruction_error(&w, &factors)?
    );

    // Same input through W and through B @ A
    let bias = init::randn(args.d, 1.0, &mut rng, &device)?;
    let x = init::randn(args.k, 1.0, &mut rng, &device)?;

    let y = apply_dense(&w, &x, Some(&bias))?;
    let y_prime = factors.apply(&x, Some(&bias))?;
    println!("Original y using W:\n{y}");
    println!("y' computed using BA:\n{y_prime}");

    let max_diff: f32 = y.sub(&y_prime)?.abs()?.max(0)?.to_scalar()?;
    println!("Max |y - y'|: {max_diff:.3e}\n");

    println!("Total parameters of W: {}", factors.dense_parameters());
    println!("Total parameters of B and A: {}", factors.num_parameters());

    if factors.is_compressed() {
        println!("\n✓ B and A reproduce W with fewer parameters");
    }

    Ok(())
}
