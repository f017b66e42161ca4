//! Rank reduction through truncated singular value decomposition.
//!
//! For `W = U·S·Vᵀ` of shape `(d, k)`, keeping the `r` largest singular
//! values gives `B = U_r·S_r` of shape `(d, r)` and `A = V_rᵀ` of shape
//! `(r, k)`. `B @ A` is the best rank-`r` approximation of `W` in the
//! Frobenius norm, and is exact once `r` reaches the rank of `W`.
//!
//! The decomposition runs in `f64` through `nalgebra`; the factors come
//! back in the dtype of the source tensor.

// usize -> f64 for the rank tolerance
#![allow(clippy::cast_precision_loss)]

use candle_core::{DType, Device, Tensor};
use nalgebra::DMatrix;
use rand::Rng;

use crate::error::{LoraError, Result};
use crate::init;
use crate::shape::check_shape;

/// The two factors of a truncated factorization, `W ≈ B @ A`.
#[derive(Debug, Clone)]
pub struct LowRankFactors {
    b: Tensor,
    a: Tensor,
    singular_values: Vec<f64>,
}

impl LowRankFactors {
    /// Left factor `B = U_r·S_r`, shape `(d, r)`.
    #[must_use]
    pub fn b(&self) -> &Tensor {
        &self.b
    }

    /// Right factor `A = V_rᵀ`, shape `(r, k)`.
    #[must_use]
    pub fn a(&self) -> &Tensor {
        &self.a
    }

    /// Kept rank `r`.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.a.dims()[0]
    }

    /// Rows `d` of the source matrix.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.b.dims()[0]
    }

    /// Columns `k` of the source matrix.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.a.dims()[1]
    }

    /// All singular values of the source matrix, largest first.
    #[must_use]
    pub fn singular_values(&self) -> &[f64] {
        &self.singular_values
    }

    /// `B @ A`, shape `(d, k)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix product fails.
    pub fn reconstruct(&self) -> Result<Tensor> {
        Ok(self.b.matmul(&self.a)?)
    }

    /// `B @ (A @ x) + bias` for a vector `x` of length `k`.
    ///
    /// # Errors
    ///
    /// Returns an error if `x` is not of length `k` or `bias` not of
    /// length `d`.
    pub fn apply(&self, x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        check_shape(x, &[self.cols()])?;
        let hidden = self.a.matmul(&x.unsqueeze(1)?)?;
        let y = self.b.matmul(&hidden)?.squeeze(1)?;
        add_bias(y, bias)
    }

    /// Parameters stored by the factors, `r · (d + k)`.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.b.elem_count() + self.a.elem_count()
    }

    /// Parameters stored by the dense matrix, `d · k`.
    #[must_use]
    pub fn dense_parameters(&self) -> usize {
        self.rows() * self.cols()
    }

    /// Whether the factors are smaller than the dense matrix.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.num_parameters() < self.dense_parameters()
    }
}

/// Factor `w` (shape `(d, k)`) into rank-`rank` factors.
///
/// # Errors
///
/// Returns an error if `w` is not 2-D, if `rank` is outside
/// `1..=min(d, k)`, or if the SVD does not converge to `U` and `Vᵀ`.
pub fn factorize(w: &Tensor, rank: usize) -> Result<LowRankFactors> {
    let (d, k) = dims2(w)?;
    let max = d.min(k);
    if rank == 0 || rank > max {
        return Err(LoraError::InvalidRank { rank, max });
    }

    let svd = to_dmatrix(w)?.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| LoraError::Decomposition("U was not computed".into()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| LoraError::Decomposition("Vᵀ was not computed".into()))?;
    let s = svd.singular_values;

    let mut order: Vec<usize> = (0..s.len()).collect();
    order.sort_by(|&i, &j| s[j].total_cmp(&s[i]));
    let kept = &order[..rank];

    let b: Vec<f64> = (0..d)
        .flat_map(|row| kept.iter().map(move |&c| (row, c)))
        .map(|(row, c)| u[(row, c)] * s[c])
        .collect();
    let a: Vec<f64> = kept
        .iter()
        .flat_map(|&c| (0..k).map(move |col| (c, col)))
        .map(|(c, col)| v_t[(c, col)])
        .collect();

    let device = w.device();
    Ok(LowRankFactors {
        b: Tensor::from_vec(b, (d, rank), device)?.to_dtype(w.dtype())?,
        a: Tensor::from_vec(a, (rank, k), device)?.to_dtype(w.dtype())?,
        singular_values: order.iter().map(|&i| s[i]).collect(),
    })
}

/// Singular values of `w`, largest first.
///
/// # Errors
///
/// Returns an error if `w` is not 2-D.
pub fn singular_values(w: &Tensor) -> Result<Vec<f64>> {
    dims2(w)?;
    let mut s: Vec<f64> = to_dmatrix(w)?.singular_values().iter().copied().collect();
    s.sort_by(|a, b| b.total_cmp(a));
    Ok(s)
}

/// Numerical rank of `w`: the number of singular values above
/// `σ_max · max(d, k) · ε`, with `ε` the machine epsilon of `w`'s dtype.
///
/// # Errors
///
/// Returns an error if `w` is not 2-D.
pub fn matrix_rank(w: &Tensor) -> Result<usize> {
    let (d, k) = dims2(w)?;
    let s = singular_values(w)?;
    let eps = match w.dtype() {
        DType::F64 => f64::EPSILON,
        _ => f64::from(f32::EPSILON),
    };
    let tol = s.first().copied().unwrap_or(0.0) * d.max(k) as f64 * eps;
    Ok(s.iter().filter(|&&v| v > tol).count())
}

/// Frobenius norm of `w - B @ A`.
///
/// # Errors
///
/// Returns an error if the shapes disagree.
pub fn reconstruction_error(w: &Tensor, factors: &LowRankFactors) -> Result<f64> {
    let approx = factors.reconstruct()?;
    check_shape(&approx, w.dims())?;
    let diff = w.to_dtype(DType::F64)?.sub(&approx.to_dtype(DType::F64)?)?;
    let sq: f64 = diff.sqr()?.sum_all()?.to_scalar()?;
    Ok(sq.sqrt())
}

/// `w @ x + bias` for a vector `x` of length `k`.
///
/// # Errors
///
/// Returns an error if the shapes disagree.
pub fn apply_dense(w: &Tensor, x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let (_, k) = dims2(w)?;
    check_shape(x, &[k])?;
    let y = w.matmul(&x.unsqueeze(1)?)?.squeeze(1)?;
    add_bias(y, bias)
}

/// `randn(d, rank) @ randn(rank, k)`: a `(d, k)` matrix of rank `rank`
/// (with probability one).
///
/// # Errors
///
/// Returns an error if `rank` is outside `1..=min(d, k)`.
pub fn rank_deficient_matrix<R: Rng + ?Sized>(
    d: usize,
    k: usize,
    rank: usize,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let max = d.min(k);
    if rank == 0 || rank > max {
        return Err(LoraError::InvalidRank { rank, max });
    }
    let left = init::randn((d, rank), 1.0, rng, device)?;
    let right = init::randn((rank, k), 1.0, rng, device)?;
    Ok(left.matmul(&right)?)
}

fn add_bias(y: Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    match bias {
        Some(b) => {
            check_shape(b, y.dims())?;
            Ok(y.add(b)?)
        }
        None => Ok(y),
    }
}

fn dims2(w: &Tensor) -> Result<(usize, usize)> {
    match *w.dims() {
        [d, k] => Ok((d, k)),
        _ => Err(LoraError::DimensionMismatch {
            message: format!("expected a 2-D matrix, got {:?}", w.dims()),
        }),
    }
}

fn to_dmatrix(w: &Tensor) -> Result<DMatrix<f64>> {
    let (d, k) = dims2(w)?;
    let rows: Vec<Vec<f64>> = w.to_dtype(DType::F64)?.to_vec2()?;
    Ok(DMatrix::from_row_iterator(d, k, rows.into_iter().flatten()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rank_of_product_matrix() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let w = rank_deficient_matrix(10, 10, 2, &mut rng, &Device::Cpu)?;
        assert_eq!(matrix_rank(&w)?, 2);
        Ok(())
    }

    #[test]
    fn test_identity_rank() -> Result<()> {
        let w = Tensor::eye(5, DType::F32, &Device::Cpu)?;
        assert_eq!(matrix_rank(&w)?, 5);
        let zeros = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(matrix_rank(&zeros)?, 0);
        Ok(())
    }

    #[test]
    fn test_factor_shapes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let w = init::randn((6, 9), 1.0, &mut rng, &Device::Cpu)?;
        let factors = factorize(&w, 3)?;
        assert_eq!(factors.b().dims(), &[6, 3]);
        assert_eq!(factors.a().dims(), &[3, 9]);
        assert_eq!(factors.rank(), 3);
        assert_eq!(factors.num_parameters(), 3 * (6 + 9));
        assert_eq!(factors.dense_parameters(), 54);
        assert!(factors.is_compressed());
        Ok(())
    }

    #[test]
    fn test_exact_at_true_rank() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let w = rank_deficient_matrix(10, 10, 2, &mut rng, &Device::Cpu)?;
        for r in 2..=4 {
            let factors = factorize(&w, r)?;
            assert!(reconstruction_error(&w, &factors)? < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_error_non_increasing_in_rank() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let w = init::randn((10, 10), 1.0, &mut rng, &Device::Cpu)?;
        let errors: Vec<f64> = (1..=10)
            .map(|r| reconstruction_error(&w, &factorize(&w, r)?))
            .collect::<Result<_>>()?;

        for pair in errors.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-5);
        }
        for &e in &errors[..9] {
            assert!(e > 1e-4);
        }
        assert!(errors[9] < 1e-4);
        Ok(())
    }

    #[test]
    fn test_error_matches_discarded_singular_values() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let w = init::randn((8, 5), 1.0, &mut rng, &Device::Cpu)?;
        let factors = factorize(&w, 2)?;
        let tail: f64 = factors.singular_values()[2..].iter().map(|s| s * s).sum();
        let err = reconstruction_error(&w, &factors)?;
        assert!((err - tail.sqrt()).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_singular_values_sorted() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let w = init::randn((7, 4), 1.0, &mut rng, &Device::Cpu)?;
        let s = singular_values(&w)?;
        assert_eq!(s.len(), 4);
        assert!(s.windows(2).all(|p| p[0] >= p[1]));
        Ok(())
    }

    #[test]
    fn test_apply_matches_dense() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(6);
        let w = rank_deficient_matrix(10, 10, 2, &mut rng, &device)?;
        let bias = init::randn(10, 1.0, &mut rng, &device)?;
        let x = init::randn(10, 1.0, &mut rng, &device)?;
        let factors = factorize(&w, 2)?;

        let y = apply_dense(&w, &x, Some(&bias))?;
        let y_prime = factors.apply(&x, Some(&bias))?;
        let diff: f32 = y.sub(&y_prime)?.abs()?.max(0)?.to_scalar()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_invalid_rank() -> Result<()> {
        let w = Tensor::ones((4, 3), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            factorize(&w, 0),
            Err(LoraError::InvalidRank { rank: 0, max: 3 })
        ));
        assert!(matches!(
            factorize(&w, 4),
            Err(LoraError::InvalidRank { rank: 4, max: 3 })
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_non_matrix() -> Result<()> {
        let w = Tensor::ones((2, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            factorize(&w, 1),
            Err(LoraError::DimensionMismatch { .. })
        ));
        Ok(())
    }
}
