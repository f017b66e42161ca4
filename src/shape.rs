//! Shape checks shared by the dense layers.

use candle_core::Tensor;

use crate::error::{LoraError, Result};

/// Check that `xs` has at least one dimension and that its last one is `dim`.
///
/// # Errors
///
/// Returns [`LoraError::ShapeMismatch`] otherwise.
pub fn check_trailing_dim(xs: &Tensor, dim: usize) -> Result<()> {
    match xs.dims().last() {
        Some(&last) if last == dim => Ok(()),
        _ => {
            let mut expected = xs.dims().to_vec();
            match expected.last_mut() {
                Some(last) => *last = dim,
                None => expected.push(dim),
            }
            Err(LoraError::ShapeMismatch {
                expected,
                actual: xs.dims().to_vec(),
            })
        }
    }
}

/// Check that a tensor has exactly the given shape.
///
/// # Errors
///
/// Returns [`LoraError::ShapeMismatch`] otherwise.
pub fn check_shape(t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() == expected {
        Ok(())
    } else {
        Err(LoraError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: t.dims().to_vec(),
        })
    }
}

/// Apply a row-wise map `(n, in) -> (n, out)` to an input of shape
/// `(..., in)`, returning `(..., out)`.
///
/// Leading dimensions are flattened into one batch dimension and restored
/// afterwards; a 1-D input is treated as a single row.
///
/// # Errors
///
/// Returns an error if the trailing dimension is not `in_dim` or `f` fails.
pub fn map_rows<F>(xs: &Tensor, in_dim: usize, out_dim: usize, f: F) -> Result<Tensor>
where
    F: FnOnce(&Tensor) -> Result<Tensor>,
{
    check_trailing_dim(xs, in_dim)?;
    let dims = xs.dims();
    let leading = &dims[..dims.len() - 1];
    let rows: usize = leading.iter().product();

    let ys = f(&xs.reshape((rows, in_dim))?)?;

    let mut out_shape = leading.to_vec();
    out_shape.push(out_dim);
    Ok(ys.reshape(out_shape)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_trailing_dim_mismatch() {
        let xs = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(check_trailing_dim(&xs, 3).is_ok());
        match check_trailing_dim(&xs, 4) {
            Err(LoraError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![2, 4]);
                assert_eq!(actual, vec![2, 3]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_map_rows_restores_leading_dims() -> Result<()> {
        let xs = Tensor::ones((2, 5, 3), DType::F32, &Device::Cpu)?;
        let ys = map_rows(&xs, 3, 1, |x| Ok(x.sum_keepdim(1)?))?;
        assert_eq!(ys.dims(), &[2, 5, 1]);

        let v = Tensor::ones(3, DType::F32, &Device::Cpu)?;
        let y = map_rows(&v, 3, 1, |x| Ok(x.sum_keepdim(1)?))?;
        assert_eq!(y.dims(), &[1]);
        Ok(())
    }
}
