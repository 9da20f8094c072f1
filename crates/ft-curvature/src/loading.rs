// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Diagonal loading and dense inversion.

use crate::{CurvatureError, CurvatureResult};
use nalgebra::DMatrix;

/// Diagonal-loading recipes used before inverting a Fisher estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DiagonalLoading {
    /// `reg = H + tau * I`.
    Tau(f64),
    /// `reg = multiply.sqrt() * H + diag(add.sqrt())`, the scaled variant the
    /// Bayesian posterior inversion uses.
    Scaled { add: f64, multiply: f64 },
}

impl DiagonalLoading {
    /// Validates the scalar terms.
    pub fn validate(&self) -> CurvatureResult<()> {
        match *self {
            DiagonalLoading::Tau(tau) => {
                if !tau.is_finite() || tau < 0.0 {
                    return Err(CurvatureError::InvalidParameter {
                        label: "loading_tau",
                    });
                }
            }
            DiagonalLoading::Scaled { add, multiply } => {
                if !add.is_finite() || add < 0.0 {
                    return Err(CurvatureError::InvalidParameter {
                        label: "loading_add",
                    });
                }
                if !multiply.is_finite() || multiply <= 0.0 {
                    return Err(CurvatureError::InvalidParameter {
                        label: "loading_multiply",
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies the loading to a square matrix.
    pub fn apply(&self, matrix: &DMatrix<f64>) -> CurvatureResult<DMatrix<f64>> {
        self.validate()?;
        if matrix.nrows() != matrix.ncols() {
            return Err(CurvatureError::InvalidParameter {
                label: "loading_square_matrix",
            });
        }
        let mut out = match *self {
            DiagonalLoading::Tau(_) => matrix.clone(),
            DiagonalLoading::Scaled { multiply, .. } => matrix * multiply.sqrt(),
        };
        let shift = match *self {
            DiagonalLoading::Tau(tau) => tau,
            DiagonalLoading::Scaled { add, .. } => add.sqrt(),
        };
        for i in 0..out.nrows() {
            out[(i, i)] += shift;
        }
        Ok(out)
    }
}

/// Regularises a square matrix with the given loading.
pub fn regularize(matrix: &DMatrix<f64>, loading: &DiagonalLoading) -> CurvatureResult<DMatrix<f64>> {
    loading.apply(matrix)
}

/// Dense LU inversion. Failure means the loading term was too small; there is
/// no retry policy, the caller sees the error immediately.
pub fn invert(matrix: &DMatrix<f64>) -> CurvatureResult<DMatrix<f64>> {
    let dim = matrix.nrows();
    if dim != matrix.ncols() || dim == 0 {
        return Err(CurvatureError::InvalidParameter {
            label: "invert_square_matrix",
        });
    }
    matrix
        .clone()
        .try_inverse()
        .ok_or(CurvatureError::SingularMatrix { dim })
}

/// Projects a matrix onto the nearest (in the eigenvalue-clamping sense)
/// symmetric positive semi-definite matrix with spectrum floored at `epsilon`.
pub fn nearest_psd(matrix: &DMatrix<f64>, epsilon: f64) -> CurvatureResult<DMatrix<f64>> {
    if matrix.nrows() != matrix.ncols() || matrix.nrows() == 0 {
        return Err(CurvatureError::InvalidParameter {
            label: "psd_square_matrix",
        });
    }
    if !epsilon.is_finite() || epsilon < 0.0 {
        return Err(CurvatureError::InvalidParameter {
            label: "psd_epsilon",
        });
    }
    let symmetric = (matrix + matrix.transpose()) * 0.5;
    let eigen = symmetric.symmetric_eigen();
    let mut values = eigen.eigenvalues;
    for value in values.iter_mut() {
        if *value < epsilon {
            *value = epsilon;
        }
    }
    let vectors = eigen.eigenvectors;
    Ok(&vectors * DMatrix::from_diagonal(&values) * vectors.transpose())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tau_loading_shifts_the_diagonal() {
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
        let reg = regularize(&matrix, &DiagonalLoading::Tau(0.25)).unwrap();
        assert!((reg[(0, 0)] - 1.25).abs() < 1e-12);
        assert!((reg[(0, 1)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn scaled_loading_applies_square_roots() {
        let matrix = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]);
        let reg = regularize(
            &matrix,
            &DiagonalLoading::Scaled {
                add: 1.0,
                multiply: 4.0,
            },
        )
        .unwrap();
        // 2 * sqrt(4) + sqrt(1) on the diagonal.
        assert!((reg[(0, 0)] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn psd_plus_positive_tau_always_inverts() {
        // Rank-one PSD matrix; singular without loading, invertible with it.
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(matches!(
            invert(&matrix),
            Err(CurvatureError::SingularMatrix { dim: 2 })
        ));
        for tau in [1e-6, 1e-3, 1.0] {
            let reg = regularize(&matrix, &DiagonalLoading::Tau(tau)).unwrap();
            let inverse = invert(&reg).unwrap();
            let product = &reg * &inverse;
            assert!((product[(0, 0)] - 1.0).abs() < 1e-6);
            assert!(product[(0, 1)].abs() < 1e-6);
        }
    }

    #[test]
    fn nearest_psd_clamps_negative_eigenvalues() {
        let matrix = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        let psd = nearest_psd(&matrix, 1e-6).unwrap();
        let eigen = psd.symmetric_eigen();
        for value in eigen.eigenvalues.iter() {
            assert!(*value >= 1e-7);
        }
    }

    #[test]
    fn invalid_scalars_are_rejected() {
        let matrix = DMatrix::from_row_slice(1, 1, &[1.0]);
        assert!(regularize(&matrix, &DiagonalLoading::Tau(-1.0)).is_err());
        assert!(regularize(
            &matrix,
            &DiagonalLoading::Scaled {
                add: 1.0,
                multiply: 0.0,
            },
        )
        .is_err());
    }
}
