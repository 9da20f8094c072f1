// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Eigen-structure diagnostic on a leading principal sub-block.

use crate::{CurvatureError, CurvatureResult};
use nalgebra::DMatrix;

/// Configuration for the eigenvalue probe.
///
/// The probe is purely diagnostic: it regularises the matrix, eigensolves a
/// tractable leading sub-block, checks the spectrum is real, and summarises
/// it. Nothing downstream branches on the result.
#[derive(Clone, Copy, Debug)]
pub struct SpectrumProbe {
    block_size: usize,
    tolerance: f64,
}

impl Default for SpectrumProbe {
    fn default() -> Self {
        Self {
            block_size: 1000,
            tolerance: 1e-30,
        }
    }
}

impl SpectrumProbe {
    /// Creates a probe with the default 1000-wide block and strict tolerance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the sub-block size (clamped to the matrix dimension later).
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Overrides the imaginary-part tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.abs();
        self
    }

    /// Regularises with `tau`, eigensolves the leading block, and reports the
    /// real spectrum's mean and (sample) standard deviation.
    pub fn probe(&self, matrix: &DMatrix<f64>, tau: f64) -> CurvatureResult<SpectrumReport> {
        if matrix.nrows() != matrix.ncols() || matrix.nrows() == 0 {
            return Err(CurvatureError::InvalidParameter {
                label: "spectrum_square_matrix",
            });
        }
        if !tau.is_finite() || tau < 0.0 {
            return Err(CurvatureError::InvalidParameter {
                label: "spectrum_tau",
            });
        }
        let k = self.block_size.min(matrix.nrows());
        let mut block = matrix.view((0, 0), (k, k)).into_owned();
        for i in 0..k {
            block[(i, i)] += tau;
        }
        let eigenvalues = block.complex_eigenvalues();
        let max_imaginary = eigenvalues
            .iter()
            .map(|value| value.im.abs())
            .fold(0.0f64, f64::max);
        if max_imaginary > self.tolerance {
            return Err(CurvatureError::ComplexEigenvalues {
                max_imaginary,
                tolerance: self.tolerance,
            });
        }
        let reals: Vec<f64> = eigenvalues.iter().map(|value| value.re).collect();
        let mean = reals.iter().sum::<f64>() / reals.len() as f64;
        let std = if reals.len() < 2 {
            0.0
        } else {
            let variance = reals
                .iter()
                .map(|value| (value - mean).powi(2))
                .sum::<f64>()
                / (reals.len() - 1) as f64;
            variance.sqrt()
        };
        Ok(SpectrumReport {
            mean,
            std,
            count: reals.len(),
        })
    }
}

/// Summary statistics of the probed (real) spectrum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpectrumReport {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    #[test]
    fn diagonal_matrix_reports_exact_statistics() {
        let matrix = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]));
        let report = SpectrumProbe::new().probe(&matrix, 0.0).unwrap();
        assert_eq!(report.count, 4);
        assert!((report.mean - 2.5).abs() < 1e-12);
        // Sample standard deviation of {1, 2, 3, 4}.
        let expected_std = (5.0f64 / 3.0).sqrt();
        assert!((report.std - expected_std).abs() < 1e-12);
    }

    #[test]
    fn tau_shifts_the_mean() {
        let matrix = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 3.0]));
        let report = SpectrumProbe::new().probe(&matrix, 0.5).unwrap();
        assert!((report.mean - 2.5).abs() < 1e-12);
    }

    #[test]
    fn block_size_limits_the_probe() {
        let matrix = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 2.0, 100.0]));
        let report = SpectrumProbe::new()
            .with_block_size(2)
            .probe(&matrix, 0.0)
            .unwrap();
        assert_eq!(report.count, 2);
        assert!((report.mean - 1.5).abs() < 1e-12);
    }

    #[test]
    fn rotation_matrix_fails_the_imaginary_check() {
        // 90-degree rotation has spectrum {i, -i}.
        let matrix = DMatrix::from_row_slice(2, 2, &[0.0, -1.0, 1.0, 0.0]);
        assert!(matches!(
            SpectrumProbe::new().probe(&matrix, 0.0),
            Err(CurvatureError::ComplexEigenvalues { .. })
        ));
    }
}
