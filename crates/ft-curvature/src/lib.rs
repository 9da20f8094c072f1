// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Curvature analysis for FisherTorch classifiers.
//!
//! The crate builds dense empirical Fisher information matrices from
//! per-batch gradients, analyses their diagonal and kernel-block structure,
//! probes their spectra, and maintains Kronecker-factored curvature
//! approximations (KFAC, EFB, INF) for Bayesian posterior sampling.

pub mod dominance;
pub mod fim;
pub mod heatmap;
pub mod kfac;
pub mod loading;
pub mod persist;
pub mod pipeline;
pub mod posterior;
pub mod spectrum;

pub use dominance::{analyze, kernel_mask, DominanceReport, KernelPartition};
pub use fim::{empirical_fim, flatten_gradients, sample_labels, FimAccumulator, FimMatrix};
pub use heatmap::{render_error_map, render_heatmap, save_heatmap, DEFAULT_CLIP};
pub use kfac::{BlockDiagonal, Efb, Inf, Kfac};
pub use loading::{invert, nearest_psd, regularize, DiagonalLoading};
pub use persist::{load_matrix, save_matrix, MatrixFormat};
pub use pipeline::{
    run, run_bayesian_calibration, run_training, CalibrateSettings, ExecutionMode, RunConfig,
    RunOutcome, TrainReport, TrainSettings,
};
pub use posterior::{calibrate_posterior, CalibrationOutcome, WeightSampler};
pub use spectrum::{SpectrumProbe, SpectrumReport};

use core::fmt;
use ft_tensor::TensorError;
use std::error::Error;

/// Result alias used throughout the curvature crate.
pub type CurvatureResult<T> = Result<T, CurvatureError>;

/// Errors emitted by the curvature estimators and matrix analyses.
#[derive(Clone, Debug, PartialEq)]
pub enum CurvatureError {
    /// Propagated tensor or module failure.
    Tensor(TensorError),
    /// The input matrix does not match the architecture this analysis supports.
    UnsupportedConfiguration { expected: usize, got: usize },
    /// A mass sum or normalisation denominator collapsed to zero.
    DegenerateMatrix { label: &'static str },
    /// Dense inversion failed; the matrix needs (more) diagonal loading.
    SingularMatrix { dim: usize },
    /// The eigen probe found imaginary parts beyond tolerance.
    ComplexEigenvalues { max_imaginary: f64, tolerance: f64 },
    /// `sample_and_replace` was called before `invert`.
    EstimatorNotInverted { estimator: &'static str },
    /// `update` was called after `invert` sealed the statistics.
    EstimatorSealed { estimator: &'static str },
    /// A parameter had no gradient when the accumulator flattened the module.
    MissingGradient { name: String },
    /// An estimator was asked about a layer it never observed.
    UnknownLayer { name: String },
    /// An accumulator was finalised before observing any batches.
    EmptyAccumulator { label: &'static str },
    /// A scalar argument (tau, add, multiply, rank) is out of range.
    InvalidParameter { label: &'static str },
    /// Wrapper around I/O failures when persisting matrices or images.
    Io { message: String },
    /// Wrapper around serde failures when persisting matrices.
    Serialization { message: String },
}

impl fmt::Display for CurvatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurvatureError::Tensor(err) => write!(f, "{err}"),
            CurvatureError::UnsupportedConfiguration { expected, got } => {
                write!(
                    f,
                    "unsupported configuration: analysis expects a {expected}-dimensional \
                     parameter space, got {got}"
                )
            }
            CurvatureError::DegenerateMatrix { label } => {
                write!(f, "degenerate matrix: {label} mass is zero")
            }
            CurvatureError::SingularMatrix { dim } => {
                write!(
                    f,
                    "dense inversion of the {dim}x{dim} matrix failed; increase the diagonal loading"
                )
            }
            CurvatureError::ComplexEigenvalues {
                max_imaginary,
                tolerance,
            } => {
                write!(
                    f,
                    "eigenvalues contain imaginary parts (max {max_imaginary:e} > tol {tolerance:e})"
                )
            }
            CurvatureError::EstimatorNotInverted { estimator } => {
                write!(
                    f,
                    "{estimator}: sample_and_replace requires a prior invert call"
                )
            }
            CurvatureError::EstimatorSealed { estimator } => {
                write!(f, "{estimator}: statistics are sealed after invert")
            }
            CurvatureError::MissingGradient { name } => {
                write!(
                    f,
                    "parameter '{name}' has no gradient; the backward pass did not reach it"
                )
            }
            CurvatureError::UnknownLayer { name } => {
                write!(f, "estimator holds no statistics for layer '{name}'")
            }
            CurvatureError::EmptyAccumulator { label } => {
                write!(f, "{label} was finalised before observing any batches")
            }
            CurvatureError::InvalidParameter { label } => {
                write!(f, "invalid parameter: {label}")
            }
            CurvatureError::Io { message } => {
                write!(f, "i/o error: {message}")
            }
            CurvatureError::Serialization { message } => {
                write!(f, "serialization error: {message}")
            }
        }
    }
}

impl Error for CurvatureError {}

impl From<TensorError> for CurvatureError {
    fn from(err: TensorError) -> Self {
        CurvatureError::Tensor(err)
    }
}
