// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense empirical Fisher information accumulation.

use crate::{CurvatureError, CurvatureResult};
use ft_nn::{DataLoader, Loss, Module, Tensor};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;

/// Normalised empirical Fisher information matrix.
///
/// Built once by an accumulation pass and treated as read-only afterwards:
/// regularisation, inversion, masking, and rendering all copy.
#[derive(Clone, Debug, PartialEq)]
pub struct FimMatrix {
    matrix: DMatrix<f64>,
    batches: usize,
}

impl FimMatrix {
    /// Side length of the square matrix.
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of batches averaged into the estimate.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Borrow of the underlying matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Consumes the wrapper, releasing the matrix.
    pub fn into_matrix(self) -> DMatrix<f64> {
        self.matrix
    }

    /// Wraps an externally produced matrix (e.g. loaded from disk).
    pub fn from_parts(matrix: DMatrix<f64>, batches: usize) -> CurvatureResult<Self> {
        if matrix.nrows() != matrix.ncols() || matrix.nrows() == 0 {
            return Err(CurvatureError::InvalidParameter {
                label: "fim_matrix_shape",
            });
        }
        Ok(Self { matrix, batches })
    }

    /// Largest absolute deviation from perfect symmetry.
    pub fn symmetry_gap(&self) -> f64 {
        let mut gap = 0.0f64;
        for i in 0..self.dim() {
            for j in (i + 1)..self.dim() {
                gap = gap.max((self.matrix[(i, j)] - self.matrix[(j, i)]).abs());
            }
        }
        gap
    }
}

/// Running sum of per-batch gradient outer products.
#[derive(Clone, Debug)]
pub struct FimAccumulator {
    sum: DMatrix<f64>,
    dim: usize,
    batches: usize,
}

impl FimAccumulator {
    /// Creates an accumulator for a `dim`-dimensional parameter space.
    pub fn new(dim: usize) -> CurvatureResult<Self> {
        if dim == 0 {
            return Err(CurvatureError::InvalidParameter {
                label: "fim_dimension",
            });
        }
        Ok(Self {
            sum: DMatrix::zeros(dim, dim),
            dim,
            batches: 0,
        })
    }

    /// Parameter dimension this accumulator was built for.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of accumulated batches.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Adds one flattened gradient's outer product to the running sum.
    pub fn accumulate(&mut self, gradient: &[f32]) -> CurvatureResult<()> {
        if gradient.len() != self.dim {
            return Err(CurvatureError::UnsupportedConfiguration {
                expected: self.dim,
                got: gradient.len(),
            });
        }
        let v = DVector::from_iterator(self.dim, gradient.iter().map(|&g| g as f64));
        self.sum.ger(1.0, &v, &v, 1.0);
        self.batches += 1;
        Ok(())
    }

    /// Divides by the batch count and returns the read-only estimate.
    pub fn finish(self) -> CurvatureResult<FimMatrix> {
        if self.batches == 0 {
            return Err(CurvatureError::EmptyAccumulator {
                label: "fim_accumulator",
            });
        }
        let scale = 1.0 / self.batches as f64;
        Ok(FimMatrix {
            matrix: self.sum * scale,
            batches: self.batches,
        })
    }
}

/// Flattens every accumulated parameter gradient in enumeration order.
///
/// A parameter with no gradient is a configuration fault (the backward pass
/// never reached it), surfaced immediately rather than padded with zeros.
pub fn flatten_gradients<M: Module + ?Sized>(module: &M) -> CurvatureResult<Vec<f32>> {
    let mut flat = Vec::new();
    let mut missing: Option<String> = None;
    module.visit_parameters(&mut |param| {
        match param.gradient() {
            Some(gradient) => flat.extend_from_slice(gradient.data()),
            None => {
                if missing.is_none() {
                    missing = Some(param.name().to_string());
                }
            }
        }
        Ok(())
    })?;
    if let Some(name) = missing {
        return Err(CurvatureError::MissingGradient { name });
    }
    Ok(flat)
}

/// Draws one class index per row from the categorical distribution the
/// logits define. This is the true-Fisher estimator: targets come from the
/// model's own predictive distribution, not from the dataset labels.
pub fn sample_labels(logits: &Tensor, rng: &mut StdRng) -> CurvatureResult<Vec<usize>> {
    let probs = logits.row_softmax()?;
    let (rows, cols) = probs.shape();
    let mut labels = Vec::with_capacity(rows);
    for row in 0..rows {
        let chances = probs.row(row)?;
        let draw: f32 = rng.gen();
        let mut cumulative = 0.0f32;
        let mut picked = cols - 1;
        for (idx, &p) in chances.iter().enumerate() {
            cumulative += p;
            if draw < cumulative {
                picked = idx;
                break;
            }
        }
        labels.push(picked);
    }
    Ok(labels)
}

/// Runs a full accumulation pass and returns the normalised empirical FIM.
///
/// Dataset targets are ignored on purpose; see [`sample_labels`]. Gradient
/// buffers are zeroed before every batch so no state leaks across steps.
pub fn empirical_fim<M, L>(
    model: &mut M,
    loss: &mut L,
    loader: &DataLoader,
    rng: &mut StdRng,
) -> CurvatureResult<FimMatrix>
where
    M: Module + ?Sized,
    L: Loss,
{
    let dim = model.parameter_dimension()?;
    let mut accumulator = FimAccumulator::new(dim)?;
    for batch in loader.iter() {
        let (input, _targets) = batch?;
        model.zero_accumulators()?;
        let logits = model.forward(&input)?;
        let labels = sample_labels(&logits, rng)?;
        let sampled = Tensor::one_hot(&labels, logits.shape().1)?;
        let grad = loss.backward(&logits, &sampled)?;
        model.backward(&input, &grad)?;
        accumulator.accumulate(&flatten_gradients(model)?)?;
    }
    accumulator.finish()
}
