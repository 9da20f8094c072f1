// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use core::fmt;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Result alias used throughout the tensor and network crates.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor, layer, and loss utilities.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Learning rates and momenta must stay positive and finite.
    NonPositiveLearningRate { rate: f32 },
    /// Numeric guard detected a non-finite value before it could propagate.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={left:?}, right={right:?} cannot be combined"
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::IoError { message } => {
                write!(f, "i/o error while handling tensor data: {message}")
            }
            TensorError::SerializationError { message } => {
                write!(
                    f,
                    "serialization error while handling tensor data: {message}"
                )
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
        }
    }
}

impl Error for TensorError {}

/// Minimum number of output elements before matmul fans out across rayon.
const PAR_MATMUL_THRESHOLD: usize = 64 * 64;

/// Row-major dense matrix of `f32` values.
///
/// Shapes are always `(rows, cols)`. Batched data keeps one example per row,
/// so a batch of flattened 28x28 images is a `(batch, 784)` tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Creates a tensor from an owned row-major buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Creates a tensor by evaluating `f(row, col)` for every element.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Draws every element from a centred Gaussian with the provided standard
    /// deviation, using the caller's RNG so runs stay reproducible.
    pub fn random_normal(rows: usize, cols: usize, std: f32, rng: &mut StdRng) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !std.is_finite() || std <= 0.0 {
            return Err(TensorError::NonFiniteValue {
                label: "normal_std",
                value: std,
            });
        }
        let normal = Normal::new(0.0f32, std).map_err(|_| TensorError::InvalidValue {
            label: "normal_distribution",
        })?;
        let data = (0..rows * cols).map(|_| normal.sample(rng)).collect();
        Ok(Self { rows, cols, data })
    }

    /// Builds a one-hot matrix with one row per label.
    pub fn one_hot(labels: &[usize], classes: usize) -> PureResult<Self> {
        if labels.is_empty() {
            return Err(TensorError::EmptyInput("one_hot_labels"));
        }
        if classes == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: labels.len(),
                cols: classes,
            });
        }
        let mut out = Self::zeros(labels.len(), classes)?;
        for (row, &label) in labels.iter().enumerate() {
            if label >= classes {
                return Err(TensorError::InvalidValue {
                    label: "one_hot_class_index",
                });
            }
            out.data[row * classes + label] = 1.0;
        }
        Ok(out)
    }

    /// Returns the `(rows, cols)` shape.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of stored elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the row-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrow of a single row.
    pub fn row(&self, row: usize) -> PureResult<&[f32]> {
        if row >= self.rows {
            return Err(TensorError::InvalidValue { label: "row_index" });
        }
        Ok(&self.data[row * self.cols..(row + 1) * self.cols])
    }

    fn assert_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Dense matrix product `self @ other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (m, k, n) = (self.rows, self.cols, other.cols);
        let mut out = vec![0.0f32; m * n];
        let lhs = &self.data;
        let rhs = &other.data;
        let kernel = |row: usize, dst: &mut [f32]| {
            let lhs_row = &lhs[row * k..(row + 1) * k];
            for (idx, &a) in lhs_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs_row = &rhs[idx * n..(idx + 1) * n];
                for (d, &b) in dst.iter_mut().zip(rhs_row.iter()) {
                    *d += a * b;
                }
            }
        };
        if m * n >= PAR_MATMUL_THRESHOLD {
            out.par_chunks_mut(n)
                .enumerate()
                .for_each(|(row, dst)| kernel(row, dst));
        } else {
            for (row, dst) in out.chunks_mut(n).enumerate() {
                kernel(row, dst);
            }
        }
        Tensor::from_vec(m, n, out)
    }

    /// Dense matrix product `self @ other.T` without materialising the transpose.
    pub fn matmul_nt(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (m, k, n) = (self.rows, self.cols, other.rows);
        let mut out = vec![0.0f32; m * n];
        let lhs = &self.data;
        let rhs = &other.data;
        let kernel = |row: usize, dst: &mut [f32]| {
            let lhs_row = &lhs[row * k..(row + 1) * k];
            for (col, d) in dst.iter_mut().enumerate() {
                let rhs_row = &rhs[col * k..(col + 1) * k];
                let mut acc = 0.0f32;
                for (&a, &b) in lhs_row.iter().zip(rhs_row.iter()) {
                    acc += a * b;
                }
                *d = acc;
            }
        };
        if m * n >= PAR_MATMUL_THRESHOLD {
            out.par_chunks_mut(n)
                .enumerate()
                .for_each(|(row, dst)| kernel(row, dst));
        } else {
            for (row, dst) in out.chunks_mut(n).enumerate() {
                kernel(row, dst);
            }
        }
        Tensor::from_vec(m, n, out)
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Reinterprets the buffer under a new shape with the same element count.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if rows * cols != self.data.len() {
            return Err(TensorError::DataLength {
                expected: self.data.len(),
                got: rows * cols,
            });
        }
        Ok(Tensor {
            rows,
            cols,
            data: self.data.clone(),
        })
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.assert_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Element-wise difference.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.assert_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Multiplies every element by a scalar.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| a * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.assert_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Accumulates `scale * other` into `self`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.assert_same_shape(other)?;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += scale * src;
        }
        Ok(())
    }

    /// Adds a bias row to every row of the tensor.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for chunk in self.data.chunks_mut(self.cols) {
            for (dst, b) in chunk.iter_mut().zip(bias.iter()) {
                *dst += b;
            }
        }
        Ok(())
    }

    /// Clamps negative entries to zero in place.
    pub fn relu_inplace(&mut self) {
        for value in &mut self.data {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// Numerically stable row-wise softmax.
    pub fn row_softmax(&self) -> PureResult<Tensor> {
        let mut data = Vec::with_capacity(self.data.len());
        for chunk in self.data.chunks(self.cols) {
            let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0f32;
            let exps: Vec<f32> = chunk
                .iter()
                .map(|&v| {
                    let e = (v - max).exp();
                    denom += e;
                    e
                })
                .collect();
            if denom == 0.0 || !denom.is_finite() {
                return Err(TensorError::NonFiniteValue {
                    label: "softmax_denominator",
                    value: denom,
                });
            }
            data.extend(exps.into_iter().map(|e| e / denom));
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Sums the tensor along axis 0, producing one value per column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.cols];
        for chunk in self.data.chunks(self.cols) {
            for (dst, v) in sums.iter_mut().zip(chunk.iter()) {
                *dst += v;
            }
        }
        sums
    }

    /// Stacks tensors with identical column counts on top of each other.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let first = tensors.first().ok_or(TensorError::EmptyInput("cat_rows"))?;
        let cols = first.cols;
        let mut rows = 0;
        let mut data = Vec::new();
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: (first.rows, cols),
                    right: tensor.shape(),
                });
            }
            rows += tensor.rows;
            data.extend_from_slice(&tensor.data);
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Squared Frobenius norm.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn rejects_zero_dimensions() {
        assert!(matches!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            Tensor::from_vec(2, 2, vec![1.0, 2.0]),
            Err(TensorError::DataLength { .. })
        ));
    }

    #[test]
    fn matmul_matches_manual() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_nt_agrees_with_explicit_transpose() {
        let a = Tensor::from_vec(2, 3, vec![1.0, -2.0, 0.5, 3.0, 1.0, -1.0]).unwrap();
        let b = Tensor::from_vec(4, 3, (0..12).map(|i| i as f32 * 0.25).collect()).unwrap();
        let fast = a.matmul_nt(&b).unwrap();
        let slow = a.matmul(&b.transpose()).unwrap();
        assert_eq!(fast, slow);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let logits = Tensor::from_vec(2, 3, vec![2.0, 1.0, 0.5, -1.0, 0.0, 1.0]).unwrap();
        let probs = logits.row_softmax().unwrap();
        for row in 0..2 {
            let sum: f32 = probs.row(row).unwrap().iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn one_hot_places_single_unit_mass() {
        let targets = Tensor::one_hot(&[2, 0], 3).unwrap();
        assert_eq!(targets.data(), &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        assert!(matches!(
            Tensor::one_hot(&[3], 3),
            Err(TensorError::InvalidValue { .. })
        ));
    }

    #[test]
    fn cat_rows_stacks_in_order() {
        let a = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(2, 2, vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let stacked = Tensor::cat_rows(&[a, b]).unwrap();
        assert_eq!(stacked.shape(), (3, 2));
        assert_eq!(stacked.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn add_row_broadcasts_bias() {
        let mut t = Tensor::zeros(2, 3).unwrap();
        t.add_row_inplace(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(t.data(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn random_normal_is_seed_deterministic() {
        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        let a = Tensor::random_normal(3, 4, 0.5, &mut rng_a).unwrap();
        let b = Tensor::random_normal(3, 4, 0.5, &mut rng_b).unwrap();
        assert_eq!(a, b);
    }
}
