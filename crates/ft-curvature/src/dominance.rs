// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Diagonal and kernel-block mass analysis of dense Fisher matrices.

use crate::{CurvatureError, CurvatureResult};
use core::fmt;
use nalgebra::DMatrix;

/// Ordered block-coordinate partition of a flattened parameter vector.
///
/// Each weight tensor of shape `(out, in_extent)` contributes `out` blocks of
/// `in_extent` scalars (one per filter or output unit); each bias row is one
/// block. Built from an explicit `(name, shape)` layout, so changing the
/// architecture means rebuilding the partition, never patching coordinates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelPartition {
    ranges: Vec<(usize, usize)>,
    dim: usize,
}

impl KernelPartition {
    /// Derives the partition from an ordered parameter layout.
    pub fn from_layout(layout: &[(String, (usize, usize))]) -> CurvatureResult<Self> {
        if layout.is_empty() {
            return Err(CurvatureError::EmptyAccumulator {
                label: "kernel_partition_layout",
            });
        }
        let mut ranges = Vec::new();
        let mut cursor = 0usize;
        for (_, (rows, cols)) in layout {
            if *rows == 0 || *cols == 0 {
                return Err(CurvatureError::InvalidParameter {
                    label: "kernel_partition_shape",
                });
            }
            if *rows == 1 {
                ranges.push((cursor, cursor + cols));
                cursor += cols;
            } else {
                for _ in 0..*rows {
                    ranges.push((cursor, cursor + cols));
                    cursor += cols;
                }
            }
        }
        Ok(Self {
            ranges,
            dim: cursor,
        })
    }

    /// Half-open `(start, end)` index ranges in parameter order.
    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    /// Declared parameter dimension (the end of the last range).
    pub fn parameter_dimension(&self) -> usize {
        self.dim
    }

    /// Total number of coordinates covered by the blocks.
    pub fn covered(&self) -> usize {
        self.ranges.iter().map(|(a, b)| b - a).sum()
    }
}

/// Mass concentration summary for one analysed matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DominanceReport {
    pub diagonal_mass: f64,
    pub kernel_mass: f64,
    pub total_mass: f64,
    pub diagonal_ratio: f64,
    pub kernel_ratio: f64,
}

impl DominanceReport {
    /// Approximate "1-in-N" reciprocal of the diagonal ratio.
    pub fn diagonal_reciprocal(&self) -> u64 {
        (self.total_mass / self.diagonal_mass) as u64
    }

    /// Approximate "1-in-N" reciprocal of the kernel ratio.
    pub fn kernel_reciprocal(&self) -> u64 {
        (self.total_mass / self.kernel_mass) as u64
    }
}

impl fmt::Display for DominanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sum of diagonal         : {:.2}", self.diagonal_mass)?;
        writeln!(f, "Sum of kernel diagonal  : {:.2}", self.kernel_mass)?;
        writeln!(f, "Sum of all elements     : {:.2}", self.total_mass)?;
        writeln!(
            f,
            "Diagonal Dominance      : {:.8} (1/{})",
            self.diagonal_ratio,
            self.diagonal_reciprocal()
        )?;
        write!(
            f,
            "Kernel Dominance        : {:.8} (1/{})",
            self.kernel_ratio,
            self.kernel_reciprocal()
        )
    }
}

fn check_matrix(matrix: &DMatrix<f64>, partition: &KernelPartition) -> CurvatureResult<()> {
    if matrix.nrows() != matrix.ncols() {
        return Err(CurvatureError::InvalidParameter {
            label: "dominance_square_matrix",
        });
    }
    if matrix.nrows() != partition.parameter_dimension() {
        return Err(CurvatureError::UnsupportedConfiguration {
            expected: partition.parameter_dimension(),
            got: matrix.nrows(),
        });
    }
    Ok(())
}

/// Computes diagonal and kernel-block dominance of `matrix + tau * I`.
///
/// Zero diagonal, kernel, or total mass would put a zero in a denominator;
/// each case fails with an explicit degenerate-matrix error.
pub fn analyze(
    matrix: &DMatrix<f64>,
    partition: &KernelPartition,
    tau: f64,
) -> CurvatureResult<DominanceReport> {
    check_matrix(matrix, partition)?;
    if !tau.is_finite() || tau < 0.0 {
        return Err(CurvatureError::InvalidParameter {
            label: "dominance_tau",
        });
    }
    let dim = matrix.nrows();
    let mut total_mass = 0.0f64;
    for value in matrix.iter() {
        total_mass += value.abs();
    }
    // The loading only touches the diagonal; adjust the three sums in one
    // sweep instead of materialising the regularised matrix.
    let mut diagonal_mass = 0.0f64;
    for i in 0..dim {
        let loaded = matrix[(i, i)] + tau;
        total_mass += loaded.abs() - matrix[(i, i)].abs();
        diagonal_mass += loaded.abs();
    }
    let mut kernel_mass = 0.0f64;
    for &(start, end) in partition.ranges() {
        for i in start..end {
            for j in start..end {
                if i == j {
                    kernel_mass += (matrix[(i, i)] + tau).abs();
                } else {
                    kernel_mass += matrix[(i, j)].abs();
                }
            }
        }
    }
    if total_mass == 0.0 {
        return Err(CurvatureError::DegenerateMatrix { label: "total" });
    }
    if diagonal_mass == 0.0 {
        return Err(CurvatureError::DegenerateMatrix { label: "diagonal" });
    }
    if kernel_mass == 0.0 {
        return Err(CurvatureError::DegenerateMatrix { label: "kernel" });
    }
    Ok(DominanceReport {
        diagonal_mass,
        kernel_mass,
        total_mass,
        diagonal_ratio: diagonal_mass / total_mass,
        kernel_ratio: kernel_mass / total_mass,
    })
}

/// Extracts the block-diagonal kernel mask of a matrix: entries inside the
/// partition blocks are kept, everything else is zeroed.
pub fn kernel_mask(
    matrix: &DMatrix<f64>,
    partition: &KernelPartition,
) -> CurvatureResult<DMatrix<f64>> {
    check_matrix(matrix, partition)?;
    let mut out = DMatrix::zeros(matrix.nrows(), matrix.ncols());
    for &(start, end) in partition.ranges() {
        for i in start..end {
            for j in start..end {
                out[(i, j)] = matrix[(i, j)];
            }
        }
    }
    Ok(out)
}
