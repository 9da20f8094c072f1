// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense tensor primitives for the FisherTorch curvature stack.
//!
//! Everything here is safe, pure Rust: a row-major `f32` matrix type, the
//! shared error taxonomy, and the handful of operations the network layers
//! and Fisher accumulators actually need. Heavy decompositions (inversion,
//! eigensolves) are deliberately left to `nalgebra` in downstream crates.

pub mod dense;

pub use dense::{PureResult, Tensor, TensorError};
