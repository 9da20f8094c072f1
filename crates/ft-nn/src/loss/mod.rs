// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod cross_entropy;

use crate::{PureResult, Tensor};

pub use cross_entropy::CrossEntropyLoss;

/// Trait implemented by differentiable losses operating on dense tensors.
///
/// `backward` returns the gradient of the scalar loss with respect to the
/// prediction tensor, already scaled by any batch averaging the loss applies.
pub trait Loss {
    /// Computes the loss value for the given predictions and targets.
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// Returns the gradient of the loss with respect to the predictions.
    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;
}
