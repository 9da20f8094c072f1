// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor, TensorError};

/// Softmax cross entropy over raw logits with one-hot targets.
///
/// The softmax is fused into both passes, so the backward gradient is the
/// familiar `(softmax(logits) - target) / batch` without clamping epsilons.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Creates the loss.
    pub fn new() -> Self {
        Self
    }

    fn check(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
        if prediction.shape() != target.shape() {
            return Err(TensorError::ShapeMismatch {
                left: prediction.shape(),
                right: target.shape(),
            });
        }
        Ok(())
    }
}

impl Loss for CrossEntropyLoss {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let (rows, _) = prediction.shape();
        let mut total = 0.0f32;
        for row in 0..rows {
            let logits = prediction.row(row)?;
            let targets = target.row(row)?;
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum: f32 = logits.iter().map(|&z| (z - max).exp()).sum::<f32>().ln() + max;
            let picked: f32 = logits.iter().zip(targets.iter()).map(|(z, t)| z * t).sum();
            total += log_sum - picked;
        }
        Tensor::from_vec(1, 1, vec![total / rows as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let (rows, _) = prediction.shape();
        let probs = prediction.row_softmax()?;
        let mut grad = probs.sub(target)?;
        let inv_batch = 1.0 / rows as f32;
        for value in grad.data_mut() {
            *value *= inv_batch;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits_yield_log_class_count() {
        let mut loss = CrossEntropyLoss::new();
        let logits = Tensor::zeros(1, 2).unwrap();
        let target = Tensor::from_vec(1, 2, vec![1.0, 0.0]).unwrap();
        let value = loss.forward(&logits, &target).unwrap();
        assert!((value.data()[0] - 2.0f32.ln()).abs() < 1e-6);
        let grad = loss.backward(&logits, &target).unwrap();
        assert!((grad.data()[0] + 0.5).abs() < 1e-6);
        assert!((grad.data()[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn batch_averaging_scales_gradient() {
        let mut loss = CrossEntropyLoss::new();
        let logits = Tensor::from_vec(2, 2, vec![1.0, -1.0, -1.0, 1.0]).unwrap();
        let target = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let grad = loss.backward(&logits, &target).unwrap();
        let probs = logits.row_softmax().unwrap();
        let expected = (probs.data()[0] - 1.0) / 2.0;
        assert!((grad.data()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut loss = CrossEntropyLoss::new();
        let logits = Tensor::zeros(1, 3).unwrap();
        let target = Tensor::zeros(1, 2).unwrap();
        assert!(loss.forward(&logits, &target).is_err());
    }
}
