// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};

fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (idx, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = idx;
        }
    }
    best
}

/// Fraction of rows whose prediction argmax matches the target argmax.
pub fn accuracy(predictions: &Tensor, targets: &Tensor) -> PureResult<f32> {
    if predictions.shape() != targets.shape() {
        return Err(TensorError::ShapeMismatch {
            left: predictions.shape(),
            right: targets.shape(),
        });
    }
    let (rows, _) = predictions.shape();
    if rows == 0 {
        return Err(TensorError::EmptyInput("accuracy_predictions"));
    }
    let mut hits = 0usize;
    for row in 0..rows {
        if argmax(predictions.row(row)?) == argmax(targets.row(row)?) {
            hits += 1;
        }
    }
    Ok(hits as f32 / rows as f32)
}

/// One confidence bin of a reliability diagram.
#[derive(Clone, Copy, Debug, Default)]
pub struct CalibrationBin {
    pub confidence: f32,
    pub accuracy: f32,
    pub weight: f32,
}

/// Reliability diagram plus the derived expected calibration error.
#[derive(Clone, Debug)]
pub struct Calibration {
    pub ece: f32,
    pub bins: Vec<CalibrationBin>,
}

/// Builds an equal-width reliability diagram from predicted probabilities.
///
/// Rows of `probabilities` must already sum to one (softmax output); targets
/// are one-hot. The expected calibration error is the weight-averaged
/// |confidence - accuracy| over the occupied bins.
pub fn calibration_curve(
    probabilities: &Tensor,
    targets: &Tensor,
    bins: usize,
) -> PureResult<Calibration> {
    if probabilities.shape() != targets.shape() {
        return Err(TensorError::ShapeMismatch {
            left: probabilities.shape(),
            right: targets.shape(),
        });
    }
    if bins == 0 {
        return Err(TensorError::InvalidValue {
            label: "calibration_bins",
        });
    }
    let (rows, _) = probabilities.shape();
    if rows == 0 {
        return Err(TensorError::EmptyInput("calibration_probabilities"));
    }
    let mut confidence_sum = vec![0.0f32; bins];
    let mut accuracy_sum = vec![0.0f32; bins];
    let mut counts = vec![0usize; bins];
    for row in 0..rows {
        let probs = probabilities.row(row)?;
        let predicted = argmax(probs);
        let confidence = probs[predicted];
        let hit = argmax(targets.row(row)?) == predicted;
        let bin = ((confidence * bins as f32) as usize).min(bins - 1);
        confidence_sum[bin] += confidence;
        accuracy_sum[bin] += if hit { 1.0 } else { 0.0 };
        counts[bin] += 1;
    }
    let mut out_bins = Vec::with_capacity(bins);
    let mut ece = 0.0f32;
    for bin in 0..bins {
        if counts[bin] == 0 {
            out_bins.push(CalibrationBin::default());
            continue;
        }
        let weight = counts[bin] as f32 / rows as f32;
        let confidence = confidence_sum[bin] / counts[bin] as f32;
        let acc = accuracy_sum[bin] / counts[bin] as f32;
        ece += weight * (confidence - acc).abs();
        out_bins.push(CalibrationBin {
            confidence,
            accuracy: acc,
            weight,
        });
    }
    Ok(Calibration {
        ece,
        bins: out_bins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_counts_argmax_matches() {
        let predictions =
            Tensor::from_vec(2, 2, vec![0.9, 0.1, 0.2, 0.8]).unwrap();
        let targets = Tensor::from_vec(2, 2, vec![1.0, 0.0, 1.0, 0.0]).unwrap();
        let acc = accuracy(&predictions, &targets).unwrap();
        assert!((acc - 0.5).abs() < 1e-6);
    }

    #[test]
    fn perfectly_confident_correct_predictions_have_zero_ece() {
        let probabilities = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let targets = probabilities.clone();
        let calibration = calibration_curve(&probabilities, &targets, 15).unwrap();
        assert!(calibration.ece.abs() < 1e-6);
    }

    #[test]
    fn overconfident_wrong_predictions_show_up_in_ece() {
        let probabilities = Tensor::from_vec(2, 2, vec![0.9, 0.1, 0.9, 0.1]).unwrap();
        let targets = Tensor::from_vec(2, 2, vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        let calibration = calibration_curve(&probabilities, &targets, 10).unwrap();
        assert!((calibration.ece - 0.9).abs() < 1e-6);
    }
}
