// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Monte-Carlo posterior evaluation around an inverted curvature estimate.

use crate::{CurvatureError, CurvatureResult};
use ft_nn::{accuracy, calibration_curve, DataLoader, Module, Tensor};
use rand::rngs::StdRng;

/// Implemented by every inverted curvature estimator that can perturb a live
/// module with posterior weight draws.
pub trait WeightSampler {
    /// Replaces the module's parameters with `mean + draw`.
    fn sample_and_replace(&self, module: &mut dyn Module, rng: &mut StdRng)
        -> CurvatureResult<()>;

    /// Restores the parameter means captured at inversion time.
    fn restore(&self, module: &mut dyn Module) -> CurvatureResult<()>;
}

/// Result of a Monte-Carlo calibration run.
#[derive(Clone, Debug)]
pub struct CalibrationOutcome {
    pub accuracy: f32,
    pub ece: f32,
    pub samples: usize,
    pub mean_predictions: Tensor,
}

/// Averages the predictive distribution over `samples` posterior draws and
/// reports accuracy and expected calibration error against the loader's
/// targets. The module is restored to the captured means before returning.
pub fn calibrate_posterior(
    module: &mut dyn Module,
    sampler: &dyn WeightSampler,
    loader: &DataLoader,
    samples: usize,
    bins: usize,
    rng: &mut StdRng,
) -> CurvatureResult<CalibrationOutcome> {
    if samples == 0 {
        return Err(CurvatureError::InvalidParameter {
            label: "posterior_samples",
        });
    }
    if loader.is_empty() {
        return Err(CurvatureError::EmptyAccumulator {
            label: "posterior_loader",
        });
    }
    let mut mean: Option<Tensor> = None;
    let mut targets: Option<Tensor> = None;
    for _ in 0..samples {
        sampler.sample_and_replace(module, rng)?;
        let mut prob_batches = Vec::new();
        let mut target_batches = Vec::new();
        for batch in loader.iter() {
            let (input, batch_targets) = batch?;
            let logits = module.forward(&input)?;
            prob_batches.push(logits.row_softmax()?);
            if targets.is_none() {
                target_batches.push(batch_targets);
            }
        }
        let probs = Tensor::cat_rows(&prob_batches)?;
        match mean.as_mut() {
            Some(existing) => existing.add_scaled(&probs, 1.0)?,
            None => mean = Some(probs),
        }
        if targets.is_none() {
            targets = Some(Tensor::cat_rows(&target_batches)?);
        }
    }
    sampler.restore(module)?;

    let Some(mean) = mean else {
        return Err(CurvatureError::EmptyAccumulator {
            label: "posterior_predictions",
        });
    };
    let Some(targets) = targets else {
        return Err(CurvatureError::EmptyAccumulator {
            label: "posterior_targets",
        });
    };
    let mean = mean.scale(1.0 / samples as f32)?;
    let acc = accuracy(&mean, &targets)?;
    let calibration = calibration_curve(&mean, &targets, bins)?;
    tracing::info!(
        samples,
        accuracy = acc,
        ece = calibration.ece,
        "posterior calibration finished"
    );
    Ok(CalibrationOutcome {
        accuracy: acc,
        ece: calibration.ece,
        samples,
        mean_predictions: mean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kfac::Kfac;
    use ft_nn::{CrossEntropyLoss, Dataset, Linear, Loss};
    use rand::SeedableRng;

    fn fitted_linear_with_kfac() -> (Linear, Kfac, Dataset) {
        let mut layer = Linear::new("fc", 2, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        layer.init_gaussian(0.5, &mut rng).unwrap();
        let dataset = Dataset::from_vec(
            (0..6)
                .map(|i| {
                    let class = i % 2;
                    let sign = if class == 0 { 1.0 } else { -1.0 };
                    (
                        Tensor::from_vec(1, 2, vec![sign, -sign]).unwrap(),
                        Tensor::one_hot(&[class], 2).unwrap(),
                    )
                })
                .collect(),
        );
        let mut loss = CrossEntropyLoss::new();
        let mut kfac = Kfac::new();
        for batch in dataset.loader().batched(3).iter() {
            let (input, target) = batch.unwrap();
            layer.zero_accumulators().unwrap();
            let logits = layer.forward(&input).unwrap();
            let grad = loss.backward(&logits, &target).unwrap();
            let mut records = Vec::new();
            layer
                .backward_recorded(&input, &grad, &mut |record| {
                    records.push(record);
                    Ok(())
                })
                .unwrap();
            kfac.update(&records).unwrap();
        }
        kfac.invert(&layer, 1.0, 100.0).unwrap();
        (layer, kfac, dataset)
    }

    #[test]
    fn calibration_averages_probabilities_and_restores_means() {
        let (mut layer, kfac, dataset) = fitted_linear_with_kfac();
        let means = layer.state_dict().unwrap();
        let loader = dataset.loader().batched(2);
        let mut rng = StdRng::seed_from_u64(31);
        let outcome =
            calibrate_posterior(&mut layer, &kfac, &loader, 5, 10, &mut rng).unwrap();
        assert_eq!(outcome.samples, 5);
        assert!((0.0..=1.0).contains(&outcome.accuracy));
        assert!((0.0..=1.0).contains(&outcome.ece));
        assert_eq!(outcome.mean_predictions.shape(), (6, 2));
        for row in 0..6 {
            let sum: f32 = outcome.mean_predictions.row(row).unwrap().iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        assert_eq!(layer.state_dict().unwrap(), means);
    }

    #[test]
    fn zero_samples_are_rejected() {
        let (mut layer, kfac, dataset) = fitted_linear_with_kfac();
        let loader = dataset.loader();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            calibrate_posterior(&mut layer, &kfac, &loader, 0, 10, &mut rng),
            Err(CurvatureError::InvalidParameter { .. })
        ));
    }
}
