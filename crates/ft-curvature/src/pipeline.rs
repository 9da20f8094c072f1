// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Execution entry points: plain SGD training and KFAC Bayesian calibration.
//!
//! The two paths used to hide behind a boolean resume flag in the original
//! research scripts; here they are a tagged [`ExecutionMode`], each with its
//! own settings and function. All randomness flows from an explicit
//! [`RunConfig`], never from process-wide state.

use crate::fim::sample_labels;
use crate::kfac::{Efb, Inf, Kfac};
use crate::posterior::{calibrate_posterior, CalibrationOutcome};
use crate::{CurvatureError, CurvatureResult};
use ft_nn::{
    accuracy, load_checkpoint, save_checkpoint, CheckpointFormat, CrossEntropyLoss, DataLoader,
    Dataset, LayerRecord, Loss, Module, Sgd, StepDecay, Tensor,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Explicit run configuration passed to every entry point.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Base seed; per-component RNGs are derived from it.
    pub seed: u64,
    /// Optional cap on rayon's global worker count.
    pub threads: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            threads: None,
        }
    }
}

impl RunConfig {
    /// RNG seeded directly from the base seed.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// RNG derived from the base seed and a component label, so independent
    /// stages never share a stream.
    pub fn rng_for(&self, label: &str) -> StdRng {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        label.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }

    /// Applies the thread cap to rayon's global pool. A pool that was already
    /// built keeps its size; that is not an error.
    pub fn apply_thread_limit(&self) {
        if let Some(threads) = self.threads {
            let _ = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global();
        }
    }
}

/// Settings for the plain SGD training path.
#[derive(Clone, Debug)]
pub struct TrainSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub gamma: f32,
    pub milestones: Vec<usize>,
    pub save_path: Option<PathBuf>,
    pub resume: Option<PathBuf>,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 32,
            learning_rate: 1e-3,
            momentum: 0.9,
            gamma: 0.1,
            milestones: Vec::new(),
            save_path: None,
            resume: None,
        }
    }
}

/// Settings for the KFAC Bayesian calibration path.
#[derive(Clone, Debug)]
pub struct CalibrateSettings {
    pub checkpoint: Option<PathBuf>,
    pub batch_size: usize,
    pub samples: usize,
    pub add: f64,
    pub multiply: f64,
    pub rank: usize,
    pub bins: usize,
}

impl Default for CalibrateSettings {
    fn default() -> Self {
        Self {
            checkpoint: None,
            batch_size: 32,
            samples: 10,
            add: 1.0,
            multiply: 200.0,
            rank: 100,
            bins: 10,
        }
    }
}

/// Tagged execution mode replacing the original `continue_flag` boolean.
#[derive(Clone, Debug)]
pub enum ExecutionMode {
    Train(TrainSettings),
    BayesianCalibrate(CalibrateSettings),
}

/// Summary of a training run.
#[derive(Clone, Copy, Debug)]
pub struct TrainReport {
    pub final_loss: f32,
    pub accuracy: f32,
    pub iterations: usize,
}

/// Result of either execution path.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Trained(TrainReport),
    Calibrated(CalibrationOutcome),
}

/// Dispatches on the execution mode.
pub fn run<M: Module>(
    mode: &ExecutionMode,
    model: &mut M,
    train_data: &Dataset,
    eval_data: &Dataset,
    config: &RunConfig,
) -> CurvatureResult<RunOutcome> {
    config.apply_thread_limit();
    match mode {
        ExecutionMode::Train(settings) => Ok(RunOutcome::Trained(run_training(
            model, train_data, eval_data, settings, config,
        )?)),
        ExecutionMode::BayesianCalibrate(settings) => Ok(RunOutcome::Calibrated(
            run_bayesian_calibration(model, train_data, eval_data, settings, config)?,
        )),
    }
}

fn evaluate<M: Module + ?Sized>(model: &M, loader: &DataLoader) -> CurvatureResult<f32> {
    let mut prob_batches = Vec::new();
    let mut target_batches = Vec::new();
    for batch in loader.iter() {
        let (input, targets) = batch?;
        let logits = model.forward(&input)?;
        prob_batches.push(logits.row_softmax()?);
        target_batches.push(targets);
    }
    if prob_batches.is_empty() {
        return Err(CurvatureError::EmptyAccumulator {
            label: "evaluation_loader",
        });
    }
    let probs = Tensor::cat_rows(&prob_batches)?;
    let targets = Tensor::cat_rows(&target_batches)?;
    Ok(accuracy(&probs, &targets)?)
}

/// Plain SGD training on ground-truth labels with step-decayed learning rate.
pub fn run_training<M: Module>(
    model: &mut M,
    train_data: &Dataset,
    eval_data: &Dataset,
    settings: &TrainSettings,
    config: &RunConfig,
) -> CurvatureResult<TrainReport> {
    if settings.epochs == 0 {
        return Err(CurvatureError::InvalidParameter {
            label: "train_epochs",
        });
    }
    if let Some(resume) = settings.resume.as_ref() {
        tracing::info!(path = %resume.display(), "resuming from checkpoint");
        load_checkpoint(model, resume, CheckpointFormat::from_path(resume))?;
    }
    let mut loss = CrossEntropyLoss::new();
    let mut sgd = Sgd::new(settings.learning_rate, settings.momentum)?;
    let schedule = StepDecay::new(
        settings.learning_rate,
        settings.gamma,
        settings.milestones.clone(),
    )?;

    let mut iteration = 0usize;
    let mut final_loss = 0.0f32;
    for epoch in 0..settings.epochs {
        let loader = train_data
            .loader()
            .shuffle(config.seed.wrapping_add(epoch as u64))
            .batched(settings.batch_size);
        let mut epoch_loss = 0.0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let (input, targets) = batch?;
            schedule.apply(&mut sgd, iteration)?;
            sgd.zero_grad(model)?;
            let logits = model.forward(&input)?;
            let value = loss.forward(&logits, &targets)?;
            let grad = loss.backward(&logits, &targets)?;
            model.backward(&input, &grad)?;
            sgd.step(model)?;
            epoch_loss += value.data()[0];
            iteration += 1;
            batches += 1;
        }
        if batches == 0 {
            return Err(CurvatureError::EmptyAccumulator {
                label: "training_loader",
            });
        }
        final_loss = epoch_loss / batches as f32;
        tracing::info!(epoch, loss = final_loss, lr = sgd.learning_rate(), "epoch finished");
    }
    if let Some(path) = settings.save_path.as_ref() {
        save_checkpoint(model, path, CheckpointFormat::from_path(path))?;
        tracing::info!(path = %path.display(), "checkpoint saved");
    }
    let eval_loader = eval_data.loader().batched(settings.batch_size.max(1));
    let acc = evaluate(model, &eval_loader)?;
    tracing::info!(accuracy = acc, "evaluation finished");
    Ok(TrainReport {
        final_loss,
        accuracy: acc,
        iterations: iteration,
    })
}

/// One sampled-label pass over the loader, feeding records into `sink`.
fn curvature_pass<M: Module + ?Sized>(
    model: &mut M,
    loss: &mut CrossEntropyLoss,
    loader: &DataLoader,
    rng: &mut StdRng,
    mut sink: impl FnMut(&[LayerRecord]) -> CurvatureResult<()>,
) -> CurvatureResult<()> {
    for batch in loader.iter() {
        let (input, _targets) = batch?;
        model.zero_accumulators()?;
        let logits = model.forward(&input)?;
        let labels = sample_labels(&logits, rng)?;
        let sampled = Tensor::one_hot(&labels, logits.shape().1)?;
        let grad = loss.backward(&logits, &sampled)?;
        let mut records = Vec::new();
        model.backward_recorded(&input, &grad, &mut |record| {
            records.push(record);
            Ok(())
        })?;
        sink(&records)?;
    }
    Ok(())
}

/// KFAC → EFB → INF curvature estimation on the training data followed by
/// Monte-Carlo calibration on the evaluation data.
pub fn run_bayesian_calibration<M: Module>(
    model: &mut M,
    train_data: &Dataset,
    eval_data: &Dataset,
    settings: &CalibrateSettings,
    config: &RunConfig,
) -> CurvatureResult<CalibrationOutcome> {
    if let Some(checkpoint) = settings.checkpoint.as_ref() {
        tracing::info!(path = %checkpoint.display(), "loading calibration checkpoint");
        load_checkpoint(model, checkpoint, CheckpointFormat::from_path(checkpoint))?;
    }
    let estimation_loader = train_data.loader().batched(settings.batch_size);
    let mut loss = CrossEntropyLoss::new();

    let mut kfac_rng = config.rng_for("kfac");
    let mut kfac = Kfac::new();
    curvature_pass(model, &mut loss, &estimation_loader, &mut kfac_rng, |records| {
        kfac.update(records)
    })?;
    tracing::info!(layers = kfac.layers().count(), "kfac factors accumulated");

    let mut efb_rng = config.rng_for("efb");
    let mut efb = Efb::from_kfac(&kfac)?;
    curvature_pass(model, &mut loss, &estimation_loader, &mut efb_rng, |records| {
        efb.update(records)
    })?;

    let mut inf = Inf::from_efb(&efb)?;
    inf.update(settings.rank)?;
    inf.invert(model, settings.add, settings.multiply)?;
    tracing::info!(rank = settings.rank, "inf estimator inverted");

    let eval_loader = eval_data.loader().batched(settings.batch_size);
    let mut sample_rng = config.rng_for("posterior");
    calibrate_posterior(
        model,
        &inf,
        &eval_loader,
        settings.samples,
        settings.bins,
        &mut sample_rng,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ft_nn::{gaussian_blobs, BlobConfig, Linear};
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    fn blob_data() -> (Dataset, Dataset) {
        let train = gaussian_blobs(&BlobConfig {
            classes: 2,
            samples_per_class: 16,
            height: 6,
            width: 6,
            noise_std: 0.05,
            seed: 11,
        })
        .unwrap();
        let eval = gaussian_blobs(&BlobConfig {
            classes: 2,
            samples_per_class: 8,
            height: 6,
            width: 6,
            noise_std: 0.05,
            seed: 12,
        })
        .unwrap();
        (train, eval)
    }

    fn fresh_model() -> Linear {
        let mut model = Linear::new("fc", 36, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        model.init_gaussian(0.1, &mut rng).unwrap();
        model
    }

    #[test]
    fn training_mode_reduces_loss_and_saves_checkpoints() {
        let (train, eval) = blob_data();
        let dir = tempdir().unwrap();
        let path = dir.path().join("fc.bin");
        let mut model = fresh_model();
        let settings = TrainSettings {
            epochs: 4,
            batch_size: 8,
            learning_rate: 0.5,
            momentum: 0.9,
            save_path: Some(path.clone()),
            ..TrainSettings::default()
        };
        let config = RunConfig::default();
        let outcome = run(
            &ExecutionMode::Train(settings),
            &mut model,
            &train,
            &eval,
            &config,
        )
        .unwrap();
        let RunOutcome::Trained(report) = outcome else {
            panic!("expected a training report");
        };
        assert!(report.final_loss.is_finite());
        assert!(report.iterations == 16);
        assert!((0.0..=1.0).contains(&report.accuracy));
        assert!(path.exists());
    }

    #[test]
    fn calibration_mode_runs_the_full_estimator_chain() {
        let (train, eval) = blob_data();
        let mut model = fresh_model();
        // Fit briefly so the posterior has a meaningful mode to wrap.
        let train_settings = TrainSettings {
            epochs: 3,
            batch_size: 8,
            learning_rate: 0.5,
            momentum: 0.9,
            ..TrainSettings::default()
        };
        let config = RunConfig { seed: 7, threads: None };
        run_training(&mut model, &train, &eval, &train_settings, &config).unwrap();

        let settings = CalibrateSettings {
            batch_size: 8,
            samples: 3,
            add: 1.0,
            multiply: 100.0,
            rank: 8,
            bins: 10,
            ..CalibrateSettings::default()
        };
        let outcome = run(
            &ExecutionMode::BayesianCalibrate(settings),
            &mut model,
            &train,
            &eval,
            &config,
        )
        .unwrap();
        let RunOutcome::Calibrated(calibration) = outcome else {
            panic!("expected a calibration outcome");
        };
        assert_eq!(calibration.samples, 3);
        assert!((0.0..=1.0).contains(&calibration.accuracy));
        assert!((0.0..=1.0).contains(&calibration.ece));
    }

    #[test]
    fn derived_rngs_differ_per_label() {
        let config = RunConfig::default();
        let mut a = config.rng_for("alpha");
        let mut b = config.rng_for("beta");
        use rand::Rng;
        let left: u64 = a.gen();
        let right: u64 = b.gen();
        assert_ne!(left, right);
    }
}
