// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

type Sample = (Tensor, Tensor);

/// In-memory dataset pairing input rows with one-hot target rows.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Builds a dataset from an owning vector of `(input, target)` pairs.
    pub fn from_vec(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Appends a new sample.
    pub fn push(&mut self, input: Tensor, target: Tensor) {
        self.samples.push((input, target));
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no samples are registered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Creates a batching [`DataLoader`] over cloned samples.
    pub fn loader(&self) -> DataLoader {
        DataLoader::new(self.samples.clone())
    }
}

/// Builder-style loader with deterministic shuffling and fixed batch sizes.
#[derive(Clone, Debug)]
pub struct DataLoader {
    samples: Vec<Sample>,
    order: Vec<usize>,
    batch_size: usize,
}

impl DataLoader {
    fn new(samples: Vec<Sample>) -> Self {
        let order = (0..samples.len()).collect();
        Self {
            samples,
            order,
            batch_size: 1,
        }
    }

    /// Number of individual samples referenced by the loader.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when the underlying dataset holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of batches a full iteration will produce.
    pub fn batch_count(&self) -> usize {
        if self.samples.is_empty() {
            0
        } else {
            (self.samples.len() + self.batch_size - 1) / self.batch_size
        }
    }

    /// Deterministically reshuffles the visitation order with the given seed.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self
    }

    /// Updates the loader to emit batches of `batch_size` samples.
    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Iterates over stacked `(input, target)` batches.
    pub fn iter(&self) -> Batches<'_> {
        Batches {
            loader: self,
            position: 0,
        }
    }
}

/// Iterator over mini-batches produced by a [`DataLoader`].
pub struct Batches<'a> {
    loader: &'a DataLoader,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.loader.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.loader.order.len());
        let indices = &self.loader.order[self.position..end];
        self.position = end;
        let mut inputs = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        for &idx in indices {
            let (input, target) = &self.loader.samples[idx];
            inputs.push(input.clone());
            targets.push(target.clone());
        }
        let input = match Tensor::cat_rows(&inputs) {
            Ok(tensor) => tensor,
            Err(err) => return Some(Err(err)),
        };
        let target = match Tensor::cat_rows(&targets) {
            Ok(tensor) => tensor,
            Err(err) => return Some(Err(err)),
        };
        Some(Ok((input, target)))
    }
}

/// Configuration for the synthetic Gaussian-blob classification set.
///
/// Real image corpora stay outside this crate; the blobs give every analysis
/// and calibration path a deterministic stand-in with the same `(image,
/// one-hot)` surface a disk-backed loader would provide.
#[derive(Clone, Debug)]
pub struct BlobConfig {
    pub classes: usize,
    pub samples_per_class: usize,
    pub height: usize,
    pub width: usize,
    pub noise_std: f32,
    pub seed: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            classes: 10,
            samples_per_class: 32,
            height: 28,
            width: 28,
            noise_std: 0.15,
            seed: 42,
        }
    }
}

/// Generates a deterministic Gaussian-blob image classification dataset.
///
/// Each class owns a bright blob at a class-specific grid location; samples
/// add seeded Gaussian noise on top.
pub fn gaussian_blobs(config: &BlobConfig) -> PureResult<Dataset> {
    if config.classes == 0 || config.samples_per_class == 0 {
        return Err(TensorError::EmptyInput("blob_dataset"));
    }
    if config.height < 4 || config.width < 4 {
        return Err(TensorError::InvalidDimensions {
            rows: config.height,
            cols: config.width,
        });
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut dataset = Dataset::new();
    let grid = (config.classes as f32).sqrt().ceil() as usize;
    for class in 0..config.classes {
        let cy = (class / grid) % grid;
        let cx = class % grid;
        let center_y = (cy * config.height / grid + config.height / (2 * grid)) as f32;
        let center_x = (cx * config.width / grid + config.width / (2 * grid)) as f32;
        let sigma = config.height.min(config.width) as f32 / (grid as f32 * 2.5);
        for _ in 0..config.samples_per_class {
            let noise =
                Tensor::random_normal(1, config.height * config.width, config.noise_std, &mut rng)?;
            let image = Tensor::from_fn(1, config.height * config.width, |_, idx| {
                let y = (idx / config.width) as f32;
                let x = (idx % config.width) as f32;
                let d2 = (y - center_y).powi(2) + (x - center_x).powi(2);
                (-d2 / (2.0 * sigma * sigma)).exp() + noise.data()[idx]
            })?;
            let target = Tensor::one_hot(&[class], config.classes)?;
            dataset.push(image, target);
        }
    }
    // Mix classes so small batches do not stay single-class.
    let mut order: Vec<usize> = (0..dataset.samples.len()).collect();
    let mut mix = StdRng::seed_from_u64(config.seed ^ 0x9e37_79b9_7f4a_7c15);
    order.shuffle(&mut mix);
    let samples = order
        .into_iter()
        .map(|idx| dataset.samples[idx].clone())
        .collect();
    Ok(Dataset::from_vec(samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_batches_and_shuffles_deterministically() {
        let samples: Vec<(Tensor, Tensor)> = (0..6)
            .map(|i| {
                (
                    Tensor::from_vec(1, 1, vec![i as f32]).unwrap(),
                    Tensor::one_hot(&[i % 2], 2).unwrap(),
                )
            })
            .collect();
        let dataset = Dataset::from_vec(samples);
        let first: Vec<f32> = dataset
            .loader()
            .shuffle(9)
            .batched(2)
            .iter()
            .map(|batch| batch.unwrap().0.data()[0])
            .collect();
        let second: Vec<f32> = dataset
            .loader()
            .shuffle(9)
            .batched(2)
            .iter()
            .map(|batch| batch.unwrap().0.data()[0])
            .collect();
        assert_eq!(first, second);
        assert_eq!(dataset.loader().batched(4).batch_count(), 2);
    }

    #[test]
    fn batches_stack_rows() {
        let dataset = Dataset::from_vec(
            (0..5)
                .map(|i| {
                    (
                        Tensor::from_vec(1, 3, vec![i as f32; 3]).unwrap(),
                        Tensor::one_hot(&[0], 2).unwrap(),
                    )
                })
                .collect(),
        );
        let batches: Vec<_> = dataset
            .loader()
            .batched(2)
            .iter()
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].0.shape(), (2, 3));
        assert_eq!(batches[2].0.shape(), (1, 3));
    }

    #[test]
    fn blobs_are_reproducible_and_balanced() {
        let config = BlobConfig {
            classes: 4,
            samples_per_class: 8,
            height: 8,
            width: 8,
            noise_std: 0.05,
            seed: 7,
        };
        let a = gaussian_blobs(&config).unwrap();
        let b = gaussian_blobs(&config).unwrap();
        assert_eq!(a.len(), 32);
        for (lhs, rhs) in a.samples.iter().zip(b.samples.iter()) {
            assert_eq!(lhs.0, rhs.0);
            assert_eq!(lhs.1, rhs.1);
        }
    }
}
