// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Stochastic gradient descent with classical momentum.
///
/// Velocity buffers are keyed by parameter name, so the optimiser survives
/// checkpoint reloads as long as the module keeps its naming stable.
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<String, Tensor>,
}

impl Sgd {
    /// Creates an optimiser with the provided learning rate and momentum.
    pub fn new(learning_rate: f32, momentum: f32) -> PureResult<Self> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(TensorError::NonFiniteValue {
                label: "sgd_momentum",
                value: momentum,
            });
        }
        Ok(Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        })
    }

    /// Returns the current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Overrides the learning rate, validating it first.
    pub fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        self.learning_rate = learning_rate;
        Ok(())
    }

    /// Applies one update using the gradients accumulated on the module.
    pub fn step<M: Module + ?Sized>(&mut self, module: &mut M) -> PureResult<()> {
        let lr = self.learning_rate;
        let momentum = self.momentum;
        let velocity = &mut self.velocity;
        module.visit_parameters_mut(&mut |param| {
            let Some(gradient) = param.gradient().cloned() else {
                return Ok(());
            };
            let (rows, cols) = gradient.shape();
            let mut update = match velocity.remove(param.name()) {
                Some(previous) => previous.scale(momentum)?,
                None => Tensor::zeros(rows, cols)?,
            };
            update.add_scaled(&gradient, 1.0)?;
            param.value_mut().add_scaled(&update, -lr)?;
            velocity.insert(param.name().to_string(), update);
            Ok(())
        })
    }

    /// Clears every gradient buffer on the module.
    pub fn zero_grad<M: Module + ?Sized>(&self, module: &mut M) -> PureResult<()> {
        module.zero_accumulators()
    }
}

/// Step-decay schedule: the base rate is multiplied by `gamma` once per
/// crossed milestone iteration.
#[derive(Clone, Debug)]
pub struct StepDecay {
    base_lr: f32,
    gamma: f32,
    milestones: Vec<usize>,
}

impl StepDecay {
    /// Creates a schedule from a base rate, decay factor, and milestone list.
    pub fn new(base_lr: f32, gamma: f32, milestones: Vec<usize>) -> PureResult<Self> {
        if base_lr <= 0.0 || !base_lr.is_finite() {
            return Err(TensorError::NonPositiveLearningRate { rate: base_lr });
        }
        if gamma <= 0.0 || gamma > 1.0 {
            return Err(TensorError::NonFiniteValue {
                label: "step_decay_gamma",
                value: gamma,
            });
        }
        Ok(Self {
            base_lr,
            gamma,
            milestones,
        })
    }

    /// Learning rate in effect at the given iteration.
    pub fn learning_rate_at(&self, iteration: usize) -> f32 {
        let crossed = self
            .milestones
            .iter()
            .filter(|&&milestone| iteration >= milestone)
            .count();
        self.base_lr * self.gamma.powi(crossed as i32)
    }

    /// Pushes the scheduled rate for `iteration` into the optimiser.
    pub fn apply(&self, optimizer: &mut Sgd, iteration: usize) -> PureResult<()> {
        optimizer.set_learning_rate(self.learning_rate_at(iteration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sgd_moves_parameters_against_gradient() {
        let mut layer = Linear::new("fc", 2, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        layer.init_gaussian(0.1, &mut rng).unwrap();
        let input = Tensor::from_vec(1, 2, vec![1.0, 1.0]).unwrap();
        let grad = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let _ = layer.backward(&input, &grad).unwrap();
        let before = layer.weight().value().clone();
        let mut sgd = Sgd::new(0.1, 0.0).unwrap();
        sgd.step(&mut layer).unwrap();
        let after = layer.weight().value();
        assert!((after.data()[0] - (before.data()[0] - 0.1)).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut layer = Linear::new("fc", 1, 1).unwrap();
        let input = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let grad = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let mut sgd = Sgd::new(1.0, 0.5).unwrap();
        let _ = layer.backward(&input, &grad).unwrap();
        sgd.step(&mut layer).unwrap();
        layer.zero_accumulators().unwrap();
        let _ = layer.backward(&input, &grad).unwrap();
        sgd.step(&mut layer).unwrap();
        // First step moves by 1.0, second by 1.0 + 0.5 of the first velocity.
        assert!((layer.weight().value().data()[0] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn step_decay_crosses_milestones() {
        let schedule = StepDecay::new(1.0, 0.1, vec![10, 20]).unwrap();
        assert!((schedule.learning_rate_at(0) - 1.0).abs() < 1e-9);
        assert!((schedule.learning_rate_at(10) - 0.1).abs() < 1e-9);
        assert!((schedule.learning_rate_at(25) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn invalid_rates_are_rejected() {
        assert!(Sgd::new(0.0, 0.9).is_err());
        assert!(StepDecay::new(0.1, 1.5, vec![]).is_err());
    }
}
