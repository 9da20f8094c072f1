// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod conv;
pub mod linear;

pub use conv::{Conv2d, MaxPool2d};
pub use linear::Linear;

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor};

/// Parameter-free rectified linear activation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Relu;

impl Relu {
    /// Creates the activation.
    pub fn new() -> Self {
        Self
    }
}

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut out = input.clone();
        out.relu_inplace();
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(crate::TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let data = input
            .data()
            .iter()
            .zip(grad_output.data().iter())
            .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 })
            .collect();
        Tensor::from_vec(input.shape().0, input.shape().1, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_masks_forward_and_backward() {
        let mut relu = Relu::new();
        let input = Tensor::from_vec(1, 4, vec![-1.0, 2.0, 0.0, 3.0]).unwrap();
        let out = relu.forward(&input).unwrap();
        assert_eq!(out.data(), &[0.0, 2.0, 0.0, 3.0]);
        let grad = Tensor::from_vec(1, 4, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let back = relu.backward(&input, &grad).unwrap();
        assert_eq!(back.data(), &[0.0, 1.0, 0.0, 1.0]);
    }
}
