// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter with an optional accumulated Euclidean gradient.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the accumulated gradient, if a backward pass has populated one.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a gradient contribution into the local buffer.
    pub fn accumulate(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Clears the accumulated gradient buffer.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Per-layer observation captured during a recorded backward pass.
///
/// `activations` holds the layer input as seen by the weight matrix (for
/// convolutions this is the stacked im2col patch matrix), `grad_output` the
/// gradient of the loss with respect to the layer's pre-activation output.
/// Curvature estimators consume these to build Kronecker-factored statistics.
#[derive(Clone, Debug)]
pub struct LayerRecord {
    pub layer: String,
    pub activations: Tensor,
    pub grad_output: Tensor,
}

/// Callback invoked once per trainable layer during a recorded backward pass.
pub type LayerRecorder<'a> = dyn FnMut(LayerRecord) -> PureResult<()> + 'a;

/// `nn.Module`-style trait with explicit forward and backward passes.
///
/// Implementations own their parameters and populate gradient buffers during
/// `backward`. Parameter enumeration order is part of a module's contract:
/// flattened gradient vectors and kernel coordinate partitions both rely on
/// `visit_parameters` walking the same order every time.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards, accumulating parameter gradients and
    /// returning the gradient with respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Backward pass that additionally surfaces a [`LayerRecord`] for every
    /// trainable layer. Parameter-free modules fall back to plain `backward`.
    fn backward_recorded(
        &mut self,
        input: &Tensor,
        grad_output: &Tensor,
        _recorder: &mut LayerRecorder<'_>,
    ) -> PureResult<Tensor> {
        self.backward(input, grad_output)
    }

    /// Visits immutable parameters in enumeration order.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters in enumeration order.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Clears every accumulated gradient buffer.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Ordered `(name, shape)` pairs for every parameter tensor.
    fn parameter_layout(&self) -> PureResult<Vec<(String, (usize, usize))>> {
        let mut layout = Vec::new();
        self.visit_parameters(&mut |param| {
            layout.push((param.name().to_string(), param.value().shape()));
            Ok(())
        })?;
        Ok(layout)
    }

    /// Total number of trainable scalars.
    fn parameter_dimension(&self) -> PureResult<usize> {
        let mut total = 0;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_accumulates_and_clears() {
        let mut param = Parameter::new("w", Tensor::zeros(2, 2).unwrap());
        let update = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        param.accumulate(&update).unwrap();
        param.accumulate(&update).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[2.0, 4.0, 6.0, 8.0]);
        param.zero_gradient();
        assert_eq!(param.gradient().unwrap().squared_l2_norm(), 0.0);
    }

    #[test]
    fn parameter_rejects_mismatched_updates() {
        let mut param = Parameter::new("w", Tensor::zeros(2, 2).unwrap());
        let update = Tensor::zeros(1, 2).unwrap();
        assert!(matches!(
            param.accumulate(&update),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
