// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{LayerRecord, LayerRecorder, Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

/// Fully-connected layer storing its weight as `(output_dim, input_dim)` so
/// the row-major flattening order matches the kernel coordinate convention:
/// one contiguous block of `input_dim` scalars per output unit.
#[derive(Debug)]
pub struct Linear {
    name: String,
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a zero-initialised linear layer.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: output_dim,
                cols: input_dim,
            });
        }
        let name = name.into();
        Ok(Self {
            weight: Parameter::new(
                format!("{name}::weight"),
                Tensor::zeros(output_dim, input_dim)?,
            ),
            bias: Parameter::new(format!("{name}::bias"), Tensor::zeros(1, output_dim)?),
            name,
        })
    }

    /// Redraws the weight matrix from a centred Gaussian; the bias stays zero.
    pub fn init_gaussian(&mut self, std: f32, rng: &mut StdRng) -> PureResult<()> {
        let (rows, cols) = self.weight.value().shape();
        *self.weight.value_mut() = Tensor::random_normal(rows, cols, std, rng)?;
        Ok(())
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    /// Logical layer name shared by the weight and bias parameters.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().1 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul_nt(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = grad_output.transpose().matmul(input)?;
        self.weight.accumulate(&grad_w)?;

        let summed = grad_output.sum_axis0();
        let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
        self.bias.accumulate(&grad_b)?;

        grad_output.matmul(self.weight.value())
    }

    fn backward_recorded(
        &mut self,
        input: &Tensor,
        grad_output: &Tensor,
        recorder: &mut LayerRecorder<'_>,
    ) -> PureResult<Tensor> {
        recorder(LayerRecord {
            layer: self.name.clone(),
            activations: input.clone(),
            grad_output: grad_output.clone(),
        })?;
        self.backward(input, grad_output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}
