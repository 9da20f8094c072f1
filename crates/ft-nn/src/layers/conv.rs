// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{LayerRecord, LayerRecorder, Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

/// Two-dimensional convolution over channel-major flattened images.
///
/// Input rows are `in_channels * height * width` scalars; output rows are
/// `out_channels * out_height * out_width`. The weight is stored as
/// `(out_channels, in_channels * kernel * kernel)` so each filter occupies one
/// contiguous row-major block, matching the kernel coordinate convention used
/// by the dominance analysis. Stride is 1 and there is no padding; the
/// reference classifiers shrink spatial extent through pooling instead.
#[derive(Debug)]
pub struct Conv2d {
    name: String,
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    input_hw: (usize, usize),
}

impl Conv2d {
    /// Creates a zero-initialised convolution for a fixed input extent.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        let (height, width) = input_hw;
        if in_channels == 0 || out_channels == 0 || kernel == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: out_channels,
                cols: in_channels * kernel * kernel,
            });
        }
        if kernel > height || kernel > width {
            return Err(TensorError::InvalidDimensions {
                rows: height,
                cols: width,
            });
        }
        let name = name.into();
        Ok(Self {
            weight: Parameter::new(
                format!("{name}::weight"),
                Tensor::zeros(out_channels, in_channels * kernel * kernel)?,
            ),
            bias: Parameter::new(format!("{name}::bias"), Tensor::zeros(1, out_channels)?),
            name,
            in_channels,
            out_channels,
            kernel,
            input_hw,
        })
    }

    /// Redraws the filter bank from a centred Gaussian; the bias stays zero.
    pub fn init_gaussian(&mut self, std: f32, rng: &mut StdRng) -> PureResult<()> {
        let (rows, cols) = self.weight.value().shape();
        *self.weight.value_mut() = Tensor::random_normal(rows, cols, std, rng)?;
        Ok(())
    }

    /// Logical layer name shared by the weight and bias parameters.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    /// Spatial extent of the produced feature maps.
    pub fn output_hw(&self) -> (usize, usize) {
        (
            self.input_hw.0 - self.kernel + 1,
            self.input_hw.1 - self.kernel + 1,
        )
    }

    /// Flattened input row width this layer expects.
    pub fn input_features(&self) -> usize {
        self.in_channels * self.input_hw.0 * self.input_hw.1
    }

    /// Flattened output row width this layer produces.
    pub fn output_features(&self) -> usize {
        let (oh, ow) = self.output_hw();
        self.out_channels * oh * ow
    }

    fn positions(&self) -> usize {
        let (oh, ow) = self.output_hw();
        oh * ow
    }

    fn check_input(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.input_features() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.input_features()),
            });
        }
        Ok(())
    }

    /// Unfolds every sample into its patch matrix and stacks them row-wise,
    /// producing a `(batch * positions, in_channels * kernel * kernel)` tensor.
    fn im2col(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, _) = input.shape();
        let (height, width) = self.input_hw;
        let (oh, ow) = self.output_hw();
        let k = self.kernel;
        let span = self.in_channels * k * k;
        let mut data = Vec::with_capacity(batch * oh * ow * span);
        for sample in 0..batch {
            let row = input.row(sample)?;
            for y in 0..oh {
                for x in 0..ow {
                    for cin in 0..self.in_channels {
                        let plane = &row[cin * height * width..(cin + 1) * height * width];
                        for ky in 0..k {
                            let line = &plane[(y + ky) * width + x..(y + ky) * width + x + k];
                            data.extend_from_slice(line);
                        }
                    }
                }
            }
        }
        Tensor::from_vec(batch * oh * ow, span, data)
    }

    /// Gathers the per-position gradient matrix from channel-major output rows.
    fn gather_position_grads(&self, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        if cols != self.output_features() {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.output_features()),
            });
        }
        let positions = self.positions();
        let mut data = vec![0.0f32; batch * positions * self.out_channels];
        for sample in 0..batch {
            let row = grad_output.row(sample)?;
            for c in 0..self.out_channels {
                for p in 0..positions {
                    data[(sample * positions + p) * self.out_channels + c] =
                        row[c * positions + p];
                }
            }
        }
        Tensor::from_vec(batch * positions, self.out_channels, data)
    }

    fn run_backward(
        &mut self,
        input: &Tensor,
        grad_output: &Tensor,
        mut recorder: Option<&mut LayerRecorder<'_>>,
    ) -> PureResult<Tensor> {
        self.check_input(input)?;
        let patches = self.im2col(input)?;
        let grad_pos = self.gather_position_grads(grad_output)?;
        if let Some(recorder) = recorder.as_deref_mut() {
            recorder(LayerRecord {
                layer: self.name.clone(),
                activations: patches.clone(),
                grad_output: grad_pos.clone(),
            })?;
        }

        let grad_w = grad_pos.transpose().matmul(&patches)?;
        self.weight.accumulate(&grad_w)?;
        let summed = grad_pos.sum_axis0();
        let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
        self.bias.accumulate(&grad_b)?;

        // Fold the patch gradients back onto the input grid.
        let grad_patches = grad_pos.matmul(self.weight.value())?;
        let (batch, _) = input.shape();
        let (height, width) = self.input_hw;
        let (oh, ow) = self.output_hw();
        let k = self.kernel;
        let mut grad_input = Tensor::zeros(batch, self.input_features())?;
        {
            let out = grad_input.data_mut();
            let features = self.in_channels * height * width;
            for sample in 0..batch {
                for y in 0..oh {
                    for x in 0..ow {
                        let patch = grad_patches.row(sample * oh * ow + y * ow + x)?;
                        for cin in 0..self.in_channels {
                            for ky in 0..k {
                                for kx in 0..k {
                                    out[sample * features
                                        + cin * height * width
                                        + (y + ky) * width
                                        + (x + kx)] += patch[cin * k * k + ky * k + kx];
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(grad_input)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        let (batch, _) = input.shape();
        let positions = self.positions();
        let patches = self.im2col(input)?;
        let mut pos_out = patches.matmul_nt(self.weight.value())?;
        pos_out.add_row_inplace(self.bias.value().data())?;
        let mut out = Tensor::zeros(batch, self.output_features())?;
        {
            let dst = out.data_mut();
            let features = self.out_channels * positions;
            for sample in 0..batch {
                for p in 0..positions {
                    let src = pos_out.row(sample * positions + p)?;
                    for (c, &value) in src.iter().enumerate() {
                        dst[sample * features + c * positions + p] = value;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.run_backward(input, grad_output, None)
    }

    fn backward_recorded(
        &mut self,
        input: &Tensor,
        grad_output: &Tensor,
        recorder: &mut LayerRecorder<'_>,
    ) -> PureResult<Tensor> {
        self.run_backward(input, grad_output, Some(recorder))
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

/// Non-overlapping max pooling over channel-major feature maps.
#[derive(Clone, Debug)]
pub struct MaxPool2d {
    channels: usize,
    input_hw: (usize, usize),
    window: usize,
}

impl MaxPool2d {
    /// Creates a pooling stage with a square window and matching stride.
    pub fn new(channels: usize, input_hw: (usize, usize), window: usize) -> PureResult<Self> {
        if channels == 0 || window == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: window,
            });
        }
        if window > input_hw.0 || window > input_hw.1 {
            return Err(TensorError::InvalidDimensions {
                rows: input_hw.0,
                cols: input_hw.1,
            });
        }
        Ok(Self {
            channels,
            input_hw,
            window,
        })
    }

    /// Spatial extent after pooling (floor division, trailing cells dropped).
    pub fn output_hw(&self) -> (usize, usize) {
        (self.input_hw.0 / self.window, self.input_hw.1 / self.window)
    }

    /// Flattened input row width this stage expects.
    pub fn input_features(&self) -> usize {
        self.channels * self.input_hw.0 * self.input_hw.1
    }

    /// Flattened output row width this stage produces.
    pub fn output_features(&self) -> usize {
        let (oh, ow) = self.output_hw();
        self.channels * oh * ow
    }

    fn check_input(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.input_features() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.input_features()),
            });
        }
        Ok(())
    }

    /// Locates the flat input offset of the window maximum for one cell.
    fn argmax(&self, plane: &[f32], oy: usize, ox: usize) -> (usize, f32) {
        let (_, width) = self.input_hw;
        let mut best_idx = (oy * self.window) * width + ox * self.window;
        let mut best = plane[best_idx];
        for dy in 0..self.window {
            for dx in 0..self.window {
                let idx = (oy * self.window + dy) * width + ox * self.window + dx;
                if plane[idx] > best {
                    best = plane[idx];
                    best_idx = idx;
                }
            }
        }
        (best_idx, best)
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        let (batch, _) = input.shape();
        let (height, width) = self.input_hw;
        let (oh, ow) = self.output_hw();
        let mut out = Tensor::zeros(batch, self.output_features())?;
        {
            let dst = out.data_mut();
            for sample in 0..batch {
                let row = input.row(sample)?;
                for c in 0..self.channels {
                    let plane = &row[c * height * width..(c + 1) * height * width];
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let (_, best) = self.argmax(plane, oy, ox);
                            dst[sample * self.output_features() + c * oh * ow + oy * ow + ox] =
                                best;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        if grad_output.shape() != (input.shape().0, self.output_features()) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.shape().0, self.output_features()),
            });
        }
        let (batch, _) = input.shape();
        let (height, width) = self.input_hw;
        let (oh, ow) = self.output_hw();
        let mut grad_input = Tensor::zeros(batch, self.input_features())?;
        {
            let dst = grad_input.data_mut();
            for sample in 0..batch {
                let row = input.row(sample)?;
                let grads = grad_output.row(sample)?;
                for c in 0..self.channels {
                    let plane = &row[c * height * width..(c + 1) * height * width];
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let (best_idx, _) = self.argmax(plane, oy, ox);
                            dst[sample * self.input_features() + c * height * width + best_idx] +=
                                grads[c * oh * ow + oy * ow + ox];
                        }
                    }
                }
            }
        }
        Ok(grad_input)
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

    fn unit_filter_conv() -> Conv2d {
        let mut conv = Conv2d::new("conv", 1, 1, 2, (3, 3)).unwrap();
        conv.weight
            .load_value(&Tensor::from_vec(1, 4, vec![1.0, 1.0, 1.0, 1.0]).unwrap())
            .unwrap();
        conv.bias
            .load_value(&Tensor::from_vec(1, 1, vec![0.5]).unwrap())
            .unwrap();
        conv
    }

    #[test]
    fn conv_forward_sums_windows() {
        let conv = unit_filter_conv();
        let input = Tensor::from_vec(1, 9, (1..=9).map(|v| v as f32).collect()).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.data(), &[12.5, 16.5, 24.5, 28.5]);
    }

    #[test]
    fn conv_backward_matches_hand_computation() {
        let mut conv = unit_filter_conv();
        let input = Tensor::from_vec(1, 9, (1..=9).map(|v| v as f32).collect()).unwrap();
        let grad = Tensor::from_vec(1, 4, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let grad_input = conv.backward(&input, &grad).unwrap();
        assert_eq!(
            conv.weight().gradient().unwrap().data(),
            &[12.0, 16.0, 24.0, 28.0]
        );
        assert_eq!(conv.bias().gradient().unwrap().data(), &[4.0]);
        // Each pixel receives one unit per window that covers it.
        assert_eq!(
            grad_input.data(),
            &[1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn conv_records_patch_statistics() {
        let mut conv = unit_filter_conv();
        let input = Tensor::from_vec(1, 9, (1..=9).map(|v| v as f32).collect()).unwrap();
        let grad = Tensor::from_vec(1, 4, vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let mut records = Vec::new();
        conv.backward_recorded(&input, &grad, &mut |record| {
            records.push(record);
            Ok(())
        })
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].activations.shape(), (4, 4));
        assert_eq!(records[0].grad_output.shape(), (4, 1));
        assert_eq!(records[0].activations.row(0).unwrap(), &[1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn maxpool_forwards_maxima_and_routes_gradients() {
        let mut pool = MaxPool2d::new(1, (4, 4), 2).unwrap();
        let input = Tensor::from_vec(
            1,
            16,
            vec![
                1.0, 2.0, 0.0, 0.0, //
                3.0, 4.0, 0.0, 5.0, //
                6.0, 0.0, 7.0, 0.0, //
                0.0, 0.0, 0.0, 8.0,
            ],
        )
        .unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.data(), &[4.0, 5.0, 6.0, 8.0]);
        let grad = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad_input = pool.backward(&input, &grad).unwrap();
        assert_eq!(grad_input.data()[5], 1.0);
        assert_eq!(grad_input.data()[7], 2.0);
        assert_eq!(grad_input.data()[8], 3.0);
        assert_eq!(grad_input.data()[15], 4.0);
    }
}
