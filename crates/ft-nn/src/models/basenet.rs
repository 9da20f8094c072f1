// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::layers::{Conv2d, Linear, MaxPool2d, Relu};
use crate::module::{LayerRecorder, Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

/// Architecture description for the LeNet-style reference classifiers.
///
/// Curvature tooling derives kernel coordinate partitions from the resulting
/// parameter layout, so the description is explicit data instead of a
/// hard-coded table inside the analysis code.
#[derive(Clone, Copy, Debug)]
pub struct ClassifierConfig {
    pub input_hw: (usize, usize),
    pub conv1_filters: usize,
    pub conv2_filters: usize,
    pub kernel: usize,
    pub hidden: usize,
    pub classes: usize,
}

impl ClassifierConfig {
    /// The 15 080-parameter dominance-analysis reference network.
    pub fn basenet_15k() -> Self {
        Self {
            input_hw: (28, 28),
            conv1_filters: 5,
            conv2_filters: 10,
            kernel: 5,
            hidden: 80,
            classes: 10,
        }
    }

    /// The ~750-parameter variant used for the cheap dense-inverse studies.
    pub fn basenet_750() -> Self {
        Self {
            input_hw: (28, 28),
            conv1_filters: 2,
            conv2_filters: 3,
            kernel: 5,
            hidden: 9,
            classes: 10,
        }
    }
}

/// Two conv/pool stages followed by two fully-connected layers, ReLU
/// throughout. Inputs are single-channel channel-major flattened images.
#[derive(Debug)]
pub struct BaseNet {
    conv1: Conv2d,
    pool1: MaxPool2d,
    conv2: Conv2d,
    pool2: MaxPool2d,
    fc1: Linear,
    fc2: Linear,
}

impl BaseNet {
    /// Builds the network described by `config` with zeroed parameters.
    pub fn new(config: &ClassifierConfig) -> PureResult<Self> {
        let conv1 = Conv2d::new(
            "conv1",
            1,
            config.conv1_filters,
            config.kernel,
            config.input_hw,
        )?;
        let pool1 = MaxPool2d::new(config.conv1_filters, conv1.output_hw(), 2)?;
        let conv2 = Conv2d::new(
            "conv2",
            config.conv1_filters,
            config.conv2_filters,
            config.kernel,
            pool1.output_hw(),
        )?;
        let pool2 = MaxPool2d::new(config.conv2_filters, conv2.output_hw(), 2)?;
        let fc1 = Linear::new("fc1", pool2.output_features(), config.hidden)?;
        let fc2 = Linear::new("fc2", config.hidden, config.classes)?;
        Ok(Self {
            conv1,
            pool1,
            conv2,
            pool2,
            fc1,
            fc2,
        })
    }

    /// Convenience constructor for the 15 080-parameter reference network.
    pub fn basenet_15k() -> PureResult<Self> {
        Self::new(&ClassifierConfig::basenet_15k())
    }

    /// Convenience constructor for the ~750-parameter variant.
    pub fn basenet_750() -> PureResult<Self> {
        Self::new(&ClassifierConfig::basenet_750())
    }

    /// Redraws every weight matrix from a centred Gaussian; biases stay zero.
    pub fn init_gaussian(&mut self, std: f32, rng: &mut StdRng) -> PureResult<()> {
        self.conv1.init_gaussian(std, rng)?;
        self.conv2.init_gaussian(std, rng)?;
        self.fc1.init_gaussian(std, rng)?;
        self.fc2.init_gaussian(std, rng)?;
        Ok(())
    }

    /// Flattened input row width the network expects.
    pub fn input_features(&self) -> usize {
        self.conv1.input_features()
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

    /// Runs the forward chain keeping every pre-activation for backward reuse.
    fn trace(&self, input: &Tensor) -> PureResult<ForwardTrace> {
        let relu = Relu::new();
        let z1 = self.conv1.forward(input)?;
        let r1 = relu.forward(&z1)?;
        let p1 = self.pool1.forward(&r1)?;
        let z2 = self.conv2.forward(&p1)?;
        let r2 = relu.forward(&z2)?;
        let p2 = self.pool2.forward(&r2)?;
        let z3 = self.fc1.forward(&p2)?;
        let r3 = relu.forward(&z3)?;
        let logits = self.fc2.forward(&r3)?;
        Ok(ForwardTrace {
            z1,
            r1,
            p1,
            z2,
            r2,
            p2,
            z3,
            r3,
            logits,
        })
    }

    fn run_backward(
        &mut self,
        input: &Tensor,
        grad_output: &Tensor,
        mut recorder: Option<&mut LayerRecorder<'_>>,
    ) -> PureResult<Tensor> {
        self.check_input(input)?;
        let trace = self.trace(input)?;
        let mut relu = Relu::new();

        let g_r3 = match recorder.as_deref_mut() {
            Some(rec) => self.fc2.backward_recorded(&trace.r3, grad_output, rec)?,
            None => self.fc2.backward(&trace.r3, grad_output)?,
        };
        let g_z3 = relu.backward(&trace.z3, &g_r3)?;
        let g_p2 = match recorder.as_deref_mut() {
            Some(rec) => self.fc1.backward_recorded(&trace.p2, &g_z3, rec)?,
            None => self.fc1.backward(&trace.p2, &g_z3)?,
        };
        let g_r2 = self.pool2.backward(&trace.r2, &g_p2)?;
        let g_z2 = relu.backward(&trace.z2, &g_r2)?;
        let g_p1 = match recorder.as_deref_mut() {
            Some(rec) => self.conv2.backward_recorded(&trace.p1, &g_z2, rec)?,
            None => self.conv2.backward(&trace.p1, &g_z2)?,
        };
        let g_r1 = self.pool1.backward(&trace.r1, &g_p1)?;
        let g_z1 = relu.backward(&trace.z1, &g_r1)?;
        match recorder.as_deref_mut() {
            Some(rec) => self.conv1.backward_recorded(input, &g_z1, rec),
            None => self.conv1.backward(input, &g_z1),
        }
    }
}

struct ForwardTrace {
    z1: Tensor,
    r1: Tensor,
    p1: Tensor,
    z2: Tensor,
    r2: Tensor,
    p2: Tensor,
    z3: Tensor,
    r3: Tensor,
    logits: Tensor,
}

impl Module for BaseNet {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        Ok(self.trace(input)?.logits)
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
        self.conv1.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        self.fc1.visit_parameters(visitor)?;
        self.fc2.visit_parameters(visitor)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        self.fc1.visit_parameters_mut(visitor)?;
        self.fc2.visit_parameters_mut(visitor)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn basenet_15k_has_the_reference_parameter_count() {
        let net = BaseNet::basenet_15k().unwrap();
        assert_eq!(net.parameter_dimension().unwrap(), 15_080);
    }

    #[test]
    fn basenet_750_is_in_the_small_regime() {
        let net = BaseNet::basenet_750().unwrap();
        assert_eq!(net.parameter_dimension().unwrap(), 746);
    }

    #[test]
    fn layout_enumerates_layers_in_forward_order() {
        let net = BaseNet::basenet_15k().unwrap();
        let layout = net.parameter_layout().unwrap();
        let names: Vec<&str> = layout.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "conv1::weight",
                "conv1::bias",
                "conv2::weight",
                "conv2::bias",
                "fc1::weight",
                "fc1::bias",
                "fc2::weight",
                "fc2::bias",
            ]
        );
        assert_eq!(layout[0].1, (5, 25));
        assert_eq!(layout[4].1, (80, 160));
    }

    #[test]
    fn forward_and_backward_shapes_line_up() {
        let mut net = BaseNet::basenet_750().unwrap();
        let mut rng = StdRng::seed_from_u64(13);
        net.init_gaussian(0.2, &mut rng).unwrap();
        let input = Tensor::random_normal(3, 784, 1.0, &mut rng).unwrap();
        let logits = net.forward(&input).unwrap();
        assert_eq!(logits.shape(), (3, 10));
        let grad = Tensor::from_fn(3, 10, |_, _| 0.1).unwrap();
        let grad_input = net.backward(&input, &grad).unwrap();
        assert_eq!(grad_input.shape(), (3, 784));
        net.visit_parameters(&mut |param| {
            assert!(param.gradient().is_some(), "{} missing grad", param.name());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn recorded_backward_emits_one_record_per_trainable_layer() {
        let mut net = BaseNet::basenet_750().unwrap();
        let mut rng = StdRng::seed_from_u64(29);
        net.init_gaussian(0.2, &mut rng).unwrap();
        let input = Tensor::random_normal(2, 784, 1.0, &mut rng).unwrap();
        let grad = Tensor::from_fn(2, 10, |_, _| 0.05).unwrap();
        let mut layers = Vec::new();
        net.backward_recorded(&input, &grad, &mut |record| {
            layers.push(record.layer.clone());
            Ok(())
        })
        .unwrap();
        layers.sort();
        assert_eq!(layers, vec!["conv1", "conv2", "fc1", "fc2"]);
    }
}
