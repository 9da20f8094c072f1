// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Module, layer, loss, and data-loading surface for FisherTorch.
//!
//! The crate offers a lightweight `nn.Module` style API with explicit
//! backward passes. Recorded backward passes additionally expose per-layer
//! activation/gradient pairs, which is what the curvature estimators in
//! `ft-curvature` feed on.

pub mod dataset;
pub mod io;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod module;
pub mod optim;

pub use dataset::{gaussian_blobs, BlobConfig, DataLoader, Dataset};
pub use io::{load_checkpoint, save_checkpoint, CheckpointFormat};
pub use layers::{Conv2d, Linear, MaxPool2d, Relu};
pub use loss::{CrossEntropyLoss, Loss};
pub use metrics::{accuracy, calibration_curve, Calibration};
pub use models::{BaseNet, ClassifierConfig};
pub use module::{LayerRecord, LayerRecorder, Module, Parameter};
pub use optim::{Sgd, StepDecay};

pub use ft_tensor::{PureResult, Tensor, TensorError};
