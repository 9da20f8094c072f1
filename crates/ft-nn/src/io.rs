// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// On-disk encoding for a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Human-readable JSON, useful for diffing small models.
    Json,
    /// Compact bincode, the default for training checkpoints.
    Bincode,
}

impl CheckpointFormat {
    /// Guesses the format from a file extension, defaulting to bincode.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Bincode,
        }
    }
}

/// Serialised parameter snapshot. A sorted map keeps JSON output stable.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Checkpoint {
    parameters: BTreeMap<String, Tensor>,
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes the module's parameters to `path` in the requested format.
pub fn save_checkpoint<M: Module + ?Sized, P: AsRef<Path>>(
    module: &M,
    path: P,
    format: CheckpointFormat,
) -> PureResult<()> {
    let checkpoint = Checkpoint {
        parameters: module.state_dict()?.into_iter().collect(),
    };
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    match format {
        CheckpointFormat::Json => {
            serde_json::to_writer_pretty(writer, &checkpoint).map_err(serde_error)?
        }
        CheckpointFormat::Bincode => {
            bincode::serialize_into(writer, &checkpoint).map_err(serde_error)?
        }
    }
    Ok(())
}

/// Restores module parameters from a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
    format: CheckpointFormat,
) -> PureResult<()> {
    let state = load_state_dict(path, format)?;
    module.load_state_dict(&state.into_iter().collect())
}

/// Reads a raw state dictionary without applying it to a module.
pub fn load_state_dict<P: AsRef<Path>>(
    path: P,
    format: CheckpointFormat,
) -> PureResult<BTreeMap<String, Tensor>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let checkpoint: Checkpoint = match format {
        CheckpointFormat::Json => serde_json::from_reader(reader).map_err(serde_error)?,
        CheckpointFormat::Bincode => bincode::deserialize_from(reader).map_err(serde_error)?,
    };
    Ok(checkpoint.parameters)
}
