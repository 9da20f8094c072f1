// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Raw matrix persistence for saved Fisher estimates.

use crate::{CurvatureError, CurvatureResult};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// On-disk encoding for a saved matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatrixFormat {
    Json,
    Bincode,
}

impl MatrixFormat {
    /// Guesses the format from a file extension, defaulting to bincode.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Bincode,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DiskMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

fn io_error(err: std::io::Error) -> CurvatureError {
    CurvatureError::Io {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> CurvatureError {
    CurvatureError::Serialization {
        message: err.to_string(),
    }
}

/// Writes a matrix to `path` in the requested format (row-major payload).
pub fn save_matrix<P: AsRef<Path>>(
    matrix: &DMatrix<f64>,
    path: P,
    format: MatrixFormat,
) -> CurvatureResult<()> {
    let disk = DiskMatrix {
        rows: matrix.nrows(),
        cols: matrix.ncols(),
        data: matrix.transpose().iter().copied().collect(),
    };
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    match format {
        MatrixFormat::Json => serde_json::to_writer(writer, &disk).map_err(serde_error)?,
        MatrixFormat::Bincode => bincode::serialize_into(writer, &disk).map_err(serde_error)?,
    }
    Ok(())
}

/// Reads a matrix previously written by [`save_matrix`].
pub fn load_matrix<P: AsRef<Path>>(path: P, format: MatrixFormat) -> CurvatureResult<DMatrix<f64>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let disk: DiskMatrix = match format {
        MatrixFormat::Json => serde_json::from_reader(reader).map_err(serde_error)?,
        MatrixFormat::Bincode => bincode::deserialize_from(reader).map_err(serde_error)?,
    };
    if disk.rows == 0 || disk.cols == 0 || disk.data.len() != disk.rows * disk.cols {
        return Err(CurvatureError::Serialization {
            message: format!(
                "matrix payload has {} values for shape {}x{}",
                disk.data.len(),
                disk.rows,
                disk.cols
            ),
        });
    }
    Ok(DMatrix::from_row_slice(disk.rows, disk.cols, &disk.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_preserves_layout() {
        let dir = tempdir().unwrap();
        let matrix = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        for (name, format) in [
            ("m.json", MatrixFormat::Json),
            ("m.bin", MatrixFormat::Bincode),
        ] {
            let path = dir.path().join(name);
            save_matrix(&matrix, &path, format).unwrap();
            let loaded = load_matrix(&path, format).unwrap();
            assert_eq!(loaded, matrix);
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"rows":2,"cols":2,"data":[1.0]}"#).unwrap();
        assert!(matches!(
            load_matrix(&path, MatrixFormat::Json),
            Err(CurvatureError::Serialization { .. })
        ));
    }
}
