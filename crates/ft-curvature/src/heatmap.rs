// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Grayscale PNG rendering of dense curvature matrices.

use crate::{CurvatureError, CurvatureResult};
use image::GrayImage;
use nalgebra::DMatrix;
use std::path::Path;

/// Default sub-block edge for renders of large matrices.
pub const DEFAULT_CLIP: usize = 3000;

fn check_square(matrix: &DMatrix<f64>, label: &'static str) -> CurvatureResult<()> {
    if matrix.nrows() != matrix.ncols() || matrix.nrows() == 0 {
        return Err(CurvatureError::InvalidParameter { label });
    }
    Ok(())
}

/// Renders `|matrix|`, min-max normalised over the full matrix and square-root
/// contrast stretched, clipped to the top-left `clip x clip` sub-block.
pub fn render_heatmap(matrix: &DMatrix<f64>, clip: usize) -> CurvatureResult<GrayImage> {
    check_square(matrix, "heatmap_square_matrix")?;
    if clip == 0 {
        return Err(CurvatureError::InvalidParameter {
            label: "heatmap_clip",
        });
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in matrix.iter() {
        let magnitude = value.abs();
        if !magnitude.is_finite() {
            return Err(CurvatureError::DegenerateMatrix {
                label: "heatmap_non_finite",
            });
        }
        min = min.min(magnitude);
        max = max.max(magnitude);
    }
    if max == min {
        return Err(CurvatureError::DegenerateMatrix {
            label: "heatmap_constant",
        });
    }
    let k = clip.min(matrix.nrows());
    let span = max - min;
    Ok(GrayImage::from_fn(k as u32, k as u32, |x, y| {
        let magnitude = matrix[(y as usize, x as usize)].abs();
        let normalised = ((magnitude - min) / span).sqrt();
        image::Luma([(normalised * 255.0).round() as u8])
    }))
}

/// Renders and writes a heatmap PNG in one call.
pub fn save_heatmap<P: AsRef<Path>>(
    matrix: &DMatrix<f64>,
    clip: usize,
    path: P,
) -> CurvatureResult<()> {
    let rendered = render_heatmap(matrix, clip)?;
    rendered.save(path.as_ref()).map_err(|err| CurvatureError::Io {
        message: err.to_string(),
    })
}

/// Renders `|lhs - rhs| / scale` clamped to the unit interval — the error
/// image between a dense inverse and its kernel-masked approximation.
///
/// When `scale` is `None` the maximum absolute difference is used.
pub fn render_error_map(
    lhs: &DMatrix<f64>,
    rhs: &DMatrix<f64>,
    scale: Option<f64>,
    clip: usize,
) -> CurvatureResult<GrayImage> {
    check_square(lhs, "error_map_square_matrix")?;
    if lhs.shape() != rhs.shape() {
        return Err(CurvatureError::UnsupportedConfiguration {
            expected: lhs.nrows(),
            got: rhs.nrows(),
        });
    }
    if clip == 0 {
        return Err(CurvatureError::InvalidParameter {
            label: "error_map_clip",
        });
    }
    let scale = match scale {
        Some(value) => value,
        None => {
            let mut max = 0.0f64;
            for (a, b) in lhs.iter().zip(rhs.iter()) {
                max = max.max((a - b).abs());
            }
            max
        }
    };
    if !scale.is_finite() || scale <= 0.0 {
        return Err(CurvatureError::DegenerateMatrix {
            label: "error_map_scale",
        });
    }
    let k = clip.min(lhs.nrows());
    Ok(GrayImage::from_fn(k as u32, k as u32, |x, y| {
        let (r, c) = (y as usize, x as usize);
        let normalised = ((lhs[(r, c)] - rhs[(r, c)]).abs() / scale).clamp(0.0, 1.0);
        image::Luma([(normalised * 255.0).round() as u8])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn identity_renders_bright_diagonal() {
        let matrix = DMatrix::<f64>::identity(4, 4);
        let img = render_heatmap(&matrix, 4).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(0, 0).0[0], 255);
        assert_eq!(img.get_pixel(1, 0).0[0], 0);
    }

    #[test]
    fn clip_limits_the_rendered_block() {
        let matrix = DMatrix::<f64>::identity(10, 10);
        let img = render_heatmap(&matrix, 3).unwrap();
        assert_eq!(img.dimensions(), (3, 3));
    }

    #[test]
    fn constant_matrix_is_degenerate() {
        let matrix = DMatrix::from_element(3, 3, 2.0);
        assert!(matches!(
            render_heatmap(&matrix, 3),
            Err(CurvatureError::DegenerateMatrix { .. })
        ));
    }

    #[test]
    fn error_map_highlights_differences() {
        let lhs = DMatrix::<f64>::identity(2, 2);
        let rhs = DMatrix::zeros(2, 2);
        let img = render_error_map(&lhs, &rhs, None, 2).unwrap();
        assert_eq!(img.get_pixel(0, 0).0[0], 255);
        assert_eq!(img.get_pixel(1, 0).0[0], 0);
    }

    #[test]
    fn save_writes_a_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.png");
        let matrix = DMatrix::<f64>::identity(4, 4);
        save_heatmap(&matrix, 4, &path).unwrap();
        assert!(path.metadata().unwrap().len() > 0);
    }
}
