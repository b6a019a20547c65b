//! Class-activation map extraction and peak localization.
//!
//! Two extractor variants cover the two backbone families: CNN exports a
//! `(1, C, h, w)` feature map; ViT exports a `(1, n, C)` token sequence
//! that is first reshaped onto its spatial grid (dropping the class token
//! when present). Both reduce to a 2-D map by ReLU + channel mean,
//! min-max normalized to `[0, 1]`.

use ndarray::{Array2, ArrayD};

use crate::config::{ModelConfig, ModelType};
use crate::error::Error;

pub enum CamExtractor {
    Cnn,
    Vit {
        /// Token-grid side; inferred from the token count when `None`.
        grid: Option<usize>,
    },
}

impl CamExtractor {
    pub fn for_model(config: &ModelConfig) -> Self {
        match config.model_type {
            ModelType::Cnn => CamExtractor::Cnn,
            ModelType::Vit => CamExtractor::Vit {
                grid: config.cam_grid,
            },
        }
    }

    /// Reduce exported activations to a 2-D activation map.
    pub fn activation_map(&self, activations: &ArrayD<f32>) -> Result<Array2<f32>, Error> {
        let map = match self {
            CamExtractor::Cnn => {
                let shape = activations.shape();
                if shape.len() != 4 || shape[0] != 1 {
                    return Err(Error::Inference(format!(
                        "CNN activations must be (1, C, h, w), got {shape:?}"
                    )));
                }
                let (channels, height, width) = (shape[1], shape[2], shape[3]);
                let mut map = Array2::<f32>::zeros((height, width));
                for c in 0..channels {
                    for y in 0..height {
                        for x in 0..width {
                            map[[y, x]] += activations[[0, c, y, x]].max(0.0);
                        }
                    }
                }
                map.mapv_inplace(|v| v / channels as f32);
                map
            }
            CamExtractor::Vit { grid } => {
                let shape = activations.shape();
                if shape.len() != 3 || shape[0] != 1 {
                    return Err(Error::Inference(format!(
                        "ViT activations must be (1, n, C), got {shape:?}"
                    )));
                }
                let (tokens, channels) = (shape[1], shape[2]);
                let (grid, skip) = vit_grid(tokens, *grid)?;
                let mut map = Array2::<f32>::zeros((grid, grid));
                for token in 0..grid * grid {
                    let mut acc = 0.0f32;
                    for c in 0..channels {
                        acc += activations[[0, token + skip, c]].max(0.0);
                    }
                    map[[token / grid, token % grid]] = acc / channels as f32;
                }
                map
            }
        };
        Ok(normalize(map))
    }
}

/// Token-grid side and leading tokens to skip (the class token).
fn vit_grid(tokens: usize, configured: Option<usize>) -> Result<(usize, usize), Error> {
    if let Some(grid) = configured {
        let skip = tokens
            .checked_sub(grid * grid)
            .ok_or_else(|| Error::Inference(format!("{tokens} tokens < {grid}x{grid} grid")))?;
        if skip > 1 {
            return Err(Error::Inference(format!(
                "{tokens} tokens do not fit a {grid}x{grid} grid"
            )));
        }
        return Ok((grid, skip));
    }
    let grid = (tokens as f64).sqrt() as usize;
    if grid * grid == tokens {
        Ok((grid, 0))
    } else if grid * grid == tokens - 1 {
        // Class token first, then the patch grid.
        Ok((grid, 1))
    } else {
        Err(Error::Inference(format!(
            "cannot infer a square grid from {tokens} tokens"
        )))
    }
}

/// Min-max normalize to `[0, 1]`; a constant map collapses to zeros.
fn normalize(mut map: Array2<f32>) -> Array2<f32> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in map.iter() {
        min = min.min(v);
        max = max.max(v);
    }
    let range = max - min;
    if range > 0.0 {
        map.mapv_inplace(|v| (v - min) / range);
    } else {
        map.fill(0.0);
    }
    map
}

/// Bilinear resize with half-pixel centers, clamped at the edges.
pub fn resize_bilinear(map: &Array2<f32>, out_height: usize, out_width: usize) -> Array2<f32> {
    let (in_height, in_width) = map.dim();
    if in_height == out_height && in_width == out_width {
        return map.clone();
    }
    let scale_y = in_height as f64 / out_height as f64;
    let scale_x = in_width as f64 / out_width as f64;

    Array2::from_shape_fn((out_height, out_width), |(y, x)| {
        let src_y = ((y as f64 + 0.5) * scale_y - 0.5).max(0.0);
        let src_x = ((x as f64 + 0.5) * scale_x - 0.5).max(0.0);
        let y0 = (src_y.floor() as usize).min(in_height - 1);
        let x0 = (src_x.floor() as usize).min(in_width - 1);
        let y1 = (y0 + 1).min(in_height - 1);
        let x1 = (x0 + 1).min(in_width - 1);
        let fy = (src_y - y0 as f64) as f32;
        let fx = (src_x - x0 as f64) as f32;

        let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
        let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Peak pixel of an activation map as `(col, row)`.
///
/// Deliberate two-pass argmax, not a flattened scan: first find, per row,
/// the column of that row's maximum; then the row whose row-maximum is
/// globally largest; return that row's argmax column and the row index.
/// Both passes keep the *first* maximal element on ties. Downstream
/// geo-referencing depends on this exact tie-breaking; do not "simplify".
pub fn peak_pixel(map: &Array2<f32>) -> (usize, usize) {
    let (height, width) = map.dim();
    debug_assert!(height > 0 && width > 0);

    let mut row_argmax = vec![0usize; height];
    let mut row_max = vec![f32::NEG_INFINITY; height];
    for y in 0..height {
        let mut best_x = 0usize;
        let mut best = f32::NEG_INFINITY;
        for x in 0..width {
            if map[[y, x]] > best {
                best = map[[y, x]];
                best_x = x;
            }
        }
        row_argmax[y] = best_x;
        row_max[y] = best;
    }

    let mut best_y = 0usize;
    let mut best = f32::NEG_INFINITY;
    for (y, &value) in row_max.iter().enumerate() {
        if value > best {
            best = value;
            best_y = y;
        }
    }
    (row_argmax[best_y], best_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::ArrayD;

    #[test]
    fn single_peak_is_located_exactly() {
        let mut map = Array2::<f32>::zeros((8, 8));
        map[[5, 2]] = 1.0;
        assert_eq!(peak_pixel(&map), (2, 5));
    }

    #[test]
    fn ties_keep_the_first_occurrence() {
        let mut map = Array2::<f32>::zeros((6, 6));
        map[[1, 4]] = 0.9;
        map[[4, 1]] = 0.9;
        assert_eq!(peak_pixel(&map), (4, 1));
    }

    #[test]
    fn two_pass_differs_from_last_wins_flat_scan() {
        // A naive flattened scan that keeps the last maximum (the usual
        // `max_by` pitfall) picks the other peak; the two-pass argmax
        // must not.
        fn naive_last_wins(map: &Array2<f32>) -> (usize, usize) {
            let (_, width) = map.dim();
            let (index, _) = map
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .unwrap();
            (index % width, index / width)
        }

        let mut map = Array2::<f32>::zeros((6, 6));
        map[[0, 0]] = 1.0;
        map[[5, 5]] = 1.0;
        assert_eq!(peak_pixel(&map), (0, 0));
        assert_eq!(naive_last_wins(&map), (5, 5));
        assert_ne!(peak_pixel(&map), naive_last_wins(&map));
    }

    #[test]
    fn cnn_map_reduces_and_normalizes() {
        // Two channels, one carries a negative that ReLU zeroes out.
        let mut acts = ArrayD::<f32>::zeros(vec![1, 2, 3, 3]);
        acts[[0, 0, 1, 1]] = 4.0;
        acts[[0, 1, 1, 1]] = 2.0;
        acts[[0, 1, 0, 0]] = -5.0;

        let map = CamExtractor::Cnn.activation_map(&acts).unwrap();
        assert_eq!(map.dim(), (3, 3));
        assert_relative_eq!(map[[1, 1]], 1.0);
        assert_relative_eq!(map[[0, 0]], 0.0);
    }

    #[test]
    fn cnn_rejects_token_shapes() {
        let acts = ArrayD::<f32>::zeros(vec![1, 16, 8]);
        assert!(CamExtractor::Cnn.activation_map(&acts).is_err());
    }

    #[test]
    fn vit_reshape_with_class_token() {
        // 17 tokens = class token + 4x4 grid. Peak on patch 5 -> (1, 1).
        let mut acts = ArrayD::<f32>::zeros(vec![1, 17, 2]);
        acts[[0, 0, 0]] = 99.0; // class token must be ignored
        acts[[0, 1 + 5, 0]] = 3.0;

        let extractor = CamExtractor::Vit { grid: None };
        let map = extractor.activation_map(&acts).unwrap();
        assert_eq!(map.dim(), (4, 4));
        assert_eq!(peak_pixel(&map), (1, 1));
    }

    #[test]
    fn vit_respects_configured_grid() {
        let acts = ArrayD::<f32>::zeros(vec![1, 16, 4]);
        let extractor = CamExtractor::Vit { grid: Some(4) };
        assert_eq!(extractor.activation_map(&acts).unwrap().dim(), (4, 4));

        let wrong = CamExtractor::Vit { grid: Some(5) };
        assert!(wrong.activation_map(&acts).is_err());
    }

    #[test]
    fn resize_keeps_peak_region() {
        let mut map = Array2::<f32>::zeros((4, 4));
        map[[1, 2]] = 1.0;
        let big = resize_bilinear(&map, 16, 16);
        assert_eq!(big.dim(), (16, 16));
        let (x, y) = peak_pixel(&big);
        // Peak cell (row 1, col 2) maps to the 4x4 block at rows 4..8,
        // cols 8..12.
        assert!((4..8).contains(&y), "row {y}");
        assert!((8..12).contains(&x), "col {x}");
    }

    #[test]
    fn resize_identity_shape_is_noop() {
        let map = Array2::<f32>::from_shape_fn((3, 3), |(y, x)| (y * 3 + x) as f32);
        let same = resize_bilinear(&map, 3, 3);
        assert_eq!(map, same);
    }

    #[test]
    fn constant_map_normalizes_to_zero() {
        let acts = ArrayD::<f32>::from_elem(vec![1, 1, 2, 2], 3.0);
        let map = CamExtractor::Cnn.activation_map(&acts).unwrap();
        assert!(map.iter().all(|&v| v == 0.0));
    }
}
