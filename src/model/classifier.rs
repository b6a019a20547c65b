//! Tile classification against a frozen ONNX checkpoint.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::ArrayD;
use tracing::info;
use tract_onnx::prelude::*;

use crate::cache;
use crate::config::ModelConfig;
use crate::error::Error;
use crate::geo_core::EPSG_WEB_MERCATOR;
use crate::tiles::Tile;

/// ImageNet channel statistics; the training transform used them and the
/// inference transform must match it exactly.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

type OnnxModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Raw per-image model outputs.
pub struct Forward {
    /// Softmax class probabilities, `[neg, pos]`.
    pub probs: [f32; 2],
    /// CAM target-layer activations, shape as exported.
    pub activations: ArrayD<f32>,
}

/// A loaded checkpoint plus its deterministic preprocessing transform.
pub struct Checkpoint {
    model: OnnxModel,
    img_size: u32,
}

impl Checkpoint {
    /// Load and optimize the ONNX graph. A missing file is fatal.
    pub fn load(path: &Path, img_size: u32) -> Result<Self, Error> {
        if !path.is_file() {
            return Err(Error::Checkpoint {
                path: path.to_path_buf(),
            });
        }
        let size = img_size as i64;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| Error::Inference(format!("loading {}: {e}", path.display())))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .map_err(|e| Error::Inference(e.to_string()))?
            .into_optimized()
            .map_err(|e| Error::Inference(e.to_string()))?
            .into_runnable()
            .map_err(|e| Error::Inference(e.to_string()))?;
        Ok(Checkpoint { model, img_size })
    }

    /// Resize + ImageNet-normalize an image into an NCHW tensor.
    fn preprocess(&self, image: &image::DynamicImage) -> Tensor {
        let size = self.img_size;
        let resized = image
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();
        let arr = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, channel, y, x)| {
                let value = f32::from(resized.get_pixel(x as u32, y as u32)[channel]) / 255.0;
                (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]
            },
        );
        arr.into()
    }

    /// One forward pass: probabilities plus target-layer activations.
    pub fn forward(&self, image: &image::DynamicImage) -> Result<Forward, Error> {
        let input = self.preprocess(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| Error::Inference(e.to_string()))?;
        if outputs.len() < 2 {
            return Err(Error::Inference(
                "checkpoint must export [logits, activations] outputs".to_string(),
            ));
        }

        let logits = outputs[0]
            .to_array_view::<f32>()
            .map_err(|e| Error::Inference(e.to_string()))?;
        let logits: Vec<f32> = logits.iter().copied().collect();
        if logits.len() != 2 {
            return Err(Error::Inference(format!(
                "expected 2 logits, got {}",
                logits.len()
            )));
        }
        let probs = softmax2([logits[0], logits[1]]);

        let view = outputs[1]
            .to_array_view::<f32>()
            .map_err(|e| Error::Inference(e.to_string()))?;
        let activations =
            ArrayD::from_shape_vec(view.shape().to_vec(), view.iter().copied().collect())
                .map_err(|e| Error::Inference(e.to_string()))?;

        Ok(Forward { probs, activations })
    }
}

/// Numerically stable two-class softmax.
pub fn softmax2(logits: [f32; 2]) -> [f32; 2] {
    let max = logits[0].max(logits[1]);
    let e0 = (logits[0] - max).exp();
    let e1 = (logits[1] - max).exp();
    let total = e0 + e1;
    [e0 / total, e1 / total]
}

/// Runs the checkpoint over a tile batch and labels each tile.
pub struct TileClassifier {
    checkpoint: Checkpoint,
    config: ModelConfig,
    threshold: f64,
}

impl TileClassifier {
    pub fn new(checkpoint: Checkpoint, config: ModelConfig, threshold: f64) -> Self {
        TileClassifier {
            checkpoint,
            config,
            threshold,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Label for a positive-class probability.
    fn label(&self, prob: f64) -> String {
        if prob > self.threshold {
            self.config.pos_class.clone()
        } else {
            self.config.neg_class.clone()
        }
    }

    /// Image path for a tile: `{images_dir}/{uid}.{ext}`.
    pub fn image_path(images_dir: &Path, uid: u64, ext: &str) -> PathBuf {
        images_dir.join(format!("{uid}.{ext}"))
    }

    /// Classify every tile in place. Missing or unreadable tile images
    /// abort the run; the download client was supposed to provide them.
    pub fn classify(
        &self,
        mut tiles: Vec<Tile>,
        images_dir: &Path,
        image_ext: &str,
    ) -> Result<Vec<Tile>> {
        let bar = ProgressBar::new(tiles.len() as u64).with_style(
            ProgressStyle::with_template("{msg} [{bar:20}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message("classify");
        for tile in &mut tiles {
            let path = Self::image_path(images_dir, tile.uid, image_ext);
            let image = image::open(&path).map_err(|e| Error::Image {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let forward = self.checkpoint.forward(&image)?;
            let prob = f64::from(forward.probs[1]);
            tile.prob = Some(prob);
            tile.pred = Some(self.label(prob));
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(tiles)
    }

    /// Cached classification: an existing result file short-circuits the
    /// whole computation (no partial recompute).
    pub fn classify_cached(
        &self,
        tiles: Vec<Tile>,
        images_dir: &Path,
        image_ext: &str,
        out_file: &Path,
    ) -> Result<Vec<Tile>> {
        if out_file.exists() {
            info!(cache = %out_file.display(), "classification cache hit");
            return cache::load_tiles(out_file);
        }
        let results = self
            .classify(tiles, images_dir, image_ext)
            .context("classifying tiles")?;
        cache::save_tiles(out_file, &results, EPSG_WEB_MERCATOR)?;
        Ok(results)
    }

    /// Tiles labeled with the positive class.
    pub fn positives(&self, tiles: &[Tile]) -> Vec<Tile> {
        tiles
            .iter()
            .filter(|t| t.pred.as_deref() == Some(self.config.pos_class.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax2([1.3, -0.7]);
        assert_relative_eq!(probs[0] + probs[1], 1.0, epsilon = 1e-6);
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let a = softmax2([2.0, 5.0]);
        let b = softmax2([102.0, 105.0]);
        assert_relative_eq!(a[1], b[1], epsilon = 1e-6);
    }

    #[test]
    fn softmax_survives_large_logits() {
        let probs = softmax2([1000.0, -1000.0]);
        assert!(probs[0].is_finite() && probs[1].is_finite());
        assert_relative_eq!(probs[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn missing_checkpoint_is_fatal() {
        let out = Checkpoint::load(Path::new("/nonexistent/model.onnx"), 224);
        assert!(matches!(out, Err(Error::Checkpoint { .. })));
    }

    #[test]
    fn image_path_layout() {
        let path = TileClassifier::image_path(Path::new("images/shape"), 42, "jpeg");
        assert_eq!(path, PathBuf::from("images/shape/42.jpeg"));
    }
}
