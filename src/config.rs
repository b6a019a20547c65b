//! Run configuration, loaded once per run from TOML files.
//!
//! Three documents mirror the three concerns the pipeline consumes:
//! data layout on disk, the trained model, and the imagery geometry the
//! download client produced. All of them are immutable after load; a
//! malformed or incomplete file is fatal.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// Backbone family of the trained checkpoint. Selects the CAM variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Cnn,
    Vit,
}

/// Filesystem layout: where rasters and outputs live.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Project name, used to namespace result directories.
    pub project: String,
    /// Directory holding the `ms_buildings/` and `google_buildings/`
    /// raster trees, one file per ISO code.
    pub rasters_dir: PathBuf,
}

impl DataConfig {
    /// Primary building-footprint raster for an ISO code.
    pub fn ms_raster(&self, iso_code: &str) -> PathBuf {
        self.rasters_dir
            .join("ms_buildings")
            .join(format!("{iso_code}_ms.tif"))
    }

    /// Fallback building-footprint raster for an ISO code.
    pub fn google_raster(&self, iso_code: &str) -> PathBuf {
        self.rasters_dir
            .join("google_buildings")
            .join(format!("{iso_code}_google.tif"))
    }
}

/// Trained model description.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub project: String,
    /// Experiment identifier; keys checkpoint and cache file names.
    pub config_name: String,
    /// Root of the experiment tree holding checkpoints.
    pub exp_dir: PathBuf,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// Side length the preprocessing transform resizes tile images to.
    pub img_size: u32,
    /// Label written for tiles above the probability threshold.
    pub pos_class: String,
    /// Label written for everything else.
    pub neg_class: String,
    /// Token-grid side for the ViT reshape adapter. When absent it is
    /// inferred from the token count (sqrt, class token dropped).
    #[serde(default)]
    pub cam_grid: Option<usize>,
}

impl ModelConfig {
    /// Checkpoint path for an ISO code:
    /// `{exp_dir}/{project}/{iso}_{config_name}/{iso}_{config_name}.onnx`.
    pub fn checkpoint_path(&self, iso_code: &str) -> PathBuf {
        let stem = format!("{iso_code}_{}", self.config_name);
        self.exp_dir
            .join(&self.project)
            .join(&stem)
            .join(format!("{stem}.onnx"))
    }
}

/// Geometry of the imagery the download client produced.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageryConfig {
    /// Pixel width of the georeferenced output rasters.
    pub width: u32,
    /// Pixel height of the georeferenced output rasters.
    pub height: u32,
    /// File extension of the downloaded tile images.
    #[serde(default = "default_image_ext")]
    pub image_ext: String,
}

fn default_image_ext() -> String {
    "jpeg".to_string()
}

/// Parse a TOML config file into any of the config types.
pub fn load_config<T>(path: &Path) -> Result<T, Error>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = fs::read_to_string(path).map_err(|e| Error::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    toml::from_str(&raw).map_err(|e| Error::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
