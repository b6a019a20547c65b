use std::path::PathBuf;

use thiserror::Error;

/// Fatal pipeline errors.
///
/// Per-tile raster failures in the building-density filter are *not*
/// represented here: they are swallowed at the call site and count as a
/// zero pixel sum. Everything below aborts the run.
#[derive(Debug, Error)]
pub enum Error {
    /// The frozen model checkpoint is missing or unreadable.
    #[error("model checkpoint not found: {path}")]
    Checkpoint { path: PathBuf },

    /// A configuration file is missing a required key or failed to parse.
    #[error("invalid configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// A raster file could not be read or is missing required geo tags.
    #[error("raster error for {path}: {reason}")]
    Raster { path: PathBuf, reason: String },

    /// A tile image referenced by UID does not exist or failed to decode.
    #[error("tile image error for {path}: {reason}")]
    Image { path: PathBuf, reason: String },

    /// Model inference failed (bad tensor shapes, unexpected outputs).
    #[error("inference error: {0}")]
    Inference(String),

    /// Coordinate reprojection failed or the EPSG code is unsupported.
    #[error("CRS error: {0}")]
    Crs(String),
}
