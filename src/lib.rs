//! satscout: satellite-tile inference over administrative boundaries.
//!
//! The pipeline tiles a boundary into fixed-size squares, keeps the tiles
//! that overlap building footprints, classifies each tile image with a
//! frozen ONNX checkpoint, georeferences the positives, and localizes a
//! point of interest inside each one from its class-activation map.

pub mod cache;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod georef;
pub mod localize;
pub mod model;
pub mod pipeline;
pub mod raster;
pub mod tiles;

pub use error::Error;
