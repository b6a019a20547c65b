//! Minimal raster support: GeoTIFF decode/encode with the geo tags the
//! pipeline needs, and polygon masking for building pixel sums.
//!
//! This is not a general raster layer. It covers exactly the two raster
//! shapes the pipeline touches: RGB tile images and single-band u8
//! building-footprint masks.

pub mod geotiff;
pub mod mask;

pub use geotiff::{read_geotiff, write_geotiff, Raster};
pub use mask::masked_pixel_sum;
