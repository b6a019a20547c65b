//! Candidate tile grid over an administrative boundary.

pub mod filter;
pub mod generator;

use geo::{Centroid, Point, Polygon};

pub use filter::BuildingFilter;
pub use generator::TileGenerator;

/// A fixed-size square sampling unit over a geographic area.
///
/// Geometry is created once by the generator (side `2 * buffer_size`, in
/// EPSG:3857) and never changes afterwards; the filter fills in
/// `building_sum` and the classifier fills in `pred`/`prob`.
#[derive(Debug, Clone)]
pub struct Tile {
    /// Grid index at generation time; unique within a boundary.
    pub uid: u64,
    /// Square footprint in the working CRS.
    pub geometry: Polygon<f64>,
    /// Boundary name this tile was sampled from.
    pub shape_name: String,
    /// Building-footprint pixel sum inside the geometry.
    pub building_sum: u64,
    /// Predicted class label, once classified.
    pub pred: Option<String>,
    /// Positive-class probability, once classified.
    pub prob: Option<f64>,
}

impl Tile {
    /// The original sample point at the center of the square.
    pub fn centroid(&self) -> Point<f64> {
        // A tile square always has a centroid.
        self.geometry
            .centroid()
            .unwrap_or_else(|| Point::new(0.0, 0.0))
    }
}
