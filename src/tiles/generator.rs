//! Regular-grid tile generation over a boundary.
//!
//! Sample points are laid on a spacing-aligned grid across the boundary's
//! bounding box (in EPSG:3857) and kept when they fall inside the
//! boundary; each kept point is buffered into a flat-capped square. UIDs
//! are the running index over in-boundary points in scan order, so a
//! fixed boundary always yields the same grid and the same identifiers.

use std::path::Path;

use anyhow::{Context, Result};
use geo::{Contains, Point, Polygon};
use tracing::info;

use crate::cache;
use crate::geo_core::{buffer_square, BoundingBox, CrsTransformer, EPSG_WEB_MERCATOR, EPSG_WGS84};
use crate::tiles::{BuildingFilter, Tile};

pub struct TileGenerator {
    /// Grid step between sample points, meters.
    pub spacing: f64,
    /// Half the tile side, meters.
    pub buffer_size: f64,
}

impl TileGenerator {
    pub fn new(spacing: f64, buffer_size: f64) -> Self {
        TileGenerator {
            spacing,
            buffer_size,
        }
    }

    /// Grid-sample a boundary (EPSG:3857) into candidate tiles.
    pub fn sample(&self, boundary: &Polygon<f64>, shape_name: &str) -> Vec<Tile> {
        let bbox = BoundingBox::of_polygon(boundary);
        let mut tiles = Vec::new();
        let mut uid: u64 = 0;

        // Scan order is row-major from the south-west corner; UIDs only
        // advance for points inside the boundary.
        let mut y = bbox.min_y;
        while y <= bbox.max_y {
            let mut x = bbox.min_x;
            while x <= bbox.max_x {
                let point = Point::new(x, y);
                if boundary.contains(&point) {
                    tiles.push(Tile {
                        uid,
                        geometry: buffer_square(point, self.buffer_size),
                        shape_name: shape_name.to_string(),
                        building_sum: 0,
                        pred: None,
                        prob: None,
                    });
                    uid += 1;
                }
                x += self.spacing;
            }
            y += self.spacing;
        }
        tiles
    }

    /// Generate tiles for a boundary given in EPSG:4326, gate them
    /// through the building filter and persist the survivors.
    ///
    /// If `out_file` already exists this is an idempotent read of the
    /// cached grid; nothing is recomputed.
    pub fn generate(
        &self,
        boundary_wgs84: &Polygon<f64>,
        shape_name: &str,
        filter: &BuildingFilter,
        out_file: &Path,
    ) -> Result<Vec<Tile>> {
        if out_file.exists() {
            info!(cache = %out_file.display(), "tile cache hit");
            return cache::load_tiles(out_file);
        }

        let to_mercator = CrsTransformer::new(EPSG_WGS84, EPSG_WEB_MERCATOR)?;
        let boundary = to_mercator
            .transform_polygon(boundary_wgs84)
            .context("reprojecting boundary")?;

        let candidates = self.sample(&boundary, shape_name);
        info!(shape = shape_name, candidates = candidates.len(), "sampled tile grid");

        let kept = filter.apply(candidates);
        info!(shape = shape_name, kept = kept.len(), "tiles with buildings");

        cache::save_tiles(out_file, &kept, EPSG_WEB_MERCATOR)?;
        Ok(kept)
    }
}
