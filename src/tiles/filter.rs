//! Building-density gate over candidate tiles.
//!
//! Two raster sources per ISO code: a primary and a fallback. The
//! fallback is consulted only when the primary sums to zero and the
//! fallback file actually exists. Per-tile raster failures are swallowed
//! and count as zero; the gate is never allowed to abort a batch.

use std::path::{Path, PathBuf};

use geo::Polygon;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use crate::config::DataConfig;
use crate::geo_core::{CrsTransformer, EPSG_WEB_MERCATOR};
use crate::raster::{masked_pixel_sum, read_geotiff};
use crate::tiles::Tile;

pub struct BuildingFilter {
    ms_path: PathBuf,
    google_path: PathBuf,
}

impl BuildingFilter {
    pub fn new(config: &DataConfig, iso_code: &str) -> Self {
        BuildingFilter {
            ms_path: config.ms_raster(iso_code),
            google_path: config.google_raster(iso_code),
        }
    }

    /// Sum building pixels under `geometry` (EPSG:3857) for one source.
    /// Any failure (missing file, bad tags, CRS trouble) counts as zero.
    fn source_sum(&self, path: &Path, geometry: &Polygon<f64>) -> u64 {
        let attempt = || -> Result<u64, crate::error::Error> {
            let raster = read_geotiff(path)?;
            let to_raster_crs = CrsTransformer::new(EPSG_WEB_MERCATOR, raster.epsg)?;
            let masked = to_raster_crs.transform_polygon(geometry)?;
            Ok(masked_pixel_sum(&raster, &masked))
        };
        match attempt() {
            Ok(sum) => sum,
            Err(e) => {
                warn!(path = %path.display(), "building raster read failed, counting 0: {e}");
                0
            }
        }
    }

    /// Building pixel sum for one tile geometry, primary then fallback.
    pub fn pixel_sum(&self, geometry: &Polygon<f64>) -> u64 {
        let mut sum = self.source_sum(&self.ms_path, geometry);
        if sum == 0 && self.google_path.exists() {
            sum = self.source_sum(&self.google_path, geometry);
        }
        sum
    }

    /// Fill in `building_sum` for every tile and drop zero-sum tiles.
    pub fn apply(&self, mut tiles: Vec<Tile>) -> Vec<Tile> {
        let bar = ProgressBar::new(tiles.len() as u64).with_style(
            ProgressStyle::with_template("{msg} [{bar:20}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message("building filter");
        for tile in &mut tiles {
            tile.building_sum = self.pixel_sum(&tile.geometry);
            bar.inc(1);
        }
        bar.finish_and_clear();
        tiles.retain(|t| t.building_sum > 0);
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::{buffer_square, Affine};
    use crate::raster::write_geotiff;
    use geo::Point;
    use std::fs;

    fn filter_for(dir: &Path) -> BuildingFilter {
        let config = DataConfig {
            project: "poi".into(),
            rasters_dir: dir.to_path_buf(),
        };
        fs::create_dir_all(dir.join("ms_buildings")).unwrap();
        fs::create_dir_all(dir.join("google_buildings")).unwrap();
        BuildingFilter::new(&config, "TST")
    }

    /// 8x8 mercator raster near the origin, one pixel per meter.
    fn write_mask(path: &Path, data: Vec<u8>) {
        let affine = Affine {
            a: 1.0,
            c: 0.0,
            e: -1.0,
            f: 8.0,
        };
        write_geotiff(path, 8, 8, 1, &data, affine, EPSG_WEB_MERCATOR).unwrap();
    }

    fn tile_at(uid: u64, x: f64, y: f64) -> Tile {
        Tile {
            uid,
            geometry: buffer_square(Point::new(x, y), 2.0),
            shape_name: "test".into(),
            building_sum: 0,
            pred: None,
            prob: None,
        }
    }

    #[test]
    fn missing_primary_raster_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter_for(dir.path());
        assert_eq!(filter.pixel_sum(&buffer_square(Point::new(4.0, 4.0), 2.0)), 0);
    }

    #[test]
    fn fallback_used_only_on_zero_primary() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter_for(dir.path());

        // Primary empty, fallback has buildings in the top-left corner.
        write_mask(&dir.path().join("ms_buildings/TST_ms.tif"), vec![0u8; 64]);
        let mut google = vec![0u8; 64];
        google[0] = 255;
        google[1] = 255;
        write_mask(&dir.path().join("google_buildings/TST_google.tif"), google);

        let sum = filter.pixel_sum(&buffer_square(Point::new(1.0, 7.0), 2.0));
        assert_eq!(sum, 2);
    }

    #[test]
    fn nonzero_primary_skips_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter_for(dir.path());

        let mut ms = vec![0u8; 64];
        ms[0] = 255;
        write_mask(&dir.path().join("ms_buildings/TST_ms.tif"), ms);
        // Fallback would report more, but must not be consulted.
        write_mask(
            &dir.path().join("google_buildings/TST_google.tif"),
            vec![255u8; 64],
        );

        let sum = filter.pixel_sum(&buffer_square(Point::new(1.0, 7.0), 2.0));
        assert_eq!(sum, 1);
    }

    #[test]
    fn zero_sum_tiles_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter_for(dir.path());

        let mut ms = vec![0u8; 64];
        ms[0] = 255;
        write_mask(&dir.path().join("ms_buildings/TST_ms.tif"), ms);

        let tiles = vec![tile_at(0, 1.0, 7.0), tile_at(1, 6.0, 2.0)];
        let kept = filter.apply(tiles);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].uid, 0);
        assert_eq!(kept[0].building_sum, 1);
    }
}
