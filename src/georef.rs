//! Georeferencing of positive tiles.
//!
//! The download client stores plain images keyed by UID; this step writes
//! each positive tile back out as an EPSG:3857 GeoTIFF whose affine
//! transform maps the tile geometry's bounding box onto the configured
//! pixel grid. Already-written files are skipped, so reruns are cheap.

use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::config::ImageryConfig;
use crate::error::Error;
use crate::geo_core::{Affine, BoundingBox, EPSG_WEB_MERCATOR};
use crate::model::TileClassifier;
use crate::raster::write_geotiff;
use crate::tiles::Tile;

/// Write `{geotiff_dir}/{uid}.tif` for every positive tile.
pub fn georeference_tiles(
    tiles: &[Tile],
    imagery: &ImageryConfig,
    images_dir: &Path,
    geotiff_dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(geotiff_dir)
        .with_context(|| format!("creating {}", geotiff_dir.display()))?;

    let bar = ProgressBar::new(tiles.len() as u64).with_style(
        ProgressStyle::with_template("{msg} [{bar:20}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message("georeference");
    let mut written = 0usize;
    for tile in tiles {
        let out_path = geotiff_dir.join(format!("{}.tif", tile.uid));
        if out_path.exists() {
            bar.inc(1);
            continue;
        }

        let image_path = TileClassifier::image_path(images_dir, tile.uid, &imagery.image_ext);
        let image = image::open(&image_path).map_err(|e| Error::Image {
            path: image_path.clone(),
            reason: e.to_string(),
        })?;
        // The output grid is fixed by configuration; imagery that does
        // not match it is resampled rather than mis-tagged.
        let rgb = image
            .resize_exact(imagery.width, imagery.height, FilterType::Triangle)
            .to_rgb8();

        let bounds = BoundingBox::of_polygon(&tile.geometry);
        let affine = Affine::from_bounds(bounds, imagery.width, imagery.height);
        write_geotiff(
            &out_path,
            imagery.width,
            imagery.height,
            3,
            rgb.as_raw(),
            affine,
            EPSG_WEB_MERCATOR,
        )?;
        written += 1;
        bar.inc(1);
    }
    bar.finish_and_clear();
    info!(written, skipped = tiles.len() - written, "georeferenced tiles");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::buffer_square;
    use crate::raster::read_geotiff;
    use approx::assert_relative_eq;
    use geo::Point;
    use std::fs;

    fn imagery() -> ImageryConfig {
        ImageryConfig {
            width: 8,
            height: 8,
            image_ext: "png".into(),
        }
    }

    fn positive_tile(uid: u64) -> Tile {
        Tile {
            uid,
            geometry: buffer_square(Point::new(1000.0, 2000.0), 150.0),
            shape_name: "shape".into(),
            building_sum: 5,
            pred: Some("poi".into()),
            prob: Some(0.9),
        }
    }

    fn write_source_image(dir: &Path, uid: u64) {
        let img = image::RgbImage::from_fn(8, 8, |x, y| image::Rgb([x as u8, y as u8, 7]));
        img.save(dir.join(format!("{uid}.png"))).unwrap();
    }

    #[test]
    fn bounds_round_trip_through_written_raster() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let geotiffs = dir.path().join("geotiff");
        fs::create_dir_all(&images).unwrap();

        let tile = positive_tile(11);
        write_source_image(&images, 11);
        georeference_tiles(&[tile.clone()], &imagery(), &images, &geotiffs).unwrap();

        let raster = read_geotiff(&geotiffs.join("11.tif")).unwrap();
        assert_eq!(raster.epsg, EPSG_WEB_MERCATOR);
        let bounds = BoundingBox::of_polygon(&tile.geometry);
        let recovered = raster.affine.bounds(raster.width, raster.height);
        let tol = raster.affine.a.abs();
        assert_relative_eq!(recovered.min_x, bounds.min_x, epsilon = tol);
        assert_relative_eq!(recovered.min_y, bounds.min_y, epsilon = tol);
        assert_relative_eq!(recovered.max_x, bounds.max_x, epsilon = tol);
        assert_relative_eq!(recovered.max_y, bounds.max_y, epsilon = tol);
    }

    #[test]
    fn existing_outputs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let geotiffs = dir.path().join("geotiff");
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&geotiffs).unwrap();

        // Pre-existing sentinel output; no source image on disk, so any
        // attempt to rewrite it would error out.
        fs::write(geotiffs.join("11.tif"), b"sentinel").unwrap();
        georeference_tiles(&[positive_tile(11)], &imagery(), &images, &geotiffs).unwrap();
        assert_eq!(fs::read(geotiffs.join("11.tif")).unwrap(), b"sentinel");
    }

    #[test]
    fn missing_source_image_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let geotiffs = dir.path().join("geotiff");
        fs::create_dir_all(&images).unwrap();

        let out = georeference_tiles(&[positive_tile(11)], &imagery(), &images, &geotiffs);
        assert!(out.is_err());
    }
}
