//! Per-boundary orchestration.
//!
//! Drives one boundary through the whole state machine:
//! `generated -> filtered -> classified -> georeferenced -> localized ->
//! deduplicated`, strictly sequentially. Every stage is cached by file
//! existence, so rerunning a boundary only redoes what is missing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use geo::Polygon;
use geojson::GeoJson;
use tracing::info;

use crate::config::{DataConfig, ImageryConfig, ModelConfig};
use crate::georef::georeference_tiles;
use crate::localize::{CamLocalizer, Detection};
use crate::model::{CamExtractor, Checkpoint, TileClassifier};
use crate::tiles::{BuildingFilter, Tile, TileGenerator};

/// Run parameters not covered by the config files.
#[derive(Debug, Clone)]
pub struct RunParams {
    /// Grid step between tile sample points, meters.
    pub spacing: f64,
    /// Tile half-side, meters.
    pub buffer_size: f64,
    /// Detection half-side, meters.
    pub cam_buffer_size: f64,
    /// Positive-class probability threshold.
    pub threshold: f64,
    /// Minimum building pixel sum for a tile to be classified.
    pub sum_threshold: u64,
}

impl Default for RunParams {
    fn default() -> Self {
        RunParams {
            spacing: 150.0,
            buffer_size: 150.0,
            cam_buffer_size: 50.0,
            threshold: 0.5,
            sum_threshold: 5,
        }
    }
}

pub struct Pipeline {
    data: DataConfig,
    model: ModelConfig,
    imagery: ImageryConfig,
    iso_code: String,
    output_dir: PathBuf,
    params: RunParams,
    classifier: TileClassifier,
}

impl Pipeline {
    /// Load the checkpoint and assemble the stages. A missing checkpoint
    /// is fatal here, before any boundary work starts.
    pub fn new(
        data: DataConfig,
        model: ModelConfig,
        imagery: ImageryConfig,
        iso_code: String,
        output_dir: PathBuf,
        params: RunParams,
    ) -> Result<Self> {
        let checkpoint_path = model.checkpoint_path(&iso_code);
        let checkpoint = Checkpoint::load(&checkpoint_path, model.img_size)?;
        info!(checkpoint = %checkpoint_path.display(), "checkpoint loaded");
        let classifier = TileClassifier::new(checkpoint, model.clone(), params.threshold);
        Ok(Pipeline {
            data,
            model,
            imagery,
            iso_code,
            output_dir,
            params,
            classifier,
        })
    }

    fn iso_dir(&self) -> PathBuf {
        self.output_dir.join(&self.iso_code)
    }

    fn tiles_file(&self, shape_name: &str) -> PathBuf {
        self.iso_dir()
            .join("tiles")
            .join(format!("{}_{shape_name}.geojson", self.iso_code))
    }

    fn images_dir(&self, shape_name: &str) -> PathBuf {
        self.iso_dir().join("images").join(shape_name)
    }

    fn geotiff_dir(&self, shape_name: &str) -> PathBuf {
        self.iso_dir().join("geotiff").join(shape_name)
    }

    fn results_file(&self, shape_name: &str) -> PathBuf {
        self.iso_dir()
            .join("results")
            .join(&self.model.project)
            .join("tiles")
            .join(&self.model.config_name)
            .join(format!(
                "{}_{shape_name}_{}_results.geojson",
                self.iso_code, self.model.config_name
            ))
    }

    fn cam_file(&self, shape_name: &str) -> PathBuf {
        self.iso_dir()
            .join("results")
            .join(&self.model.project)
            .join("cams")
            .join(&self.model.config_name)
            .join(format!(
                "{}_{shape_name}_{}_cam.geojson",
                self.iso_code, self.model.config_name
            ))
    }

    /// Generate and gate the candidate tiles for a boundary.
    pub fn prepare_tiles(
        &self,
        boundary_wgs84: &Polygon<f64>,
        shape_name: &str,
    ) -> Result<Vec<Tile>> {
        let tiles_file = self.tiles_file(shape_name);
        if let Some(parent) = tiles_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let filter = BuildingFilter::new(&self.data, &self.iso_code);
        let generator = TileGenerator::new(self.params.spacing, self.params.buffer_size);
        let mut tiles = generator.generate(boundary_wgs84, shape_name, &filter, &tiles_file)?;
        tiles.retain(|t| t.building_sum > self.params.sum_threshold);
        info!(
            shape = shape_name,
            tiles = tiles.len(),
            "tiles above sum threshold"
        );
        Ok(tiles)
    }

    /// Full run for one boundary. Imagery must already be present in the
    /// per-shape images directory (external download client).
    pub fn run_shape(
        &self,
        boundary_wgs84: &Polygon<f64>,
        shape_name: &str,
    ) -> Result<Vec<Detection>> {
        info!(shape = shape_name, "processing boundary");
        let tiles = self.prepare_tiles(boundary_wgs84, shape_name)?;

        let images_dir = self.images_dir(shape_name);
        let results = self.classifier.classify_cached(
            tiles,
            &images_dir,
            &self.imagery.image_ext,
            &self.results_file(shape_name),
        )?;

        let positives = self.classifier.positives(&results);
        info!(
            shape = shape_name,
            positives = positives.len(),
            total = results.len(),
            "classification done"
        );
        if positives.is_empty() {
            return Ok(Vec::new());
        }

        let geotiff_dir = self.geotiff_dir(shape_name);
        georeference_tiles(&positives, &self.imagery, &images_dir, &geotiff_dir)?;

        let extractor = CamExtractor::for_model(&self.model);
        let localizer = CamLocalizer::new(
            self.classifier.checkpoint(),
            extractor,
            self.params.cam_buffer_size,
        );
        let filter = BuildingFilter::new(&self.data, &self.iso_code);
        localizer.localize_cached(
            &positives,
            &geotiff_dir,
            &filter,
            &self.cam_file(shape_name),
        )
    }
}

/// First polygon feature of a boundary GeoJSON file (EPSG:4326).
pub fn load_boundary(path: &Path) -> Result<Polygon<f64>> {
    let mut boundaries = load_boundaries(path)?;
    if boundaries.is_empty() {
        bail!("boundary file {} has no polygon features", path.display());
    }
    Ok(boundaries.remove(0).1)
}

/// All named polygon features of a boundary GeoJSON file (EPSG:4326).
///
/// The name comes from the `shapeName` property; unnamed features get a
/// positional fallback. A MultiPolygon contributes its first part.
pub fn load_boundaries(path: &Path) -> Result<Vec<(String, Polygon<f64>)>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading boundary file {}", path.display()))?;
    let geojson: GeoJson = raw
        .parse()
        .with_context(|| format!("parsing boundary file {}", path.display()))?;

    let features = match geojson {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(g) => vec![geojson::Feature {
            bbox: None,
            geometry: Some(g),
            id: None,
            properties: None,
            foreign_members: None,
        }],
    };

    let mut boundaries = Vec::with_capacity(features.len());
    for (index, feature) in features.into_iter().enumerate() {
        let name = feature
            .properties
            .as_ref()
            .and_then(|props| props.get("shapeName"))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("shape{index}"));
        let geometry = feature
            .geometry
            .with_context(|| format!("boundary feature {name} has no geometry"))?;
        let geo_geom: geo::Geometry<f64> = geometry
            .try_into()
            .with_context(|| format!("boundary geometry of {name} is not convertible"))?;
        let polygon = match geo_geom {
            geo::Geometry::Polygon(polygon) => polygon,
            geo::Geometry::MultiPolygon(mp) => mp
                .0
                .into_iter()
                .next()
                .with_context(|| format!("boundary MultiPolygon of {name} is empty"))?,
            other => bail!("boundary {name} must be a polygon, got {other:?}"),
        };
        boundaries.push((name, polygon));
    }
    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_from_feature_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boundary.geojson");
        fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{"shapeName":"shape"},"geometry":{"type":"Polygon","coordinates":[[[0.0,0.0],[0.1,0.0],[0.1,0.1],[0.0,0.1],[0.0,0.0]]]}}]}"#,
        )
        .unwrap();
        let polygon = load_boundary(&path).unwrap();
        assert_eq!(polygon.exterior().0.len(), 5);

        let named = load_boundaries(&path).unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].0, "shape");
    }

    #[test]
    fn boundary_rejects_non_polygon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("point.geojson");
        fs::write(
            &path,
            r#"{"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[0.0,0.0]}}"#,
        )
        .unwrap();
        assert!(load_boundary(&path).is_err());
    }

    #[test]
    fn default_params_match_driver_defaults() {
        let params = RunParams::default();
        assert_eq!(params.spacing, 150.0);
        assert_eq!(params.sum_threshold, 5);
        assert_eq!(params.threshold, 0.5);
    }
}
