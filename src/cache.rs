//! GeoJSON vector caches.
//!
//! Tiles, classification results and deduplicated detections are all
//! persisted as FeatureCollections keyed by `{iso}_{shapename}` style
//! file names. File existence *is* the cache signal: there is no
//! staleness or checksum validation anywhere (accepted risk).

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use geojson::{Feature, FeatureCollection, GeoJson};
use serde_json::{Map, Value};

use crate::localize::Detection;
use crate::tiles::Tile;

fn foreign_members(epsg: u32) -> Map<String, Value> {
    let mut crs_props = Map::new();
    crs_props.insert("name".into(), Value::from(format!("EPSG:{epsg}")));
    let mut crs = Map::new();
    crs.insert("type".into(), Value::from("name"));
    crs.insert("properties".into(), Value::Object(crs_props));

    let mut members = Map::new();
    members.insert("crs".into(), Value::Object(crs));
    members.insert(
        "generated_at".into(),
        Value::from(chrono::Utc::now().to_rfc3339()),
    );
    members
}

fn polygon_of(feature: &Feature) -> Result<geo::Polygon<f64>> {
    let geometry = feature
        .geometry
        .as_ref()
        .context("cached feature has no geometry")?;
    let geo_geom: geo::Geometry<f64> = geometry
        .try_into()
        .context("cached geometry is not convertible")?;
    match geo_geom {
        geo::Geometry::Polygon(polygon) => Ok(polygon),
        other => bail!("cached geometry is not a polygon: {other:?}"),
    }
}

fn prop_u64(feature: &Feature, key: &str) -> Result<u64> {
    feature
        .property(key)
        .and_then(Value::as_u64)
        .with_context(|| format!("cached feature missing numeric property {key:?}"))
}

fn prop_str(feature: &Feature, key: &str) -> Result<String> {
    feature
        .property(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("cached feature missing string property {key:?}"))
}

fn write_collection(path: &Path, features: Vec<Feature>, epsg: u32) -> Result<()> {
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(foreign_members(epsg)),
    };
    let payload = GeoJson::FeatureCollection(collection).to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating cache directory {}", parent.display()))?;
    }
    fs::write(path, payload).with_context(|| format!("writing cache file {}", path.display()))
}

fn read_collection(path: &Path) -> Result<FeatureCollection> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading cache file {}", path.display()))?;
    let geojson: GeoJson = raw
        .parse()
        .with_context(|| format!("parsing cache file {}", path.display()))?;
    match geojson {
        GeoJson::FeatureCollection(fc) => Ok(fc),
        _ => bail!("cache file {} is not a FeatureCollection", path.display()),
    }
}

/// Persist a tile table (with or without predictions).
pub fn save_tiles(path: &Path, tiles: &[Tile], epsg: u32) -> Result<()> {
    let features = tiles
        .iter()
        .map(|tile| {
            let mut properties = Map::new();
            properties.insert("UID".into(), Value::from(tile.uid));
            properties.insert("shapeName".into(), Value::from(tile.shape_name.clone()));
            properties.insert("sum".into(), Value::from(tile.building_sum));
            if let Some(pred) = &tile.pred {
                properties.insert("pred".into(), Value::from(pred.clone()));
            }
            if let Some(prob) = tile.prob {
                properties.insert("prob".into(), Value::from(prob));
            }
            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&tile.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    write_collection(path, features, epsg)
}

/// Read a tile table back; inverse of [`save_tiles`].
pub fn load_tiles(path: &Path) -> Result<Vec<Tile>> {
    let collection = read_collection(path)?;
    collection
        .features
        .iter()
        .map(|feature| {
            Ok(Tile {
                uid: prop_u64(feature, "UID")?,
                geometry: polygon_of(feature)?,
                shape_name: prop_str(feature, "shapeName")?,
                building_sum: prop_u64(feature, "sum")?,
                pred: feature
                    .property("pred")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                prob: feature.property("prob").and_then(Value::as_f64),
            })
        })
        .collect()
}

/// Persist deduplicated detections.
pub fn save_detections(path: &Path, detections: &[Detection], epsg: u32) -> Result<()> {
    let features = detections
        .iter()
        .map(|det| {
            let mut properties = Map::new();
            properties.insert("UID".into(), Value::from(det.uid));
            properties.insert("prob".into(), Value::from(det.prob));
            properties.insert("group".into(), Value::from(det.group));
            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&det.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    write_collection(path, features, epsg)
}

/// Read detections back; inverse of [`save_detections`].
pub fn load_detections(path: &Path) -> Result<Vec<Detection>> {
    let collection = read_collection(path)?;
    collection
        .features
        .iter()
        .map(|feature| {
            Ok(Detection {
                uid: prop_u64(feature, "UID")?,
                geometry: polygon_of(feature)?,
                prob: feature
                    .property("prob")
                    .and_then(Value::as_f64)
                    .context("cached detection missing prob")?,
                group: prop_u64(feature, "group")?,
            })
        })
        .collect()
}
