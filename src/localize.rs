//! CAM-driven point localization and spatial deduplication.
//!
//! Each positive tile contributes one detection: the CAM peak converted
//! to map coordinates through the tile raster's own affine transform and
//! buffered into a small square. Detections that touch or overlap are
//! clustered by connectivity and only the highest-probability member of
//! each cluster survives.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use geo::{Intersects, Point};
use indicatif::{ProgressBar, ProgressStyle};
use rstar::{primitives::GeomWithData, RTree, AABB};
use tracing::info;

use crate::cache;
use crate::error::Error;
use crate::geo_core::{buffer_square, BoundingBox, EPSG_WEB_MERCATOR};
use crate::model::{peak_pixel, resize_bilinear, CamExtractor, Checkpoint};
use crate::raster::{read_geotiff, Raster};
use crate::tiles::{BuildingFilter, Tile};

/// A geographic point of interest derived from a CAM heatmap peak.
#[derive(Debug, Clone)]
pub struct Detection {
    /// UID of the source tile.
    pub uid: u64,
    /// Square footprint buffered around the peak point.
    pub geometry: geo::Polygon<f64>,
    /// Probability carried over from the source tile.
    pub prob: f64,
    /// Cluster label assigned by connectivity grouping.
    pub group: u64,
}

/// Localizes the point of interest inside positive tiles.
pub struct CamLocalizer<'a> {
    checkpoint: &'a Checkpoint,
    extractor: CamExtractor,
    /// Detection half-side, meters.
    buffer_size: f64,
}

impl<'a> CamLocalizer<'a> {
    pub fn new(checkpoint: &'a Checkpoint, extractor: CamExtractor, buffer_size: f64) -> Self {
        CamLocalizer {
            checkpoint,
            extractor,
            buffer_size,
        }
    }

    /// Georeferenced tile raster path: `{geotiff_dir}/{uid}.tif`.
    pub fn geotiff_path(geotiff_dir: &Path, uid: u64) -> PathBuf {
        geotiff_dir.join(format!("{uid}.tif"))
    }

    /// CAM peak of one tile raster, in the raster's map coordinates.
    pub fn localize_tile(&self, raster: &Raster) -> Result<Point<f64>, Error> {
        let image = raster_to_image(raster)?;
        let forward = self.checkpoint.forward(&image)?;
        let map = self.extractor.activation_map(&forward.activations)?;
        let resized = resize_bilinear(&map, raster.height as usize, raster.width as usize);
        let (col, row) = peak_pixel(&resized);
        let (x, y) = raster.affine.xy(row, col);
        Ok(Point::new(x, y))
    }

    /// One detection per positive tile, in EPSG:3857.
    pub fn generate_points(&self, tiles: &[Tile], geotiff_dir: &Path) -> Result<Vec<Detection>> {
        let bar = ProgressBar::new(tiles.len() as u64).with_style(
            ProgressStyle::with_template("{msg} [{bar:20}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message("cam points");
        let mut detections = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let path = Self::geotiff_path(geotiff_dir, tile.uid);
            let raster = read_geotiff(&path)?;
            let peak = self.localize_tile(&raster)?;
            detections.push(Detection {
                uid: tile.uid,
                geometry: buffer_square(peak, self.buffer_size),
                prob: tile.prob.unwrap_or(0.0),
                group: 0,
            });
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(detections)
    }

    /// Full localization for a batch of positive tiles: points, building
    /// gate, connectivity clustering, per-cluster dedup. Output stays in
    /// EPSG:3857. Cached by output-file existence.
    pub fn localize_cached(
        &self,
        tiles: &[Tile],
        geotiff_dir: &Path,
        filter: &BuildingFilter,
        out_file: &Path,
    ) -> Result<Vec<Detection>> {
        if out_file.exists() {
            info!(cache = %out_file.display(), "cam cache hit");
            return cache::load_detections(out_file);
        }

        let detections = self
            .generate_points(tiles, geotiff_dir)
            .context("generating cam points")?;
        finalize_detections(detections, filter, out_file)
    }
}

/// Building gate, dedup and cache write for a batch of raw detections.
///
/// An empty outcome is *not* persisted: the absence of the cache file is
/// what makes the next run try again.
fn finalize_detections(
    mut detections: Vec<Detection>,
    filter: &BuildingFilter,
    out_file: &Path,
) -> Result<Vec<Detection>> {
    // Detections must still sit on buildings; the peak can land off
    // the footprint that admitted the tile.
    detections.retain(|det| filter.pixel_sum(&det.geometry) > 0);

    let detections = deduplicate(detections);
    info!(detections = detections.len(), "deduplicated detections");
    if detections.is_empty() {
        return Ok(detections);
    }

    cache::save_detections(out_file, &detections, EPSG_WEB_MERCATOR)?;
    Ok(detections)
}

/// Expand the raster's RGB samples into a decoded image for inference.
fn raster_to_image(raster: &Raster) -> Result<image::DynamicImage, Error> {
    if raster.channels < 3 {
        return Err(Error::Inference(format!(
            "expected RGB tile raster, got {} channel(s)",
            raster.channels
        )));
    }
    let mut rgb = image::RgbImage::new(raster.width, raster.height);
    for row in 0..raster.height as usize {
        for col in 0..raster.width as usize {
            let pixel = image::Rgb([
                raster.sample(row, col, 0),
                raster.sample(row, col, 1),
                raster.sample(row, col, 2),
            ]);
            rgb.put_pixel(col as u32, row as u32, pixel);
        }
    }
    Ok(image::DynamicImage::ImageRgb8(rgb))
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        UnionFind {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb.max(ra)] = rb.min(ra);
        }
    }
}

/// Group touching/overlapping detections into clusters.
///
/// Candidate pairs come from an R-tree over bounding boxes; the exact
/// test is polygon intersection (touching counts). Group labels are
/// dense, ordered by each cluster's first member.
pub fn connect_components(detections: &mut [Detection]) {
    let tree: RTree<GeomWithData<rstar::primitives::Rectangle<[f64; 2]>, usize>> = RTree::bulk_load(
        detections
            .iter()
            .enumerate()
            .map(|(index, det)| {
                let bbox = BoundingBox::of_polygon(&det.geometry);
                GeomWithData::new(
                    rstar::primitives::Rectangle::from_corners(
                        [bbox.min_x, bbox.min_y],
                        [bbox.max_x, bbox.max_y],
                    ),
                    index,
                )
            })
            .collect(),
    );

    let mut uf = UnionFind::new(detections.len());
    for (index, det) in detections.iter().enumerate() {
        let bbox = BoundingBox::of_polygon(&det.geometry);
        let envelope = AABB::from_corners([bbox.min_x, bbox.min_y], [bbox.max_x, bbox.max_y]);
        for candidate in tree.locate_in_envelope_intersecting(&envelope) {
            let other = candidate.data;
            if other > index && det.geometry.intersects(&detections[other].geometry) {
                uf.union(index, other);
            }
        }
    }

    let mut labels: Vec<Option<u64>> = vec![None; detections.len()];
    let mut next = 0u64;
    for index in 0..detections.len() {
        let root = uf.find(index);
        let label = *labels[root].get_or_insert_with(|| {
            let label = next;
            next += 1;
            label
        });
        detections[index].group = label;
    }
}

/// Cluster, then keep only the highest-probability detection per group.
pub fn deduplicate(mut detections: Vec<Detection>) -> Vec<Detection> {
    connect_components(&mut detections);
    // Stable sort: equal probabilities keep tile order.
    detections.sort_by(|a, b| b.prob.total_cmp(&a.prob));
    let mut seen = std::collections::HashSet::new();
    detections.retain(|det| seen.insert(det.group));
    detections
}
