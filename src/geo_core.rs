//! Shared geospatial primitives: bounding boxes, the pixel/map affine
//! transform and CRS reprojection.
//!
//! Reprojection uses a closed-form fast path for the only pair the
//! pipeline exercises routinely (EPSG:4326 <-> EPSG:3857) and falls back
//! to proj4rs for anything else a raster might declare.

use std::f64::consts::PI;

use geo::{Coord, LineString, Point, Polygon};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::error::Error;

/// WGS84 geographic coordinates, in degrees.
pub const EPSG_WGS84: u32 = 4326;
/// Web Mercator, in meters. The pipeline's working CRS.
pub const EPSG_WEB_MERCATOR: u32 = 3857;

const HALF_EARTH: f64 = 20_037_508.342_789_244;

/// Axis-aligned bounding box in map coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Bounding box of a polygon's exterior ring.
    pub fn of_polygon(polygon: &Polygon<f64>) -> Self {
        let mut bbox = BoundingBox::new(
            f64::INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
        );
        for coord in polygon.exterior().coords() {
            bbox.min_x = bbox.min_x.min(coord.x);
            bbox.min_y = bbox.min_y.min(coord.y);
            bbox.max_x = bbox.max_x.max(coord.x);
            bbox.max_y = bbox.max_y.max(coord.y);
        }
        bbox
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Row/column to map-coordinate affine transform.
///
/// `x = c + col * a`, `y = f + row * e` with `e` negative for north-up
/// rasters. Matches the GDAL geotransform convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    /// Pixel width in map units.
    pub a: f64,
    /// X coordinate of the top-left corner of pixel (0, 0).
    pub c: f64,
    /// Pixel height in map units (negative for north-up).
    pub e: f64,
    /// Y coordinate of the top-left corner of pixel (0, 0).
    pub f: f64,
}

impl Affine {
    /// Transform mapping a bounding box onto a `width x height` grid.
    pub fn from_bounds(bounds: BoundingBox, width: u32, height: u32) -> Self {
        Affine {
            a: bounds.width() / f64::from(width),
            c: bounds.min_x,
            e: -bounds.height() / f64::from(height),
            f: bounds.max_y,
        }
    }

    /// Map coordinates of the *center* of pixel `(row, col)`.
    pub fn xy(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.c + (col as f64 + 0.5) * self.a,
            self.f + (row as f64 + 0.5) * self.e,
        )
    }

    /// Pixel `(row, col)` containing map coordinates `(x, y)`.
    /// May be out of range for the raster; callers clamp or skip.
    pub fn rowcol(&self, x: f64, y: f64) -> (i64, i64) {
        let col = ((x - self.c) / self.a).floor() as i64;
        let row = ((y - self.f) / self.e).floor() as i64;
        (row, col)
    }

    /// Bounds covered by a `width x height` grid under this transform.
    pub fn bounds(&self, width: u32, height: u32) -> BoundingBox {
        let max_x = self.c + f64::from(width) * self.a;
        let min_y = self.f + f64::from(height) * self.e;
        BoundingBox::new(self.c, min_y, max_x, self.f)
    }
}

fn lon_to_merc_x(lon: f64) -> f64 {
    lon * HALF_EARTH / 180.0
}

fn lat_to_merc_y(lat: f64) -> f64 {
    let y = ((90.0 + lat) * PI / 360.0).tan().ln() / PI;
    y * HALF_EARTH
}

fn merc_x_to_lon(x: f64) -> f64 {
    x * 180.0 / HALF_EARTH
}

fn merc_y_to_lat(y: f64) -> f64 {
    let y_rad = y * PI / HALF_EARTH;
    (2.0 * y_rad.exp().atan() - PI / 2.0) * 180.0 / PI
}

fn proj_string_for_epsg(epsg: u32) -> Result<String, Error> {
    match epsg {
        EPSG_WGS84 => Ok("+proj=longlat +datum=WGS84 +no_defs".to_string()),
        EPSG_WEB_MERCATOR => Ok(
            "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 \
             +units=m +nadgrids=@null +no_defs"
                .to_string(),
        ),
        // Northern-hemisphere UTM zones show up in building rasters.
        32601..=32660 => Ok(format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            epsg - 32600
        )),
        32701..=32760 => Ok(format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            epsg - 32700
        )),
        _ => Err(Error::Crs(format!("unsupported EPSG code {epsg}"))),
    }
}

enum Strategy {
    Identity,
    LonLatToMerc,
    MercToLonLat,
    General { src: Proj, dst: Proj },
}

/// Point-wise coordinate reprojection between two EPSG codes.
pub struct CrsTransformer {
    strategy: Strategy,
}

impl CrsTransformer {
    pub fn new(src_epsg: u32, dst_epsg: u32) -> Result<Self, Error> {
        let strategy = if src_epsg == dst_epsg {
            Strategy::Identity
        } else if src_epsg == EPSG_WGS84 && dst_epsg == EPSG_WEB_MERCATOR {
            Strategy::LonLatToMerc
        } else if src_epsg == EPSG_WEB_MERCATOR && dst_epsg == EPSG_WGS84 {
            Strategy::MercToLonLat
        } else {
            let src = Proj::from_proj_string(&proj_string_for_epsg(src_epsg)?)
                .map_err(|e| Error::Crs(format!("EPSG:{src_epsg}: {e}")))?;
            let dst = Proj::from_proj_string(&proj_string_for_epsg(dst_epsg)?)
                .map_err(|e| Error::Crs(format!("EPSG:{dst_epsg}: {e}")))?;
            Strategy::General { src, dst }
        };
        Ok(CrsTransformer { strategy })
    }

    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), Error> {
        match &self.strategy {
            Strategy::Identity => Ok((x, y)),
            Strategy::LonLatToMerc => Ok((lon_to_merc_x(x), lat_to_merc_y(y))),
            Strategy::MercToLonLat => Ok((merc_x_to_lon(x), merc_y_to_lat(y))),
            Strategy::General { src, dst } => {
                // proj4rs expects geographic coordinates in radians.
                let mut point = if src.is_latlong() {
                    (x.to_radians(), y.to_radians(), 0.0)
                } else {
                    (x, y, 0.0)
                };
                transform(src, dst, &mut point).map_err(|e| Error::Crs(e.to_string()))?;
                if dst.is_latlong() {
                    Ok((point.0.to_degrees(), point.1.to_degrees()))
                } else {
                    Ok((point.0, point.1))
                }
            }
        }
    }

    pub fn transform_point(&self, point: Point<f64>) -> Result<Point<f64>, Error> {
        let (x, y) = self.transform(point.x(), point.y())?;
        Ok(Point::new(x, y))
    }

    /// Reproject every exterior-ring vertex of a polygon. Interior rings
    /// are not carried; tile and detection squares never have holes.
    pub fn transform_polygon(&self, polygon: &Polygon<f64>) -> Result<Polygon<f64>, Error> {
        let mut coords = Vec::with_capacity(polygon.exterior().0.len());
        for coord in polygon.exterior().coords() {
            let (x, y) = self.transform(coord.x, coord.y)?;
            coords.push(Coord { x, y });
        }
        Ok(Polygon::new(LineString::from(coords), vec![]))
    }
}

/// Flat-capped square of side `2 * radius` centered on a point.
///
/// The only buffering the pipeline does: sample points into tiles and CAM
/// peaks into detection footprints, always in a metric CRS.
pub fn buffer_square(center: Point<f64>, radius: f64) -> Polygon<f64> {
    let (x, y) = (center.x(), center.y());
    Polygon::new(
        LineString::from(vec![
            (x - radius, y - radius),
            (x + radius, y - radius),
            (x + radius, y + radius),
            (x - radius, y + radius),
            (x - radius, y - radius),
        ]),
        vec![],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::Area;

    #[test]
    fn mercator_round_trip() {
        let fwd = CrsTransformer::new(EPSG_WGS84, EPSG_WEB_MERCATOR).unwrap();
        let back = CrsTransformer::new(EPSG_WEB_MERCATOR, EPSG_WGS84).unwrap();
        let (mx, my) = fwd.transform(12.4924, 41.8902).unwrap();
        let (lon, lat) = back.transform(mx, my).unwrap();
        assert_relative_eq!(lon, 12.4924, epsilon = 1e-9);
        assert_relative_eq!(lat, 41.8902, epsilon = 1e-9);
    }

    #[test]
    fn mercator_known_point() {
        let fwd = CrsTransformer::new(EPSG_WGS84, EPSG_WEB_MERCATOR).unwrap();
        let (mx, my) = fwd.transform(180.0, 0.0).unwrap();
        assert_relative_eq!(mx, HALF_EARTH, epsilon = 1e-6);
        assert_relative_eq!(my, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn identity_transform() {
        let t = CrsTransformer::new(EPSG_WEB_MERCATOR, EPSG_WEB_MERCATOR).unwrap();
        assert_eq!(t.transform(10.0, 20.0).unwrap(), (10.0, 20.0));
    }

    #[test]
    fn unsupported_epsg_is_an_error() {
        assert!(CrsTransformer::new(2154, EPSG_WGS84).is_err());
    }

    #[test]
    fn affine_from_bounds_round_trip() {
        let bounds = BoundingBox::new(100.0, 200.0, 400.0, 500.0);
        let affine = Affine::from_bounds(bounds, 300, 300);
        let recovered = affine.bounds(300, 300);
        assert_relative_eq!(recovered.min_x, bounds.min_x, epsilon = 1e-9);
        assert_relative_eq!(recovered.max_y, bounds.max_y, epsilon = 1e-9);
        assert_relative_eq!(recovered.max_x, bounds.max_x, epsilon = 1e-9);
        assert_relative_eq!(recovered.min_y, bounds.min_y, epsilon = 1e-9);
    }

    #[test]
    fn affine_pixel_center() {
        let bounds = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let affine = Affine::from_bounds(bounds, 10, 10);
        assert_eq!(affine.xy(0, 0), (0.5, 9.5));
        assert_eq!(affine.xy(9, 9), (9.5, 0.5));
        assert_eq!(affine.rowcol(0.5, 9.5), (0, 0));
        assert_eq!(affine.rowcol(9.9, 0.1), (9, 9));
    }

    #[test]
    fn square_buffer_area() {
        let square = buffer_square(Point::new(5.0, 5.0), 2.0);
        assert_relative_eq!(square.unsigned_area(), 16.0, epsilon = 1e-9);
    }
}
