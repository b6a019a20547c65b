//! GeoTIFF read/write on top of the `tiff` crate.
//!
//! Georeferencing is carried by three tags: ModelPixelScale (33550),
//! ModelTiepoint (33922) and the GeoKeyDirectory (34735). That is all the
//! upstream building rasters carry and all the georeferencer writes; no
//! attempt is made to support the wider GeoTIFF zoo.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::Error;
use crate::geo_core::{Affine, EPSG_WGS84};

const KEY_MODEL_TYPE: u32 = 1024;
const KEY_RASTER_TYPE: u32 = 1025;
const KEY_GEOGRAPHIC_TYPE: u32 = 2048;
const KEY_PROJECTED_CS_TYPE: u32 = 3072;

/// A decoded raster: interleaved u8 samples plus georeferencing.
#[derive(Debug, Clone)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    /// Samples per pixel (1 for building masks, 3 for imagery).
    pub channels: usize,
    /// Row-major, channel-interleaved.
    pub data: Vec<u8>,
    pub affine: Affine,
    pub epsg: u32,
}

impl Raster {
    /// Sample value at `(row, col)` for one channel. Panics out of range;
    /// callers stay inside `width`/`height`.
    pub fn sample(&self, row: usize, col: usize, channel: usize) -> u8 {
        self.data[(row * self.width as usize + col) * self.channels + channel]
    }
}

fn raster_err(path: &Path, reason: impl ToString) -> Error {
    Error::Raster {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// EPSG code from a GeoKeyDirectory, preferring the projected CS key.
fn epsg_from_geokeys(keys: &[u32]) -> Option<u32> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    let mut projected = None;
    let mut geographic = None;
    for entry in keys[4..].chunks_exact(4).take(count) {
        let (key_id, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 {
            continue;
        }
        match key_id {
            KEY_PROJECTED_CS_TYPE => projected = Some(value),
            KEY_GEOGRAPHIC_TYPE => geographic = Some(value),
            _ => {}
        }
    }
    projected.or(geographic)
}

/// Decode a GeoTIFF with its affine transform and CRS.
pub fn read_geotiff(path: &Path) -> Result<Raster, Error> {
    let file = File::open(path).map_err(|e| raster_err(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| raster_err(path, e))?;

    let (width, height) = decoder.dimensions().map_err(|e| raster_err(path, e))?;
    let channels = match decoder.colortype().map_err(|e| raster_err(path, e))? {
        tiff::ColorType::Gray(8) => 1,
        tiff::ColorType::RGB(8) => 3,
        tiff::ColorType::RGBA(8) => 4,
        other => return Err(raster_err(path, format!("unsupported color type {other:?}"))),
    };

    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .map_err(|_| raster_err(path, "missing ModelPixelScale tag"))?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .map_err(|_| raster_err(path, "missing ModelTiepoint tag"))?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(raster_err(path, "malformed georeferencing tags"));
    }
    // Tiepoint anchors raster (i, j) at map (x, y); normalize to pixel (0, 0).
    let affine = Affine {
        a: scale[0],
        c: tiepoint[3] - tiepoint[0] * scale[0],
        e: -scale[1],
        f: tiepoint[4] + tiepoint[1] * scale[1],
    };

    let epsg = decoder
        .get_tag_u32_vec(Tag::GeoKeyDirectoryTag)
        .ok()
        .and_then(|keys| epsg_from_geokeys(&keys))
        .unwrap_or(EPSG_WGS84);

    let data = match decoder.read_image().map_err(|e| raster_err(path, e))? {
        DecodingResult::U8(v) => v,
        _ => return Err(raster_err(path, "expected 8-bit samples")),
    };

    Ok(Raster {
        width,
        height,
        channels,
        data,
        affine,
        epsg,
    })
}

fn geokey_directory(epsg: u32) -> Vec<u16> {
    // Raster type is pixel-is-area; model type 1 = projected, 2 = geographic.
    let (model_type, cs_key) = if epsg == EPSG_WGS84 {
        (2u16, KEY_GEOGRAPHIC_TYPE as u16)
    } else {
        (1u16, KEY_PROJECTED_CS_TYPE as u16)
    };
    vec![
        1, 1, 0, 3, // header: version, revision, minor, key count
        KEY_MODEL_TYPE as u16, 0, 1, model_type,
        KEY_RASTER_TYPE as u16, 0, 1, 1,
        cs_key, 0, 1, epsg as u16,
    ]
}

/// Encode an interleaved u8 raster as a GeoTIFF with nodata 0.
///
/// `channels` must be 1 (gray) or 3 (RGB) and `data` must hold exactly
/// `width * height * channels` samples.
pub fn write_geotiff(
    path: &Path,
    width: u32,
    height: u32,
    channels: usize,
    data: &[u8],
    affine: Affine,
    epsg: u32,
) -> Result<(), Error> {
    if data.len() != width as usize * height as usize * channels {
        return Err(raster_err(path, "data length does not match dimensions"));
    }
    let file = File::create(path).map_err(|e| raster_err(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(|e| raster_err(path, e))?;

    let scale = [affine.a, -affine.e, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, affine.c, affine.f, 0.0];
    let geokeys = geokey_directory(epsg);

    // The image encoder type differs per color type; a macro keeps the
    // tag-writing identical across arms.
    macro_rules! encode {
        ($color:ty) => {{
            let mut image = encoder
                .new_image::<$color>(width, height)
                .map_err(|e| raster_err(path, e))?;
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &scale[..])
                .map_err(|e| raster_err(path, e))?;
            image
                .encoder()
                .write_tag(Tag::ModelTiepointTag, &tiepoint[..])
                .map_err(|e| raster_err(path, e))?;
            image
                .encoder()
                .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])
                .map_err(|e| raster_err(path, e))?;
            image
                .encoder()
                .write_tag(Tag::GdalNodata, "0")
                .map_err(|e| raster_err(path, e))?;
            image.write_data(data).map_err(|e| raster_err(path, e))?;
        }};
    }

    match channels {
        1 => encode!(colortype::Gray8),
        3 => encode!(colortype::RGB8),
        n => return Err(raster_err(path, format!("unsupported channel count {n}"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::{BoundingBox, EPSG_WEB_MERCATOR};
    use approx::assert_relative_eq;

    #[test]
    fn rgb_round_trip_preserves_bounds_and_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.tif");

        let bounds = BoundingBox::new(1000.0, 2000.0, 1500.0, 2500.0);
        let affine = Affine::from_bounds(bounds, 10, 10);
        let data: Vec<u8> = (0..10 * 10 * 3).map(|i| (i % 251) as u8).collect();
        write_geotiff(&path, 10, 10, 3, &data, affine, EPSG_WEB_MERCATOR).unwrap();

        let raster = read_geotiff(&path).unwrap();
        assert_eq!(raster.width, 10);
        assert_eq!(raster.channels, 3);
        assert_eq!(raster.epsg, EPSG_WEB_MERCATOR);
        assert_eq!(raster.data, data);

        let recovered = raster.affine.bounds(raster.width, raster.height);
        let tol = raster.affine.a.abs();
        assert_relative_eq!(recovered.min_x, bounds.min_x, epsilon = tol);
        assert_relative_eq!(recovered.min_y, bounds.min_y, epsilon = tol);
        assert_relative_eq!(recovered.max_x, bounds.max_x, epsilon = tol);
        assert_relative_eq!(recovered.max_y, bounds.max_y, epsilon = tol);
    }

    #[test]
    fn gray_round_trip_keeps_crs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.tif");

        let affine = Affine {
            a: 0.5,
            c: 10.0,
            e: -0.5,
            f: 20.0,
        };
        let data = vec![255u8; 16];
        write_geotiff(&path, 4, 4, 1, &data, affine, EPSG_WGS84).unwrap();

        let raster = read_geotiff(&path).unwrap();
        assert_eq!(raster.epsg, EPSG_WGS84);
        assert_eq!(raster.sample(0, 0, 0), 255);
        assert_relative_eq!(raster.affine.a, 0.5);
        assert_relative_eq!(raster.affine.f, 20.0);
    }

    #[test]
    fn wrong_data_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tif");
        let affine = Affine {
            a: 1.0,
            c: 0.0,
            e: -1.0,
            f: 0.0,
        };
        let out = write_geotiff(&path, 4, 4, 3, &[0u8; 10], affine, EPSG_WGS84);
        assert!(out.is_err());
    }

    #[test]
    fn geokey_lookup_prefers_projected() {
        let keys = geokey_directory(EPSG_WEB_MERCATOR);
        let keys_u32: Vec<u32> = keys.iter().map(|&k| u32::from(k)).collect();
        assert_eq!(epsg_from_geokeys(&keys_u32), Some(EPSG_WEB_MERCATOR));
    }
}
