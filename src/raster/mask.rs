//! Polygon masking over a decoded raster.
//!
//! Mirrors the upstream building-density gate: mask the raster with a
//! geometry, map the sentinel value 255 to 1, and sum what remains.

use geo::{Contains, Point, Polygon};

use crate::geo_core::BoundingBox;
use crate::raster::geotiff::Raster;

/// Sum of band-0 pixel values whose centers fall inside `geometry`,
/// with the value 255 counted as 1.
///
/// `geometry` must be in the raster's own CRS. Pixels outside the raster
/// extent contribute nothing; an empty intersection sums to zero.
pub fn masked_pixel_sum(raster: &Raster, geometry: &Polygon<f64>) -> u64 {
    let bbox = BoundingBox::of_polygon(geometry);

    // Clip the scan window to the raster grid.
    let (top, left) = raster.affine.rowcol(bbox.min_x, bbox.max_y);
    let (bottom, right) = raster.affine.rowcol(bbox.max_x, bbox.min_y);
    let row_start = top.max(0) as usize;
    let row_end = (bottom.min(raster.height as i64 - 1)).max(-1);
    let col_start = left.max(0) as usize;
    let col_end = (right.min(raster.width as i64 - 1)).max(-1);
    if row_end < 0 || col_end < 0 {
        return 0;
    }

    let mut sum: u64 = 0;
    for row in row_start..=row_end as usize {
        for col in col_start..=col_end as usize {
            let (x, y) = raster.affine.xy(row, col);
            if geometry.contains(&Point::new(x, y)) {
                let value = raster.sample(row, col, 0);
                sum += if value == 255 { 1 } else { u64::from(value) };
            }
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::{buffer_square, Affine, EPSG_WEB_MERCATOR};

    fn raster_with(data: Vec<u8>, width: u32, height: u32) -> Raster {
        Raster {
            width,
            height,
            channels: 1,
            data,
            affine: Affine {
                a: 1.0,
                c: 0.0,
                e: -1.0,
                f: height as f64,
            },
            epsg: EPSG_WEB_MERCATOR,
        }
    }

    #[test]
    fn sentinel_pixels_count_as_one() {
        // One 255 pixel and one raw value inside a 10x10 raster.
        let mut data = vec![0u8; 100];
        data[0] = 255; // row 0, col 0 -> center (0.5, 9.5)
        data[11] = 3; // row 1, col 1 -> center (1.5, 8.5)
        let raster = raster_with(data, 10, 10);

        let all = buffer_square(Point::new(5.0, 5.0), 5.0);
        assert_eq!(masked_pixel_sum(&raster, &all), 4);
    }

    #[test]
    fn pixels_outside_geometry_are_ignored() {
        let mut data = vec![0u8; 100];
        data[0] = 255;
        let raster = raster_with(data, 10, 10);

        // Square far from the (0, 0) pixel.
        let far = buffer_square(Point::new(8.0, 2.0), 1.5);
        assert_eq!(masked_pixel_sum(&raster, &far), 0);
    }

    #[test]
    fn geometry_off_the_raster_sums_to_zero() {
        let raster = raster_with(vec![255u8; 100], 10, 10);
        let outside = buffer_square(Point::new(100.0, 100.0), 2.0);
        assert_eq!(masked_pixel_sum(&raster, &outside), 0);
    }

    #[test]
    fn window_is_clipped_to_extent() {
        let raster = raster_with(vec![255u8; 100], 10, 10);
        // Square overlapping the raster corner; 4 pixel centers inside.
        let corner = buffer_square(Point::new(0.0, 10.0), 2.0);
        assert_eq!(masked_pixel_sum(&raster, &corner), 4);
    }
}
