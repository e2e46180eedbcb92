//! Geographic bounding boxes and their pixel windows in georeferenced rasters.
//!
//! Two rasters compared side by side need not share a grid, so each one gets
//! its own [`PixelWindow`], derived from the same [`BoundingBox`] through that
//! raster's own [`AffineTransform`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum WindowError {
    #[error("Affine transform is not invertible (determinant {0})")]
    SingularTransform(f64),
}

/// Pixel ↔ geographic mapping of a north-up or rotated raster.
///
/// Same coefficient order as rasterio's `Affine(a, b, c, d, e, f)`:
/// `x = a*col + b*row + c`, `y = d*col + e*row + f`, where `x` is longitude and
/// `y` latitude, and `(col, row)` addresses the pixel's upper-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl AffineTransform {
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// North-up grid: `west`/`north` is the outer corner of pixel (0, 0).
    pub fn from_origin(west: f64, north: f64, x_size: f64, y_size: f64) -> Self {
        Self::new(x_size, 0.0, west, 0.0, -y_size, north)
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    /// Geographic `(x, y)` of fractional pixel `(col, row)`.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Fractional pixel `(col, row)` of geographic `(x, y)`.
    pub fn invert(&self, x: f64, y: f64) -> Result<(f64, f64), WindowError> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return Err(WindowError::SingularTransform(det));
        }
        let dx = x - self.c;
        let dy = y - self.f;
        let col = (self.e * dx - self.b * dy) / det;
        let row = (-self.d * dx + self.a * dy) / det;
        Ok((col, row))
    }
}

/// Degrees added around the geocoded point. The defaults frame the Indian
/// subcontinent around Delhi: more room east than west, more south than north.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxOffsets {
    pub west: f64,
    pub east: f64,
    pub south: f64,
    pub north: f64,
}

impl Default for BoxOffsets {
    fn default() -> Self {
        Self {
            west: 17.0,
            east: 23.0,
            south: 25.0,
            north: 15.0,
        }
    }
}

impl BoxOffsets {
    pub fn validate(&self) -> Result<(), String> {
        let all = [self.west, self.east, self.south, self.north];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(format!("box offsets must be finite and non-negative: {:?}", self));
        }
        if self.west + self.east == 0.0 || self.south + self.north == 0.0 {
            return Err("box offsets describe an empty box".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl BoundingBox {
    pub fn around(latitude: f64, longitude: f64, offsets: &BoxOffsets) -> Self {
        Self {
            lon_min: longitude - offsets.west,
            lon_max: longitude + offsets.east,
            lat_min: latitude - offsets.south,
            lat_max: latitude + offsets.north,
        }
    }

    /// `[lon_min, lon_max, lat_min, lat_max]`, the order used for axis extents
    pub fn extent(&self) -> [f64; 4] {
        [self.lon_min, self.lon_max, self.lat_min, self.lat_max]
    }
}

/// Rows `row_off..row_off + height`, columns `col_off..col_off + width`.
///
/// Offsets are signed: a box reaching past the raster edge yields a window that
/// starts before pixel 0, and it is the reader's job to reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub row_off: i64,
    pub col_off: i64,
    pub height: i64,
    pub width: i64,
}

impl PixelWindow {
    pub fn is_empty(&self) -> bool {
        self.height <= 0 || self.width <= 0
    }

    /// Whether the window lies entirely inside a `rows` × `cols` raster.
    pub fn fits_within(&self, rows: usize, cols: usize) -> bool {
        !self.is_empty()
            && self.row_off >= 0
            && self.col_off >= 0
            && self.row_off + self.height <= rows as i64
            && self.col_off + self.width <= cols as i64
    }
}

/// Integer `(row, col)` of the pixel containing `(lat, lon)`.
///
/// Fractional pixel coordinates are floored, not truncated toward zero. The
/// two agree inside the raster; a point up to one pixel north or west of the
/// edge maps to row or column `-1` instead of `0`, and a window built from it
/// no longer fits the raster.
pub fn latlon_to_pixel(
    transform: &AffineTransform,
    lat: f64,
    lon: f64,
) -> Result<(i64, i64), WindowError> {
    let (col, row) = transform.invert(lon, lat)?;
    Ok((row.floor() as i64, col.floor() as i64))
}

/// Centre `(lat, lon)` of pixel `(row, col)`.
pub fn pixel_to_latlon(transform: &AffineTransform, row: i64, col: i64) -> (f64, f64) {
    let (x, y) = transform.apply(col as f64 + 0.5, row as f64 + 0.5);
    (y, x)
}

/// Window covering `bbox`: the south-west corner gives the last row and first
/// column, the north-east corner the first row and last column.
pub fn window_for_bbox(
    transform: &AffineTransform,
    bbox: &BoundingBox,
) -> Result<PixelWindow, WindowError> {
    let (row_max, col_min) = latlon_to_pixel(transform, bbox.lat_min, bbox.lon_min)?;
    let (row_min, col_max) = latlon_to_pixel(transform, bbox.lat_max, bbox.lon_max)?;

    Ok(PixelWindow {
        row_off: row_min,
        col_off: col_min,
        height: row_max - row_min,
        width: col_max - col_min,
    })
}
