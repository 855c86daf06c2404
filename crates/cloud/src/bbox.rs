//! Bounding boxes and bbox-to-pixel-window mapping.

use geo_types::{coord, Rect};
use ndvisync_core::GeoTransform;
use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Parse `[min_x, min_y, max_x, max_y]` as used by STAC.
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [a, b, c, d] => Some(Self::new(*a, *b, *c, *d)),
            _ => None,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Non-empty with ordered, finite corners
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.min_x < self.max_x
            && self.min_y < self.max_y
    }

    /// Check if two bboxes intersect.
    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_x < other.max_x
            && self.max_x > other.min_x
            && self.min_y < other.max_y
            && self.max_y > other.min_y
    }

    /// Overlapping part of two boxes
    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        self.intersects(other).then(|| {
            BBox::new(
                self.min_x.max(other.min_x),
                self.min_y.max(other.min_y),
                self.max_x.min(other.max_x),
                self.max_y.min(other.max_y),
            )
        })
    }

    /// Grow by `margin` on every side.
    pub fn expand(&self, margin: f64) -> BBox {
        BBox::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    /// `(min_x, min_y, max_x, max_y)`, the tuple form used by `GeoTransform`
    pub fn to_tuple(&self) -> (f64, f64, f64, f64) {
        (self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

impl From<Rect<f64>> for BBox {
    fn from(rect: Rect<f64>) -> Self {
        BBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

impl From<BBox> for Rect<f64> {
    fn from(b: BBox) -> Self {
        Rect::new(coord! { x: b.min_x, y: b.min_y }, coord! { x: b.max_x, y: b.max_y })
    }
}

/// Pixel window `(min_col, min_row, max_col, max_row)` (max exclusive)
/// covering `bbox`, clamped to a `width x height` image.
///
/// Returns `None` when the box misses the image.
pub fn pixel_window(
    bbox: &BBox,
    geo_transform: &GeoTransform,
    width: usize,
    height: usize,
) -> Option<(usize, usize, usize, usize)> {
    // For north-up images, min_y maps to max_row and max_y to min_row.
    let (col_a, row_a) = geo_transform.geo_to_pixel(bbox.min_x, bbox.max_y);
    let (col_b, row_b) = geo_transform.geo_to_pixel(bbox.max_x, bbox.min_y);

    let clamp = |v: f64, max: usize| (v.max(0.0) as usize).min(max);
    let min_col = clamp(col_a.min(col_b).floor(), width);
    let max_col = clamp(col_a.max(col_b).ceil(), width);
    let min_row = clamp(row_a.min(row_b).floor(), height);
    let max_row = clamp(row_a.max(row_b).ceil(), height);

    if min_col >= max_col || min_row >= max_row {
        return None;
    }
    Some((min_col, min_row, max_col, max_row))
}
