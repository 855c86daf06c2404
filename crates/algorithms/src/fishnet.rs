//! Fishnet planning
//!
//! Splits a region's bounding box into a regular grid of rectangular
//! request cells so that no single export exceeds the imagery source's
//! per-request size limit. Cells are emitted row-major, north row first,
//! and the cell edges are computed from the same expressions on both
//! sides of every shared boundary, so neighbouring cells meet exactly.

use geo::BoundingRect;
use geo_types::{coord, Polygon, Rect};
use ndvisync_core::{Error, Result, CRS};

/// Parameters controlling the fishnet grid
#[derive(Debug, Clone)]
pub struct FishnetParams {
    /// Number of rows (north to south)
    pub rows: usize,
    /// Number of columns (west to east)
    pub cols: usize,
    /// Buffer added on every side of the region's bounding box before
    /// splitting, in the region's units
    pub delta: f64,
    /// Only produce the first `limit` cells (debug / smoke runs)
    pub limit: Option<usize>,
}

impl Default for FishnetParams {
    fn default() -> Self {
        Self {
            rows: 8,
            cols: 6,
            delta: 0.0,
            limit: None,
        }
    }
}

/// One grid cell of the fishnet
#[derive(Debug, Clone, PartialEq)]
pub struct FishnetCell {
    pub row: usize,
    pub col: usize,
    /// Row-major position in the full grid
    pub index: usize,
    pub bounds: Rect<f64>,
    pub crs: CRS,
}

impl FishnetCell {
    /// Cell outline as a closed polygon
    pub fn polygon(&self) -> Polygon<f64> {
        self.bounds.to_polygon()
    }

    /// Bounds as (min_x, min_y, max_x, max_y)
    pub fn extent(&self) -> (f64, f64, f64, f64) {
        let (min, max) = (self.bounds.min(), self.bounds.max());
        (min.x, min.y, max.x, max.y)
    }

    /// File stem used for this cell's tile, e.g. `tile_r00_c03`
    pub fn file_stem(&self) -> String {
        format!("tile_r{:02}_c{:02}", self.row, self.col)
    }
}

/// Partition the bounding box of `region` into a `rows` x `cols` grid.
pub fn fishnet(region: &Polygon<f64>, crs: &CRS, params: &FishnetParams) -> Result<Vec<FishnetCell>> {
    let rect = region.bounding_rect().ok_or_else(|| Error::InvalidParameter {
        name: "region",
        value: "empty polygon".to_string(),
        reason: "region has no extent".to_string(),
    })?;
    fishnet_rect(rect, crs, params)
}

/// Partition `rect` into a `rows` x `cols` grid.
pub fn fishnet_rect(rect: Rect<f64>, crs: &CRS, params: &FishnetParams) -> Result<Vec<FishnetCell>> {
    if params.rows == 0 || params.cols == 0 {
        return Err(Error::InvalidParameter {
            name: "grid",
            value: format!("{}x{}", params.rows, params.cols),
            reason: "rows and cols must be at least 1".to_string(),
        });
    }
    if !params.delta.is_finite() || params.delta < 0.0 {
        return Err(Error::InvalidParameter {
            name: "delta",
            value: params.delta.to_string(),
            reason: "buffer must be a non-negative number".to_string(),
        });
    }

    let min_x = rect.min().x - params.delta;
    let min_y = rect.min().y - params.delta;
    let max_x = rect.max().x + params.delta;
    let max_y = rect.max().y + params.delta;

    if !(max_x > min_x && max_y > min_y) {
        return Err(Error::InvalidParameter {
            name: "region",
            value: format!("[{}, {}, {}, {}]", min_x, min_y, max_x, max_y),
            reason: "region must have positive width and height".to_string(),
        });
    }

    let (rows, cols) = (params.rows, params.cols);
    let width = max_x - min_x;
    let height = max_y - min_y;

    // Outer edges are pinned to the box so rounding never leaves a sliver
    let x_edge = |c: usize| {
        if c == cols {
            max_x
        } else {
            min_x + width * c as f64 / cols as f64
        }
    };
    let y_edge = |r: usize| {
        if r == rows {
            min_y
        } else {
            max_y - height * r as f64 / rows as f64
        }
    };

    let total = rows * cols;
    let count = params.limit.map_or(total, |limit| limit.min(total));

    let cells = (0..count)
        .map(|index| {
            let (row, col) = (index / cols, index % cols);
            FishnetCell {
                row,
                col,
                index,
                bounds: Rect::new(
                    coord! { x: x_edge(col), y: y_edge(row + 1) },
                    coord! { x: x_edge(col + 1), y: y_edge(row) },
                ),
                crs: crs.clone(),
            }
        })
        .collect();

    Ok(cells)
}
