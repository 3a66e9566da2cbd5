//! Screen region grid
//!
//! Partitions a frame into a 3×3 grid of numbered cells (1-9, row-major)
//! and merges a set of cell ids into a single pixel rectangle. Scoping
//! recognition to a region both speeds up the OCR call and disambiguates
//! repeated text on screen.

use tracing::warn;

/// Number of cells per grid row/column.
const GRID_DIM: u32 = 3;

/// A pixel rectangle as (x, y, width, height).
pub type Rect = (u32, u32, u32, u32);

/// Normalize a set of region ids: drop invalid ids (with a warning),
/// deduplicate and sort. An empty result means "full frame".
pub fn normalize_region_ids(region_ids: &[u8]) -> Vec<u8> {
    let mut valid: Vec<u8> = Vec::with_capacity(region_ids.len());

    for &id in region_ids {
        if (1..=9).contains(&id) {
            if !valid.contains(&id) {
                valid.push(id);
            }
        } else {
            warn!("Ignoring invalid region id {} (expected 1-9)", id);
        }
    }

    valid.sort_unstable();
    valid
}

/// Merge a set of grid cell ids into the minimal pixel rectangle covering
/// every selected cell.
///
/// Invalid ids are dropped; an empty or all-invalid set yields the full
/// frame. When the merged span reaches the last grid row or column, the
/// rectangle is extended to the frame edge so integer division of the
/// frame size never leaves an uncovered remainder strip.
pub fn merge_regions(region_ids: &[u8], frame_w: u32, frame_h: u32) -> Rect {
    let valid = normalize_region_ids(region_ids);

    if valid.is_empty() {
        return (0, 0, frame_w, frame_h);
    }

    let mut min_row = GRID_DIM - 1;
    let mut max_row = 0;
    let mut min_col = GRID_DIM - 1;
    let mut max_col = 0;

    for &id in &valid {
        let row = (id as u32 - 1) / GRID_DIM;
        let col = (id as u32 - 1) % GRID_DIM;
        min_row = min_row.min(row);
        max_row = max_row.max(row);
        min_col = min_col.min(col);
        max_col = max_col.max(col);
    }

    let cell_w = frame_w / GRID_DIM;
    let cell_h = frame_h / GRID_DIM;

    let x = min_col * cell_w;
    let y = min_row * cell_h;

    // Last row/column absorbs the integer-division remainder.
    let w = if max_col == GRID_DIM - 1 {
        frame_w - x
    } else {
        (max_col + 1) * cell_w - x
    };
    let h = if max_row == GRID_DIM - 1 {
        frame_h - y
    } else {
        (max_row + 1) * cell_h - y
    };

    (x, y, w, h)
}

/// Pixel rectangle of a single cell id within a frame. Panics on an
/// invalid id; callers validate via [`normalize_region_ids`] first.
#[cfg(test)]
fn cell_rect(id: u8, frame_w: u32, frame_h: u32) -> Rect {
    merge_regions(&[id], frame_w, frame_h)
}
