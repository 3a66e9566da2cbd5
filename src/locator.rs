//! Text match selection
//!
//! Turns a raw detection set into a single actionable screen coordinate:
//! filter by confidence and substring containment, pick the requested
//! ordinal occurrence, and map the polygon center back into full-frame
//! pixel coordinates.

use tracing::debug;

use crate::provider::DetectedText;

/// Outcome of a text search. The only type returned across the engine
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Whether any detection satisfied the query.
    pub found: bool,
    /// Center of the selected detection, in full-frame pixels.
    pub center: (u32, u32),
    /// Full text of the selected detection.
    pub text: String,
    /// Confidence of the selected detection (0.0 - 1.0).
    pub confidence: f32,
    /// Axis-aligned bounding box of the selected detection as
    /// (x, y, width, height), in full-frame pixels.
    pub bbox: (u32, u32, u32, u32),
    /// Number of detections that satisfied the query.
    pub total_matches: usize,
    /// 1-based index of the selected match; 0 when not found.
    pub selected_index: usize,
}

impl MatchResult {
    /// The empty result.
    pub fn not_found() -> Self {
        Self {
            found: false,
            center: (0, 0),
            text: String::new(),
            confidence: 0.0,
            bbox: (0, 0, 0, 0),
            total_matches: 0,
            selected_index: 0,
        }
    }
}

/// Select a match for `target` among `detections`.
///
/// A detection qualifies when its confidence reaches `confidence_threshold`
/// and `target` is a substring of its text. Provider detection order is
/// preserved for ordinal indexing; `occurrence` is 1-based and clamps to
/// the last qualifying match when it exceeds the match count.
///
/// `scale` maps probe-image pixels back to frame pixels (the probe may have
/// been downscaled before recognition) and `offset` is the pixel origin of
/// the searched region within the full frame.
pub fn select(
    detections: &[DetectedText],
    target: &str,
    confidence_threshold: f32,
    occurrence: usize,
    scale: f32,
    offset: (u32, u32),
) -> MatchResult {
    let matches: Vec<&DetectedText> = detections
        .iter()
        .filter(|d| d.confidence >= confidence_threshold && d.text.contains(target))
        .collect();

    if matches.is_empty() {
        debug!(
            "No match for '{}' among {} detections (threshold {})",
            target,
            detections.len(),
            confidence_threshold
        );
        return MatchResult::not_found();
    }

    let index = occurrence.max(1).min(matches.len());
    let chosen = matches[index - 1];

    let (cx, cy) = quad_center(&chosen.quad);
    let (bx, by, bw, bh) = quad_bounds(&chosen.quad);

    MatchResult {
        found: true,
        center: (
            to_frame(cx, scale, offset.0),
            to_frame(cy, scale, offset.1),
        ),
        text: chosen.text.clone(),
        confidence: chosen.confidence,
        bbox: (
            to_frame(bx, scale, offset.0),
            to_frame(by, scale, offset.1),
            (bw * scale).round() as u32,
            (bh * scale).round() as u32,
        ),
        total_matches: matches.len(),
        selected_index: index,
    }
}

/// Arithmetic mean of the four polygon corners.
fn quad_center(quad: &[(f32, f32); 4]) -> (f32, f32) {
    let sx: f32 = quad.iter().map(|p| p.0).sum();
    let sy: f32 = quad.iter().map(|p| p.1).sum();
    (sx / 4.0, sy / 4.0)
}

/// Axis-aligned bounds of the polygon as (x, y, w, h).
fn quad_bounds(quad: &[(f32, f32); 4]) -> (f32, f32, f32, f32) {
    let min_x = quad.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let max_x = quad.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = quad.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_y = quad.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
    (min_x, min_y, max_x - min_x, max_y - min_y)
}

fn to_frame(value: f32, scale: f32, offset: u32) -> u32 {
    ((value * scale).round().max(0.0) as u32).saturating_add(offset)
}
