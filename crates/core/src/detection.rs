//! Detection post-processing: class-aware overlap suppression and
//! conversion of pixel rectangles to frame-relative percentages.
//!
//! A detector can emit several overlapping boxes for one real object.
//! [`post_process`] keeps the most confident box of each overlapping
//! same-class cluster and expresses the survivors as percentages of the
//! frame so overlays stay valid at any render size.

use serde::{Deserialize, Serialize};

/// Default IoU above which a weaker same-class box is suppressed.
pub const DEFAULT_DEDUP_IOU_THRESHOLD: f32 = 0.8;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Axis-aligned rectangle in absolute pixel coordinates (`x1,y1` top-left,
/// `x2,y2` bottom-right).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PixelBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

/// One box as returned by the detector, before suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_label: String,
    /// Model confidence in `0.0..=1.0`.
    pub confidence: f32,
    pub bbox: PixelBox,
}

/// A published detection. Coordinates are percentages of the frame's
/// width/height, all within `0..=100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label.
    pub name: String,
    /// Confidence as an integer percentage.
    pub confidence: u8,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Intersection-over-Union of two rectangles, in `0.0..=1.0`.
///
/// Defined as 0 when the union area is 0.
pub fn iou(a: &PixelBox, b: &PixelBox) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

// ---------------------------------------------------------------------------
// Suppression
// ---------------------------------------------------------------------------

/// Greedy class-aware suppression.
///
/// Returns the indices (into `detections`) of the kept boxes, most
/// confident first. Equal confidences keep their input order. A threshold
/// `<= 0` disables suppression and keeps every box in input order.
pub fn suppress_overlaps(detections: &[RawDetection], iou_threshold: f32) -> Vec<usize> {
    if detections.is_empty() {
        return Vec::new();
    }
    if iou_threshold <= 0.0 {
        return (0..detections.len()).collect();
    }

    // `sort_by` is stable, so ties keep their relative order.
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .total_cmp(&detections[a].confidence)
    });

    let mut suppressed = vec![false; detections.len()];
    let mut keep = Vec::new();

    for (pos, &idx) in order.iter().enumerate() {
        if suppressed[idx] {
            continue;
        }
        keep.push(idx);

        let kept = &detections[idx];
        for &other in &order[pos + 1..] {
            if suppressed[other] {
                continue;
            }
            let candidate = &detections[other];
            if candidate.class_label == kept.class_label
                && iou(&kept.bbox, &candidate.bbox) > iou_threshold
            {
                suppressed[other] = true;
            }
        }
    }

    keep
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Convert a pixel-space detection into frame-relative percentages.
///
/// The rectangle is clipped to the frame first, so every output
/// coordinate lies in `0..=100`.
pub fn to_percent(detection: &RawDetection, frame_width: u32, frame_height: u32) -> Detection {
    let fw = frame_width as f32;
    let fh = frame_height as f32;

    let (left, width) = axis_percent(detection.bbox.x1, detection.bbox.x2, fw);
    let (top, height) = axis_percent(detection.bbox.y1, detection.bbox.y2, fh);

    Detection {
        name: detection.class_label.clone(),
        confidence: confidence_percent(detection.confidence),
        left,
        top,
        width,
        height,
    }
}

fn axis_percent(start: f32, end: f32, extent: f32) -> (f32, f32) {
    if extent <= 0.0 {
        return (0.0, 0.0);
    }
    let lo = start.clamp(0.0, extent);
    let hi = end.clamp(0.0, extent);
    let offset = lo / extent * 100.0;
    let size = (hi - lo).max(0.0) / extent * 100.0;
    (offset, size)
}

/// `0.0..=1.0` to a truncated integer percentage.
fn confidence_percent(confidence: f32) -> u8 {
    if !confidence.is_finite() {
        return 0;
    }
    (confidence * 100.0).clamp(0.0, 100.0) as u8
}

/// Suppress overlapping same-class boxes and normalise the survivors.
///
/// Suppression is applied to the whole frame before anything is returned,
/// so callers never observe a partially deduplicated set.
pub fn post_process(
    detections: &[RawDetection],
    frame_width: u32,
    frame_height: u32,
    iou_threshold: f32,
) -> Vec<Detection> {
    suppress_overlaps(detections, iou_threshold)
        .into_iter()
        .map(|idx| to_percent(&detections[idx], frame_width, frame_height))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
