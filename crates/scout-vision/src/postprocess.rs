//! Decoding of raw detector tensors.

use crate::nms;
use crate::{BoundingBox, Detection};

/// One prediction row, coordinates normalized to the model input (0..1).
#[derive(Debug, Clone, Copy)]
pub struct RawPrediction {
    pub class_id: usize,
    pub conf: f32,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl RawPrediction {
    /// Scales to pixel coordinates of an image of `w`x`h`.
    pub fn to_pixels(&self, w: u32, h: u32) -> BoundingBox {
        let (w, h) = (w as f32, h as f32);
        BoundingBox::from_center(self.cx * w, self.cy * h, self.w * w, self.h * h)
    }
}

pub fn postprocess_ultralytics(raw: &[f32], num_preds: usize, num_classes: usize, conf_th: f32) -> Vec<RawPrediction> {
    // [cx, cy, w, h, obj, cls0..]
    let stride = 5 + num_classes;
    let mut out = Vec::new();

    for i in 0..num_preds {
        let base = i * stride;
        if base + stride > raw.len() { break; }
        let row = &raw[base..base + stride];

        let mut best_c = 0usize;
        let mut best_p = 0.0f32;
        for (c, &p) in row[5..].iter().enumerate() {
            if p > best_p { best_p = p; best_c = c; }
        }
        let conf = row[4] * best_p;
        if conf >= conf_th {
            out.push(RawPrediction { class_id: best_c, conf, cx: row[0], cy: row[1], w: row[2], h: row[3] });
        }
    }
    out
}

/// Class-agnostic NMS within one model, capped at `max_det`.
pub fn nms_filter(dets: Vec<Detection>, iou_th: f32, max_det: usize) -> Vec<Detection> {
    let mut dets = dets;
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();

    'outer: for d in dets {
        for k in &kept {
            if nms::iou(&d.bbox, &k.bbox) >= iou_th {
                continue 'outer;
            }
        }
        kept.push(d);
        if kept.len() >= max_det { break; }
    }
    kept
}
