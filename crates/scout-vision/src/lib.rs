pub mod annotate;
pub mod doctor;
pub mod engine;
pub mod nms;
pub mod postprocess;
#[cfg(feature = "vision-tflite")]
pub mod tflite;

pub use engine::{InferenceEngine, InferenceOutcome};

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Axis-aligned box in pixel coordinates of the source image, `x1 < x2`, `y1 < y2`
/// for anything the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { x1: cx - w / 2.0, y1: cy - h / 2.0, x2: cx + w / 2.0, y2: cy + h / 2.0 }
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

    /// Integer pixel corners clipped to a `w`x`h` image, truncated like the
    /// detector's integer box output. `None` when nothing of the box is left.
    pub fn pixel_bounds(&self, w: u32, h: u32) -> Option<[u32; 4]> {
        if w == 0 || h == 0 || !(self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()) {
            return None;
        }
        let clip = |v: f32, max: u32| v.max(0.0).min(max as f32) as u32;
        let (x1, y1, x2, y2) = (clip(self.x1, w), clip(self.y1, h), clip(self.x2, w), clip(self.y2, h));
        if x1 >= x2 || y1 >= y2 {
            return None;
        }
        Some([x1, y1, x2, y2])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: String,
    /// 0.0..=1.0
    pub confidence: f32,
    /// Name of the model that produced it. Filled in by the engine.
    pub model: String,
}

/// One detection model. Implementations only need to honour `conf_threshold`
/// loosely; the engine filters again with the model's own threshold.
pub trait Detector: Send {
    fn detect_rgb(&mut self, img: &RgbImage, conf_threshold: f32) -> anyhow::Result<Vec<Detection>>;
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("weights not found: {0}")]
    WeightsMissing(PathBuf),
    #[error("model {name} failed to load: {reason}")]
    Backend { name: String, reason: String },
    #[error("backend {0:?} is not available in this build")]
    Unsupported(String),
}

/// Turns a model table entry into a ready detector.
pub trait ModelLoader {
    fn load(&self, model: &ModelConfig) -> Result<Box<dyn Detector>, ModelLoadError>;
}

fn default_confidence() -> u8 {
    25
}

/// `[[models]]` entry. Order in the file is the order models run and draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub path: PathBuf,
    /// B, G, R
    pub color: [u8; 3],
    /// 0..=100
    #[serde(default = "default_confidence")]
    pub confidence: u8,
    /// Class names indexed by class id. Only used by backends that decode raw tensors.
    #[serde(default)]
    pub classes: Vec<String>,
}

impl ModelConfig {
    pub fn threshold(&self) -> f32 {
        f32::from(self.confidence.min(100)) / 100.0
    }

    pub fn rgb(&self) -> Rgb<u8> {
        let [b, g, r] = self.color;
        Rgb([r, g, b])
    }
}

fn default_backend() -> String {
    "tflite".into()
}
fn default_input() -> u32 {
    640
}
fn default_nms_iou() -> f32 {
    0.45
}
fn default_max_detections() -> usize {
    100
}
fn default_threads() -> i32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// "tflite" | "none"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Suppress overlapping boxes across models. Off unless set.
    #[serde(default)]
    pub cross_model_nms_iou: Option<f32>,
    #[serde(default = "default_input")]
    pub img_w: u32,
    #[serde(default = "default_input")]
    pub img_h: u32,
    /// Per-model NMS applied by raw-tensor backends.
    #[serde(default = "default_nms_iou")]
    pub nms_iou_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_threads")]
    pub num_threads: i32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            cross_model_nms_iou: None,
            img_w: default_input(),
            img_h: default_input(),
            nms_iou_threshold: default_nms_iou(),
            max_detections: default_max_detections(),
            num_threads: default_threads(),
        }
    }
}

/// Loader that has no backend to offer; every model is skipped.
pub struct NoBackend(pub String);

impl ModelLoader for NoBackend {
    fn load(&self, _model: &ModelConfig) -> Result<Box<dyn Detector>, ModelLoadError> {
        Err(ModelLoadError::Unsupported(self.0.clone()))
    }
}

/// Picks the loader for `vision.backend`.
pub fn loader_for(cfg: &VisionConfig) -> anyhow::Result<Box<dyn ModelLoader>> {
    match cfg.backend.as_str() {
        #[cfg(feature = "vision-tflite")]
        "tflite" => Ok(Box::new(tflite::TfliteLoader::new(cfg.clone()))),
        #[cfg(not(feature = "vision-tflite"))]
        "tflite" => {
            tracing::warn!("vision: built without --features vision-tflite, no model will load");
            Ok(Box::new(NoBackend("tflite".into())))
        }
        "none" => Ok(Box::new(NoBackend("none".into()))),
        other => anyhow::bail!("unknown vision.backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_config_defaults_and_color_order() {
        let m: ModelConfig =
            serde_json::from_str(r#"{"name":"cones","path":"w/cones.tflite","color":[255,0,0]}"#).unwrap();
        assert_eq!(m.confidence, 25);
        assert!((m.threshold() - 0.25).abs() < 1e-6);
        // configured as B,G,R
        assert_eq!(m.rgb(), Rgb([0, 0, 255]));
    }

    #[test]
    fn pixel_bounds_clip_and_reject_empty() {
        let b = BoundingBox::new(-5.0, 2.9, 12.7, 30.0);
        assert_eq!(b.pixel_bounds(10, 20), Some([0, 2, 10, 20]));
        assert_eq!(BoundingBox::new(4.0, 4.0, 4.5, 9.0).pixel_bounds(10, 10), None);
        assert_eq!(BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).pixel_bounds(10, 10), None);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let cfg = VisionConfig { backend: "onnx".into(), ..VisionConfig::default() };
        assert!(loader_for(&cfg).is_err());
        let none = VisionConfig { backend: "none".into(), ..VisionConfig::default() };
        let m = ModelConfig { name: "m".into(), path: "x".into(), color: [0, 0, 0], confidence: 50, classes: vec![] };
        assert!(matches!(loader_for(&none).unwrap().load(&m), Err(ModelLoadError::Unsupported(_))));
    }
}
