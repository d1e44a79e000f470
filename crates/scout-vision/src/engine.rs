//! Multi-model inference over one image.

use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::annotate;
use crate::nms;
use crate::{Detection, Detector, ModelConfig, ModelLoader};

struct LoadedModel {
    cfg: ModelConfig,
    detector: Mutex<Box<dyn Detector>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutcome {
    /// One label per detection, in drawing order.
    pub labels: Vec<String>,
    pub elapsed_ms: u64,
    pub annotated_path: Option<PathBuf>,
    pub detections: Vec<Detection>,
}

/// The fixed set of models loaded at startup. Shared behind an `Arc`; each
/// detector sits behind its own lock so concurrent requests queue per model.
pub struct InferenceEngine {
    models: Vec<LoadedModel>,
    predicted_dir: PathBuf,
    cross_model_nms_iou: Option<f32>,
}

impl InferenceEngine {
    /// Loads every configured model in order. Models with missing weights or a
    /// failing backend are skipped with a warning; an empty engine is valid.
    pub fn load(
        configs: &[ModelConfig],
        loader: &dyn ModelLoader,
        predicted_dir: impl Into<PathBuf>,
        cross_model_nms_iou: Option<f32>,
    ) -> Result<Self> {
        let mut loaded = Vec::new();
        for cfg in configs {
            if !cfg.path.exists() {
                warn!("vision: model {} skipped, weights not found at {}", cfg.name, cfg.path.display());
                continue;
            }
            match loader.load(cfg) {
                Ok(detector) => {
                    info!("vision: loaded model {} ({})", cfg.name, cfg.path.display());
                    loaded.push((cfg.clone(), detector));
                }
                Err(e) => warn!("vision: model {} skipped: {}", cfg.name, e),
            }
        }
        if loaded.is_empty() {
            warn!("vision: no detection model loaded, uploads will be logged without objects");
        }
        Self::with_detectors(loaded, predicted_dir, cross_model_nms_iou)
    }

    pub fn with_detectors(
        models: Vec<(ModelConfig, Box<dyn Detector>)>,
        predicted_dir: impl Into<PathBuf>,
        cross_model_nms_iou: Option<f32>,
    ) -> Result<Self> {
        let predicted_dir = predicted_dir.into();
        std::fs::create_dir_all(&predicted_dir)
            .with_context(|| format!("create predicted dir {}", predicted_dir.display()))?;
        Ok(Self {
            models: models
                .into_iter()
                .map(|(cfg, detector)| LoadedModel { cfg, detector: Mutex::new(detector) })
                .collect(),
            predicted_dir,
            cross_model_nms_iou,
        })
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.cfg.name.as_str()).collect()
    }

    pub fn predicted_dir(&self) -> &Path {
        &self.predicted_dir
    }

    pub fn annotated_path(&self, frame_id: &str) -> PathBuf {
        self.predicted_dir.join(format!("{}_detected.jpg", frame_id))
    }

    /// Runs every model on the image at `image_path` and writes the annotated
    /// copy as `{frame_id}_detected.jpg`. An unreadable image yields an empty
    /// outcome with no artifact.
    pub fn run_inference(&self, image_path: &Path, frame_id: &str) -> InferenceOutcome {
        let img = match image::open(image_path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!("vision: cannot read {}: {}", image_path.display(), e);
                return InferenceOutcome::default();
            }
        };

        let start = Instant::now();
        let mut found: Vec<(usize, Detection)> = Vec::new();
        for (idx, model) in self.models.iter().enumerate() {
            for det in self.detect_one(model, &img) {
                found.push((idx, det));
            }
        }

        if let Some(iou_th) = self.cross_model_nms_iou {
            let dets: Vec<Detection> = found.iter().map(|(_, d)| d.clone()).collect();
            let keep = nms::suppress(&dets, iou_th);
            let before = found.len();
            found = keep.into_iter().map(|i| found[i].clone()).collect();
            debug!("vision: cross-model nms kept {}/{}", found.len(), before);
        }

        let canvas = if found.is_empty() {
            img
        } else {
            let layers = found.iter().map(|(idx, det)| (det, self.models[*idx].cfg.rgb()));
            match annotate::render(&img, layers) {
                Ok(drawn) => drawn,
                Err(e) => {
                    warn!("vision: could not annotate {}: {:#}", frame_id, e);
                    img
                }
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let out = self.annotated_path(frame_id);
        let annotated_path = match canvas.save(&out) {
            Ok(()) => Some(out),
            Err(e) => {
                warn!("vision: could not write {}: {}", out.display(), e);
                None
            }
        };

        let detections: Vec<Detection> = found.into_iter().map(|(_, d)| d).collect();
        debug!("vision: {} -> {} detections in {} ms", frame_id, detections.len(), elapsed_ms);
        InferenceOutcome {
            labels: detections.iter().map(|d| d.label.clone()).collect(),
            elapsed_ms,
            annotated_path,
            detections,
        }
    }

    fn detect_one(&self, model: &LoadedModel, img: &RgbImage) -> Vec<Detection> {
        let threshold = model.cfg.threshold();
        let mut detector = model.detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let raw = match detector.detect_rgb(img, threshold) {
            Ok(d) => d,
            Err(e) => {
                warn!("vision: model {} failed: {:#}", model.cfg.name, e);
                return Vec::new();
            }
        };
        let (w, h) = img.dimensions();
        raw.into_iter()
            .filter(|d| d.confidence >= threshold && d.bbox.pixel_bounds(w, h).is_some())
            .map(|d| Detection { model: model.cfg.name.clone(), ..d })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, ModelLoadError};
    use image::Rgb;

    /// Always reports the same detections, ignoring the image.
    struct Scripted(Vec<Detection>);

    impl Detector for Scripted {
        fn detect_rgb(&mut self, _img: &RgbImage, _conf: f32) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn detect_rgb(&mut self, _img: &RgbImage, _conf: f32) -> Result<Vec<Detection>> {
            anyhow::bail!("tensor shape mismatch")
        }
    }

    fn det(label: &str, conf: f32, x1: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, 30.0, x1 + 20.0, 60.0),
            label: label.into(),
            confidence: conf,
            model: String::new(),
        }
    }

    fn model(name: &str, confidence: u8, color: [u8; 3]) -> ModelConfig {
        ModelConfig { name: name.into(), path: format!("{name}.tflite").into(), color, confidence, classes: vec![] }
    }

    fn write_gray(path: &Path) {
        RgbImage::from_pixel(120, 80, Rgb([90, 90, 90])).save(path).unwrap();
    }

    #[test]
    fn thresholds_are_per_model() {
        let tmp = tempfile::tempdir().unwrap();
        let img = tmp.path().join("f.png");
        write_gray(&img);

        let engine = InferenceEngine::with_detectors(
            vec![
                (model("loose", 25, [0, 0, 255]), Box::new(Scripted(vec![det("cone", 0.5, 10.0)])) as Box<dyn Detector>),
                (model("strict", 90, [255, 0, 0]), Box::new(Scripted(vec![det("cone", 0.5, 60.0)]))),
            ],
            tmp.path().join("predicted"),
            None,
        )
        .unwrap();

        let out = engine.run_inference(&img, "frame1");
        assert_eq!(out.labels, vec!["cone"]);
        assert_eq!(out.detections.len(), 1);
        assert_eq!(out.detections[0].model, "loose");
        let saved = out.annotated_path.unwrap();
        assert_eq!(saved, tmp.path().join("predicted/frame1_detected.jpg"));
        assert!(saved.exists());
    }

    #[test]
    fn later_models_draw_on_top() {
        let tmp = tempfile::tempdir().unwrap();
        let img = tmp.path().join("f.png");
        write_gray(&img);
        let engine = InferenceEngine::with_detectors(
            vec![
                (model("a", 10, [0, 0, 255]), Box::new(Scripted(vec![det("pothole", 0.8, 10.0)])) as Box<dyn Detector>),
                (model("b", 10, [255, 0, 0]), Box::new(Scripted(vec![det("debris", 0.7, 10.0)]))),
            ],
            tmp.path().join("predicted"),
            None,
        )
        .unwrap();

        let out = engine.run_inference(&img, "f");
        assert_eq!(out.labels, vec!["pothole", "debris"]);
        let annotated = image::open(out.annotated_path.unwrap()).unwrap().to_rgb8();
        // both caption strips cover rows 10..=30 from x=10; model b's (B,G,R) = (255,0,0) is drawn last
        let (mut blue, mut red) = (0, 0);
        for y in 10..=30 {
            for x in 12..50 {
                let p = annotated.get_pixel(x, y);
                if i32::from(p[2]) > i32::from(p[0]) + 80 {
                    blue += 1;
                } else if i32::from(p[0]) > i32::from(p[2]) + 80 {
                    red += 1;
                }
            }
        }
        assert!(blue > 200 && red < 20, "blue={blue} red={red}");
    }

    #[test]
    fn cross_model_nms_is_opt_in() {
        let tmp = tempfile::tempdir().unwrap();
        let img = tmp.path().join("f.png");
        write_gray(&img);
        let build = |iou| {
            InferenceEngine::with_detectors(
                vec![
                    (model("a", 10, [0, 0, 255]), Box::new(Scripted(vec![det("cone", 0.6, 10.0)])) as Box<dyn Detector>),
                    (model("b", 10, [255, 0, 0]), Box::new(Scripted(vec![det("cone", 0.9, 11.0)]))),
                ],
                tmp.path().join("predicted"),
                iou,
            )
            .unwrap()
        };
        assert_eq!(build(None).run_inference(&img, "f").detections.len(), 2);
        let merged = build(Some(0.5)).run_inference(&img, "f");
        assert_eq!(merged.detections.len(), 1);
        assert_eq!(merged.detections[0].model, "b");
    }

    #[test]
    fn zero_models_writes_unmodified_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let img = tmp.path().join("f.png");
        write_gray(&img);
        let engine = InferenceEngine::with_detectors(vec![], tmp.path().join("predicted"), None).unwrap();
        let out = engine.run_inference(&img, "empty");
        assert!(out.labels.is_empty() && out.detections.is_empty());
        let copy = image::open(out.annotated_path.unwrap()).unwrap().to_rgb8();
        assert_eq!(copy.dimensions(), (120, 80));
        let p = copy.get_pixel(60, 40);
        assert!(p.0.iter().all(|&c| (c as i32 - 90).abs() <= 3));
    }

    #[test]
    fn unreadable_image_is_empty_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = InferenceEngine::with_detectors(
            vec![(model("a", 10, [0, 0, 255]), Box::new(Scripted(vec![det("cone", 0.9, 10.0)])) as Box<dyn Detector>)],
            tmp.path().join("predicted"),
            None,
        )
        .unwrap();
        let garbage = tmp.path().join("g.jpg");
        std::fs::write(&garbage, b"not a jpeg").unwrap();
        assert_eq!(engine.run_inference(&garbage, "g"), InferenceOutcome::default());
        assert_eq!(engine.run_inference(&tmp.path().join("missing.jpg"), "m"), InferenceOutcome::default());
    }

    #[test]
    fn failing_model_does_not_hide_others() {
        let tmp = tempfile::tempdir().unwrap();
        let img = tmp.path().join("f.png");
        write_gray(&img);
        let engine = InferenceEngine::with_detectors(
            vec![
                (model("broken", 10, [0, 0, 0]), Box::new(Failing) as Box<dyn Detector>),
                (model("ok", 10, [0, 255, 0]), Box::new(Scripted(vec![det("sign", 0.4, 5.0)]))),
            ],
            tmp.path().join("predicted"),
            None,
        )
        .unwrap();
        assert_eq!(engine.run_inference(&img, "f").labels, vec!["sign"]);
    }

    struct CountingLoader;

    impl ModelLoader for CountingLoader {
        fn load(&self, model: &ModelConfig) -> std::result::Result<Box<dyn Detector>, ModelLoadError> {
            if model.name == "bad" {
                return Err(ModelLoadError::Backend { name: model.name.clone(), reason: "corrupt".into() });
            }
            Ok(Box::new(Scripted(vec![])))
        }
    }

    #[test]
    fn load_skips_missing_and_failing_models() {
        let tmp = tempfile::tempdir().unwrap();
        let present = tmp.path().join("present.tflite");
        let bad = tmp.path().join("bad.tflite");
        std::fs::write(&present, b"w").unwrap();
        std::fs::write(&bad, b"w").unwrap();
        let configs = vec![
            ModelConfig { path: tmp.path().join("absent.tflite"), ..model("absent", 25, [0, 0, 0]) },
            ModelConfig { path: bad, ..model("bad", 25, [0, 0, 0]) },
            ModelConfig { path: present, ..model("present", 25, [0, 0, 0]) },
        ];
        let engine = InferenceEngine::load(&configs, &CountingLoader, tmp.path().join("predicted"), None).unwrap();
        assert_eq!(engine.model_names(), vec!["present"]);
    }
}
