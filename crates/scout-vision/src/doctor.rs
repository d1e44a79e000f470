use anyhow::Result;
use std::collections::HashSet;
use tracing::warn;

use crate::{ModelConfig, VisionConfig};

/// Structural problems are errors; missing weights only warn since the engine
/// skips those models at startup.
pub fn check_models(models: &[ModelConfig], vision: &VisionConfig) -> Result<usize> {
    let mut names = HashSet::new();
    let mut present = 0;
    for m in models {
        anyhow::ensure!(!m.name.is_empty(), "models: entry with empty name");
        anyhow::ensure!(names.insert(m.name.as_str()), "models: duplicate name {}", m.name);
        anyhow::ensure!(m.confidence <= 100, "models.{}: confidence must be 0..=100, got {}", m.name, m.confidence);
        if m.path.is_file() {
            present += 1;
        } else {
            warn!("doctor: model {} weights missing at {}", m.name, m.path.display());
        }
    }
    if let Some(iou) = vision.cross_model_nms_iou {
        anyhow::ensure!(iou > 0.0 && iou <= 1.0, "vision.cross_model_nms_iou must be in (0, 1]");
    }
    anyhow::ensure!(vision.img_w > 0 && vision.img_h > 0, "vision.img_w/img_h must be > 0");
    Ok(present)
}
