//! What happens to one upload once its parts are in memory. Runs on a
//! blocking thread; inference and stereo matching are CPU bound.

use anyhow::{Context, Result};
use bytes::Bytes;
use scout_proto::wire::{UploadResponse, NONE_SENTINEL};
use scout_stereo::{colormap, compute_disparity, estimate_footprint, open_image, Intrinsics, ObstacleEstimate, SgbmParams};
use scout_vision::Detection;
use serde::Deserialize;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::log::LogRecord;
use crate::storage::{frame_stem, StoredFrame};
use crate::AppState;

#[derive(Debug, Clone)]
pub struct Upload {
    pub frame_id: String,
    pub latitude: String,
    pub longitude: String,
    pub left: Bytes,
    pub right: Bytes,
    pub mask: Option<Bytes>,
}

fn default_true() -> bool {
    true
}

/// `[stereo]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StereoConfig {
    /// NaN instead of clamped depth where disparity is not positive.
    #[serde(default = "default_true")]
    pub mask_invalid_depth: bool,
    #[serde(default)]
    pub sgbm: SgbmParams,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self { mask_invalid_depth: true, sgbm: SgbmParams::default() }
    }
}

#[derive(Debug, Clone)]
pub struct DepthSettings {
    pub intrinsics: Intrinsics,
    pub stereo: StereoConfig,
    pub save_preview: bool,
}

pub fn process_upload(state: &AppState, up: Upload) -> Result<UploadResponse> {
    let stem = frame_stem(&up.frame_id).context("frame_id has no usable characters")?;
    let stored = state
        .storage
        .save_upload(&stem, &up.left, &up.right, up.mask.as_deref())
        .with_context(|| format!("store {}", up.frame_id))?;

    let outcome = state.engine.run_inference(&stored.left, &stem);
    let estimates = if outcome.detections.is_empty() {
        None
    } else {
        match estimate_obstacles(state, &stored, &stem, &outcome.detections) {
            Ok(e) => Some(e),
            Err(e) => {
                warn!("ingest: depth for {} failed, logging without volumes: {:#}", up.frame_id, e);
                None
            }
        }
    };
    // an empty list is reported as no volumes, same as the log's "None"
    let volumes: Option<Vec<String>> = estimates
        .filter(|v| !v.is_empty())
        .map(|v| v.iter().map(ObstacleEstimate::summary_token).collect());

    let predicted_img = outcome
        .annotated_path
        .as_deref()
        .map(|p| state.storage.relative(p))
        .unwrap_or_else(|| NONE_SENTINEL.to_string());
    state.log.append(&LogRecord {
        frame_id: up.frame_id.clone(),
        lat: up.latitude,
        lon: up.longitude,
        objects: outcome.labels.clone(),
        original_img: state.storage.relative(&stored.left),
        predicted_img,
        volumes: volumes.clone().unwrap_or_default(),
    })?;

    let objects_str = if outcome.labels.is_empty() { NONE_SENTINEL.to_string() } else { outcome.labels.join(", ") };
    info!("ingest: processed {} | {} ms | objects: {}", up.frame_id, outcome.elapsed_ms, objects_str);

    Ok(UploadResponse { status: "success".into(), objects: outcome.labels, volumes })
}

/// Disparity and depth over the stored pair, then one estimate per detection
/// that has depth support. Detections without support are left out.
fn estimate_obstacles(state: &AppState, stored: &StoredFrame, stem: &str, dets: &[Detection]) -> Result<Vec<ObstacleEstimate>> {
    let settings = &state.depth;
    let start = Instant::now();
    let left = open_image(&stored.left)?;
    let right = open_image(&stored.right)?;
    let disparity = compute_disparity(&left, &right, &settings.stereo.sgbm)?;
    let k = settings.intrinsics;
    let depth = k.depth(&disparity, settings.stereo.mask_invalid_depth);
    debug!("stereo: {} depth in {} ms", stem, start.elapsed().as_millis());

    if settings.save_preview {
        save_preview(&state.storage.depth_preview_path(stem), &colormap::depth_preview(&depth));
    }

    let mut out = Vec::with_capacity(dets.len());
    for det in dets {
        match estimate_footprint(&det.bbox, &depth, k.fx, k.fy) {
            Some(fp) => out.push(ObstacleEstimate::new(det, fp)),
            None => debug!("stereo: no estimate for {} in {}", det.label, stem),
        }
    }
    Ok(out)
}

fn save_preview(path: &Path, img: &image::RgbImage) {
    if let Err(e) = img.save(path) {
        warn!("stereo: could not write {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::ResultLog;
    use crate::storage::Storage;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, RgbImage};
    use scout_vision::{BoundingBox, Detector, InferenceEngine, ModelConfig};
    use std::io::Cursor;
    use std::sync::Arc;

    /// Reports one box inside the left band the matcher never reaches.
    struct EdgeBox;

    impl Detector for EdgeBox {
        fn detect_rgb(&mut self, _img: &RgbImage, _conf: f32) -> anyhow::Result<Vec<Detection>> {
            Ok(vec![Detection {
                bbox: BoundingBox::new(0.0, 10.0, 8.0, 30.0),
                label: "cone".into(),
                confidence: 0.9,
                model: String::new(),
            }])
        }
    }

    fn textured_jpeg(seed: u32) -> Bytes {
        let mut state = seed;
        let img = GrayImage::from_fn(64, 48, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            Luma([(state >> 16) as u8])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img).write_to(&mut buf, ImageFormat::Jpeg).unwrap();
        Bytes::from(buf.into_inner())
    }

    #[test]
    fn detections_without_depth_support_report_no_volumes() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let model = ModelConfig { name: "edge".into(), path: "edge.tflite".into(), color: [0, 0, 255], confidence: 25, classes: vec![] };
        let engine = InferenceEngine::with_detectors(vec![(model, Box::new(EdgeBox) as Box<dyn Detector>)], storage.predicted_dir(), None).unwrap();
        let log = ResultLog::open(tmp.path().join("inference_logs.csv")).unwrap();
        let depth = DepthSettings {
            intrinsics: Intrinsics::default(),
            stereo: StereoConfig { mask_invalid_depth: true, sgbm: SgbmParams { num_disparities: 16, ..SgbmParams::default() } },
            save_preview: false,
        };
        let state = AppState::new(storage, log, Arc::new(engine), depth);

        let resp = process_upload(
            &state,
            Upload {
                frame_id: "edge_0001.jpg".into(),
                latitude: "48.1".into(),
                longitude: "2.3".into(),
                left: textured_jpeg(1),
                right: textured_jpeg(2),
                mask: None,
            },
        )
        .unwrap();

        assert_eq!(resp.objects, vec!["cone"]);
        assert_eq!(resp.volumes, None);
        let page = state.log.read(10).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].volumes.as_deref(), Some(NONE_SENTINEL));
    }
}
