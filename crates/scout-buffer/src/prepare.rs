//! Turns a GPS manifest plus stereo/mask image folders into buffered tasks.
//!
//! Manifest CSV header: `frame_name,latitude,longitude`. For a left frame named
//! `..._leftImg8bit.jpg` the right frame is the same name with `left` replaced
//! by `right` in `right_dir`, and the mask is `mask_<frame_name>` in `mask_dir`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::{BufferError, CaptureBuffer, CaptureSource, TaskId};

#[derive(Debug, Clone, Deserialize)]
pub struct PrepareConfig {
    pub manifest: PathBuf,
    pub left_dir: PathBuf,
    pub right_dir: PathBuf,
    /// When set, every task must carry a mask from this folder.
    pub mask_dir: Option<PathBuf>,
    /// Only these frame names are buffered. Absent means all frames.
    pub allow_frames: Option<Vec<String>>,
}

/// Decides which captured frames are worth sending.
#[derive(Debug, Clone)]
pub enum FrameFilter {
    All,
    AllowList(HashSet<String>),
}

impl FrameFilter {
    pub fn from_config(cfg: &PrepareConfig) -> Self {
        match &cfg.allow_frames {
            Some(list) => FrameFilter::AllowList(list.iter().cloned().collect()),
            None => FrameFilter::All,
        }
    }

    pub fn allows(&self, frame_name: &str) -> bool {
        match self {
            FrameFilter::All => true,
            FrameFilter::AllowList(set) => set.contains(frame_name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    frame_name: String,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Default)]
pub struct PrepareReport {
    pub buffered: Vec<TaskId>,
    pub filtered: usize,
    pub already_buffered: usize,
    pub missing: Vec<PathBuf>,
    pub malformed_rows: usize,
}

pub fn sibling_source(cfg: &PrepareConfig, frame_name: &str, lat: f64, lon: f64) -> CaptureSource {
    CaptureSource {
        frame_name: frame_name.to_string(),
        lat,
        lon,
        left: cfg.left_dir.join(frame_name),
        right: cfg.right_dir.join(frame_name.replace("left", "right")),
        mask: cfg.mask_dir.as_ref().map(|d| d.join(format!("mask_{}", frame_name))),
    }
}

/// Buffers every allowed manifest row whose files all exist. The task id is
/// the row index, so replay order follows manifest order and re-running the
/// preparation does not duplicate tasks that are still pending.
///
/// Delivered tasks leave no trace in the buffer, so a re-run buffers their
/// rows again and the relay sends them a second time. Prune the manifest or
/// use `allow_frames` before re-running over frames already sent.
pub fn prepare_from_manifest(buffer: &CaptureBuffer, cfg: &PrepareConfig, filter: &FrameFilter) -> Result<PrepareReport> {
    let mut rdr = csv::Reader::from_path(&cfg.manifest)
        .with_context(|| format!("open manifest {}", cfg.manifest.display()))?;
    let mut report = PrepareReport::default();

    for (index, row) in rdr.deserialize::<ManifestRow>().enumerate() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                warn!("prepare: manifest row {} unreadable: {}", index, e);
                report.malformed_rows += 1;
                continue;
            }
        };

        if !filter.allows(&row.frame_name) {
            debug!("prepare: {} filtered out", row.frame_name);
            report.filtered += 1;
            continue;
        }

        let src = sibling_source(cfg, &row.frame_name, row.latitude, row.longitude);
        let missing = src.missing_files();
        if !missing.is_empty() {
            warn!("prepare: files missing for {}", row.frame_name);
            for p in &missing {
                warn!("prepare:   missing {}", p.display());
            }
            report.missing.extend(missing);
            continue;
        }

        match buffer.enqueue_at(TaskId(index as u64), &src) {
            Ok(id) => report.buffered.push(id),
            Err(BufferError::TaskExists(id)) => {
                debug!("prepare: {} already buffered", id);
                report.already_buffered += 1;
            }
            Err(BufferError::MissingSibling(p)) => {
                warn!("prepare: {} vanished before buffering", p.display());
                report.missing.push(p);
            }
            Err(e) => return Err(e).with_context(|| format!("buffer {}", row.frame_name)),
        }
    }

    info!(
        "prepare: buffered={} filtered={} already={} missing={} malformed={}",
        report.buffered.len(),
        report.filtered,
        report.already_buffered,
        report.missing.len(),
        report.malformed_rows
    );
    Ok(report)
}
