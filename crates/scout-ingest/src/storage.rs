//! Files written by the ingest endpoint, all under one root:
//!
//! ```text
//! <root>/original/{frame}_orig.jpg      left frame as uploaded
//! <root>/original/{frame}_right.jpg
//! <root>/original/{frame}_mask.jpg      only when a mask was sent
//! <root>/predicted/{frame}_detected.jpg annotated copy
//! <root>/depth/{frame}_depth.png        optional jet preview
//! ```

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

pub const ORIGINAL_DIR: &str = "original";
pub const PREDICTED_DIR: &str = "predicted";
pub const DEPTH_DIR: &str = "depth";

#[derive(Debug, Clone)]
pub struct StoredFrame {
    pub left: PathBuf,
    pub right: PathBuf,
    pub mask: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
}

/// Longest frame id used as a file stem unchanged.
const MAX_PLAIN_STEM: usize = 128;

/// Maps a client-supplied frame id to a file stem, one-to-one.
///
/// Ids made only of `[A-Za-z0-9._-]` that do not start with `.` are used as
/// is, extension included. Anything else is reduced to `[A-Za-z0-9_-]` and
/// suffixed with `@` and a digest of the raw id. `@` never occurs in a plain
/// stem, so the two forms cannot collide.
pub fn frame_stem(frame_id: &str) -> Option<String> {
    if frame_id.trim().is_empty() {
        return None;
    }
    let plain = frame_id.len() <= MAX_PLAIN_STEM
        && !frame_id.starts_with('.')
        && frame_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if plain {
        return Some(frame_id.to_string());
    }

    let readable: String = frame_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') { c } else { '_' })
        .take(MAX_PLAIN_STEM / 2)
        .collect();
    let digest = Sha256::digest(frame_id.as_bytes());
    Some(format!("{}@{}", readable, hex::encode(&digest[..8])))
}

impl Storage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in [ORIGINAL_DIR, PREDICTED_DIR, DEPTH_DIR] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn predicted_dir(&self) -> PathBuf {
        self.root.join(PREDICTED_DIR)
    }

    pub fn depth_preview_path(&self, stem: &str) -> PathBuf {
        self.root.join(DEPTH_DIR).join(format!("{}_depth.png", stem))
    }

    /// Writes the uploaded parts. Re-uploading a frame overwrites its files.
    pub fn save_upload(&self, stem: &str, left: &[u8], right: &[u8], mask: Option<&[u8]>) -> Result<StoredFrame> {
        let dir = self.root.join(ORIGINAL_DIR);
        let write = |suffix: &str, bytes: &[u8]| -> Result<PathBuf> {
            let path = dir.join(format!("{}_{}.jpg", stem, suffix));
            std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
            Ok(path)
        };
        Ok(StoredFrame {
            left: write("orig", left)?,
            right: write("right", right)?,
            mask: mask.map(|m| write("mask", m)).transpose()?,
        })
    }

    /// Path as recorded in the log and served under `/files/`.
    pub fn relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) => rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/"),
            Err(_) => path.display().to_string(),
        }
    }

    /// Resolves a `/files/` request path inside the root. Absolute paths,
    /// `..`, backslashes and empty paths are refused.
    pub fn resolve(&self, requested: &str) -> Option<PathBuf> {
        if requested.is_empty() || requested.contains('\\') || requested.contains('\0') {
            return None;
        }
        let rel = Path::new(requested);
        if !rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
            return None;
        }
        Some(self.root.join(rel))
    }
}

pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
