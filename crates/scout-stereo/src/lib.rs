//! Stereo geometry: disparity from a rectified pair, depth from disparity,
//! and metric footprints of detected boxes.

pub mod colormap;
pub mod depth;
pub mod footprint;
pub mod sgbm;

pub use depth::{compute_depth, compute_depth_masked, DepthMap, DISPARITY_EPSILON};
pub use footprint::{estimate_footprint, Footprint, ObstacleEstimate};
pub use sgbm::{compute_disparity, SgbmParams};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StereoError {
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("empty image")]
    EmptyImage,
    #[error("map size {got} does not match {width}x{height}")]
    SizeMismatch { width: u32, height: u32, got: usize },
    #[error("invalid sgbm parameters: {0}")]
    InvalidParams(String),
    #[error("camera file {path}: {reason}")]
    CameraFile { path: PathBuf, reason: String },
    #[error("invalid intrinsics: {0}")]
    InvalidIntrinsics(String),
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Pinhole intrinsics of the rectified left camera plus the stereo baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    /// px
    pub fx: f64,
    /// px
    pub fy: f64,
    /// m
    pub baseline: f64,
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self { fx: 2268.36, fy: 2312.0, baseline: 0.222126 }
    }
}

#[derive(Deserialize)]
struct CameraFile {
    intrinsic: CameraIntrinsic,
    extrinsic: CameraExtrinsic,
}

#[derive(Deserialize)]
struct CameraIntrinsic {
    fx: f64,
    fy: Option<f64>,
}

#[derive(Deserialize)]
struct CameraExtrinsic {
    baseline: f64,
}

impl Intrinsics {
    /// Reads a Cityscapes-style `*_camera.json`. `fy` falls back to `fx` when absent.
    pub fn from_camera_json(path: &Path) -> Result<Self, StereoError> {
        let fail = |reason: String| StereoError::CameraFile { path: path.to_path_buf(), reason };
        let raw = std::fs::read(path).map_err(|e| fail(e.to_string()))?;
        let cam: CameraFile = serde_json::from_slice(&raw).map_err(|e| fail(e.to_string()))?;
        let me = Self {
            fx: cam.intrinsic.fx,
            fy: cam.intrinsic.fy.unwrap_or(cam.intrinsic.fx),
            baseline: cam.extrinsic.baseline,
        };
        me.validate()?;
        Ok(me)
    }

    pub fn validate(&self) -> Result<(), StereoError> {
        for (name, v) in [("fx", self.fx), ("fy", self.fy), ("baseline", self.baseline)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(StereoError::InvalidIntrinsics(format!("{} must be > 0, got {}", name, v)));
            }
        }
        Ok(())
    }
}

/// Dense disparity in pixels, row-major. Values `<= 0` are invalid.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DisparityMap {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, StereoError> {
        if data.len() != width as usize * height as usize {
            return Err(StereoError::SizeMismatch { width, height, got: data.len() });
        }
        Ok(Self { width, height, data })
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self { width, height, data: vec![value; width as usize * height as usize] }
    }

    /// 16-bit PNG where `value / 256` is the disparity and 0 marks invalid pixels.
    pub fn from_png16(path: &Path) -> Result<Self, StereoError> {
        let img = open_image(path)?.into_luma16();
        let (width, height) = img.dimensions();
        let data = img.as_raw().iter().map(|&v| if v == 0 { 0.0 } else { f32::from(v) / 256.0 }).collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn valid_fraction(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().filter(|&&d| d > 0.0).count() as f32 / self.data.len() as f32
    }
}

pub fn open_image(path: &Path) -> Result<DynamicImage, StereoError> {
    image::open(path).map_err(|source| StereoError::Decode { path: path.to_path_buf(), source })
}
