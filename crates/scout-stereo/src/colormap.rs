//! Jet false-colour previews of disparity and depth maps.

use image::{Rgb, RgbImage};

use crate::{DepthMap, DisparityMap};

/// Depth previews are clipped to this range before normalization.
pub const DEPTH_PREVIEW_MAX_M: f32 = 100.0;

/// Classic jet ramp, blue at 0 through red at 1.
pub fn jet(v: f32) -> Rgb<u8> {
    let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    let ch = |center: f32| ((1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([ch(3.0), ch(2.0), ch(1.0)])
}

/// Min-max normalizes finite values into the jet ramp. Non-finite pixels are black.
fn min_max_jet(width: u32, height: u32, values: &[f32]) -> RgbImage {
    let (lo, hi) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = hi - lo;
    RgbImage::from_fn(width, height, |x, y| {
        let v = values[y as usize * width as usize + x as usize];
        if !v.is_finite() {
            return Rgb([0, 0, 0]);
        }
        jet(if span > 0.0 { (v - lo) / span } else { 0.0 })
    })
}

pub fn disparity_preview(disp: &DisparityMap) -> RgbImage {
    min_max_jet(disp.width(), disp.height(), disp.as_slice())
}

pub fn depth_preview(depth: &DepthMap) -> RgbImage {
    let clipped: Vec<f32> = depth
        .as_slice()
        .iter()
        .map(|&z| if z.is_finite() { z.clamp(0.0, DEPTH_PREVIEW_MAX_M) } else { z })
        .collect();
    min_max_jet(depth.width(), depth.height(), &clipped)
}
