//! Semi-global block matching on a rectified grayscale pair, via OpenCV's
//! `StereoSGBM`. Raw output is 1/16 px fixed point.

use image::{DynamicImage, GenericImageView, GrayImage};
use opencv::core::{Mat, Scalar, Size, CV_8UC1};
use opencv::prelude::*;
use opencv::{calib3d, imgproc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DisparityMap, StereoError};

pub const DISP_SCALE: f32 = 16.0;

/// Road-tuned defaults. `p1`/`p2` are not recomputed when only `block_size`
/// is overridden.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgbmParams {
    pub min_disparity: i32,
    /// Multiple of 16.
    pub num_disparities: u32,
    pub block_size: u32,
    pub p1: u32,
    pub p2: u32,
    /// Negative disables the left-right check.
    pub disp12_max_diff: i32,
    pub pre_filter_cap: i32,
    /// Percent.
    pub uniqueness_ratio: u32,
    /// Components of at most this many pixels are removed. 0 disables.
    pub speckle_window_size: u32,
    /// Max disparity step (px) inside one component.
    pub speckle_range: i32,
}

impl Default for SgbmParams {
    fn default() -> Self {
        let block = 5;
        Self {
            min_disparity: 0,
            num_disparities: 16 * 12,
            block_size: block,
            p1: 8 * 3 * block * block,
            p2: 32 * 3 * block * block,
            disp12_max_diff: 1,
            pre_filter_cap: 0,
            uniqueness_ratio: 10,
            speckle_window_size: 100,
            speckle_range: 32,
        }
    }
}

impl SgbmParams {
    pub fn validate(&self) -> Result<(), StereoError> {
        let bad = |m: &str| Err(StereoError::InvalidParams(m.to_string()));
        if self.num_disparities == 0 || self.num_disparities % 16 != 0 {
            return bad("num_disparities must be a positive multiple of 16");
        }
        if self.block_size == 0 || self.block_size % 2 == 0 {
            return bad("block_size must be odd");
        }
        if self.p2 <= self.p1 {
            return bad("p2 must be greater than p1");
        }
        if self.uniqueness_ratio >= 100 {
            return bad("uniqueness_ratio must be < 100");
        }
        Ok(())
    }

    fn matcher(&self) -> opencv::Result<opencv::core::Ptr<calib3d::StereoSGBM>> {
        calib3d::StereoSGBM::create(
            self.min_disparity,
            self.num_disparities as i32,
            self.block_size as i32,
            self.p1 as i32,
            self.p2 as i32,
            self.disp12_max_diff,
            self.pre_filter_cap,
            self.uniqueness_ratio as i32,
            self.speckle_window_size as i32,
            self.speckle_range,
            calib3d::StereoSGBM_MODE_SGBM,
        )
    }
}

fn gray_mat(img: &GrayImage) -> Result<Mat, StereoError> {
    let mut mat = Mat::new_rows_cols_with_default(img.height() as i32, img.width() as i32, CV_8UC1, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(img.as_raw());
    Ok(mat)
}

/// Disparity of `left` against `right`, in pixels. `right` is resized to the
/// left frame when the sizes differ. Unmatched pixels get `min_disparity - 1`.
pub fn compute_disparity(left: &DynamicImage, right: &DynamicImage, params: &SgbmParams) -> Result<DisparityMap, StereoError> {
    params.validate()?;
    let (w, h) = left.dimensions();
    if w == 0 || h == 0 {
        return Err(StereoError::EmptyImage);
    }
    let l = gray_mat(&left.to_luma8())?;
    let mut r = gray_mat(&right.to_luma8())?;
    if right.dimensions() != (w, h) {
        debug!("stereo: resizing right {:?} to {}x{}", right.dimensions(), w, h);
        let mut resized = Mat::default();
        imgproc::resize(&r, &mut resized, Size::new(w as i32, h as i32), 0.0, 0.0, imgproc::INTER_LINEAR)?;
        r = resized;
    }

    let mut raw = Mat::default();
    params.matcher()?.compute(&l, &r, &mut raw)?;
    let data = raw.data_typed::<i16>()?.iter().map(|&d| f32::from(d) / DISP_SCALE).collect();

    let map = DisparityMap::new(w, h, data)?;
    debug!("stereo: disparity {}x{} valid={:.2}", w, h, map.valid_fraction());
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, RgbImage};

    fn texture(w: u32, h: u32, seed: u32) -> GrayImage {
        let mut state = seed;
        GrayImage::from_fn(w, h, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            Luma([(state >> 16) as u8])
        })
    }

    fn small_params() -> SgbmParams {
        SgbmParams { num_disparities: 16, speckle_window_size: 20, ..SgbmParams::default() }
    }

    #[test]
    fn defaults_match_road_tuning() {
        let p = SgbmParams::default();
        assert_eq!((p.num_disparities, p.block_size, p.p1, p.p2), (192, 5, 600, 2400));
        assert_eq!((p.disp12_max_diff, p.uniqueness_ratio, p.speckle_window_size, p.speckle_range), (1, 10, 100, 32));
        assert_eq!(p.pre_filter_cap, 0);
        p.validate().unwrap();
    }

    #[test]
    fn recovers_a_constant_shift() {
        let (w, h, shift) = (96u32, 48u32, 8u32);
        let left = texture(w, h, 7);
        let noise = texture(w, h, 99);
        // left(x) == right(x - shift)
        let right = GrayImage::from_fn(w, h, |x, y| {
            if x + shift < w { *left.get_pixel(x + shift, y) } else { *noise.get_pixel(x, y) }
        });

        let disp = compute_disparity(&DynamicImage::ImageLuma8(left), &DynamicImage::ImageLuma8(right), &small_params()).unwrap();

        let mut total = 0;
        let mut good = 0;
        for y in 4..h - 4 {
            for x in 24..w - 8 {
                total += 1;
                let d = disp.get(x, y);
                if d > 0.0 && (d - shift as f32).abs() <= 0.5 {
                    good += 1;
                }
            }
        }
        assert!(good * 10 >= total * 9, "{good}/{total} pixels near {shift}");
        // search band on the left edge is never matched
        assert_eq!(disp.get(3, 10), -1.0);
    }

    #[test]
    fn mismatched_right_frame_is_resized() {
        let left = DynamicImage::ImageRgb8(RgbImage::new(40, 20));
        let right = DynamicImage::ImageRgb8(RgbImage::new(80, 40));
        let disp = compute_disparity(&left, &right, &small_params()).unwrap();
        assert_eq!((disp.width(), disp.height()), (40, 20));
    }

    #[test]
    fn empty_input_and_bad_params_are_errors() {
        let empty = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(matches!(compute_disparity(&empty, &empty, &small_params()), Err(StereoError::EmptyImage)));
        let even = SgbmParams { block_size: 4, ..SgbmParams::default() };
        assert!(even.validate().is_err());
        let ragged = SgbmParams { num_disparities: 40, ..SgbmParams::default() };
        assert!(matches!(compute_disparity(&empty, &empty, &ragged), Err(StereoError::InvalidParams(_))));
    }
}
