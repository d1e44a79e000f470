use scout_vision::{BoundingBox, Detection};
use serde::{Deserialize, Serialize};

use crate::DepthMap;

/// Frontal extent of a box at its median distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub width_m: f64,
    pub height_m: f64,
    pub distance_m: f64,
    /// width × height, a planar area rather than a volume.
    pub surface_m2: f64,
}

/// `None` when the box holds no positive, finite depth sample.
pub fn estimate_footprint(bbox: &BoundingBox, depth: &DepthMap, fx: f64, fy: f64) -> Option<Footprint> {
    let [x1, y1, x2, y2] = bbox.pixel_bounds(depth.width(), depth.height())?;
    let mut samples: Vec<f32> = depth.window(x1, y1, x2, y2).filter(|z| z.is_finite() && *z > 0.0).collect();
    let distance_m = median(&mut samples)?;

    let width_m = f64::from(x2 - x1) * distance_m / fx;
    let height_m = f64::from(y2 - y1) * distance_m / fy;
    Some(Footprint { width_m, height_m, distance_m, surface_m2: width_m * height_m })
}

fn median(v: &mut [f32]) -> Option<f64> {
    let n = v.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    let (lower, hi, _) = v.select_nth_unstable_by(mid, f32::total_cmp);
    let hi = f64::from(*hi);
    if n % 2 == 1 {
        return Some(hi);
    }
    let lo = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    Some((f64::from(lo) + hi) / 2.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleEstimate {
    pub label: String,
    pub width_m: f64,
    pub height_m: f64,
    pub distance_m: f64,
    pub surface_m2: f64,
}

impl ObstacleEstimate {
    pub fn new(det: &Detection, fp: Footprint) -> Self {
        Self {
            label: det.label.clone(),
            width_m: fp.width_m,
            height_m: fp.height_m,
            distance_m: fp.distance_m,
            surface_m2: fp.surface_m2,
        }
    }

    /// `label:area_m2@distance_m`, e.g. `cone:0.12@14.3`.
    pub fn summary_token(&self) -> String {
        format!("{}:{:.2}@{:.1}", self.label, self.surface_m2, self.distance_m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compute_depth, compute_depth_masked, DisparityMap};

    fn uniform_depth(w: u32, h: u32, disparity: f32) -> DepthMap {
        compute_depth(&DisparityMap::filled(w, h, disparity), 1000.0, 0.2)
    }

    #[test]
    fn footprint_scales_with_distance() {
        let bbox = BoundingBox::new(10.0, 10.0, 30.0, 20.0);
        // 200 / 20 = 10 m, 200 / 10 = 20 m
        let near = estimate_footprint(&bbox, &uniform_depth(64, 32, 20.0), 1000.0, 1000.0).unwrap();
        let far = estimate_footprint(&bbox, &uniform_depth(64, 32, 10.0), 1000.0, 1000.0).unwrap();

        assert!((near.distance_m - 10.0).abs() < 1e-4);
        assert!((near.width_m - 0.2).abs() < 1e-6);
        assert!((near.height_m - 0.1).abs() < 1e-6);
        assert!(far.width_m > near.width_m && far.height_m > near.height_m);
        assert!((far.surface_m2 / near.surface_m2 - 4.0).abs() < 1e-4);
    }

    #[test]
    fn median_ignores_invalid_samples() {
        let mut d = vec![-1.0f32; 16];
        d[5] = 10.0;
        d[6] = 20.0;
        d[9] = 40.0;
        let depth = compute_depth_masked(&DisparityMap::new(4, 4, d).unwrap(), 100.0, 1.0);
        // depths 10, 5, 2.5 -> median 5
        let fp = estimate_footprint(&BoundingBox::new(0.0, 0.0, 4.0, 4.0), &depth, 100.0, 100.0).unwrap();
        assert!((fp.distance_m - 5.0).abs() < 1e-6);
    }

    #[test]
    fn no_positive_sample_means_no_estimate() {
        let depth = compute_depth_masked(&DisparityMap::filled(8, 8, 0.0), 100.0, 1.0);
        assert_eq!(estimate_footprint(&BoundingBox::new(1.0, 1.0, 5.0, 5.0), &depth, 100.0, 100.0), None);
        // degenerate box
        let ok = uniform_depth(8, 8, 1.0);
        assert_eq!(estimate_footprint(&BoundingBox::new(3.0, 3.0, 3.0, 7.0), &ok, 100.0, 100.0), None);
    }

    #[test]
    fn even_count_median_averages() {
        let mut v = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(median(&mut v), Some(2.5));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn summary_token_format() {
        let e = ObstacleEstimate {
            label: "pothole".into(),
            width_m: 0.5,
            height_m: 0.25,
            distance_m: 14.26,
            surface_m2: 0.126,
        };
        assert_eq!(e.summary_token(), "pothole:0.13@14.3");
    }
}
