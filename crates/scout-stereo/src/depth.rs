use crate::{DisparityMap, Intrinsics};

/// Disparity substituted for non-positive values by [`compute_depth`].
pub const DISPARITY_EPSILON: f32 = 0.1;

/// Metric distance per pixel, same layout as the disparity it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DepthMap {
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

    /// Samples of the half-open window `[x1, x2) x [y1, y2)`, clipped to the map.
    pub fn window(&self, x1: u32, y1: u32, x2: u32, y2: u32) -> impl Iterator<Item = f32> + '_ {
        let (x2, y2) = (x2.min(self.width), y2.min(self.height));
        let w = self.width as usize;
        (y1..y2).flat_map(move |y| {
            let row = y as usize * w;
            self.data[row + x1.min(x2) as usize..row + x2 as usize].iter().copied()
        })
    }
}

fn transform(disp: &DisparityMap, fx: f64, baseline: f64, fallback: f32) -> DepthMap {
    let fb = (fx * baseline) as f32;
    let data = disp.as_slice().iter().map(|&d| if d > 0.0 { fb / d } else { fallback }).collect();
    DepthMap { width: disp.width(), height: disp.height(), data }
}

/// `fx * baseline / d`, with non-positive disparity clamped to
/// [`DISPARITY_EPSILON`] first. Always finite for finite inputs, but the
/// clamped pixels read as a large bogus distance.
pub fn compute_depth(disp: &DisparityMap, fx: f64, baseline: f64) -> DepthMap {
    transform(disp, fx, baseline, (fx * baseline) as f32 / DISPARITY_EPSILON)
}

/// Same transform, but non-positive disparity becomes NaN.
pub fn compute_depth_masked(disp: &DisparityMap, fx: f64, baseline: f64) -> DepthMap {
    transform(disp, fx, baseline, f32::NAN)
}

impl Intrinsics {
    pub fn depth(&self, disp: &DisparityMap, masked: bool) -> DepthMap {
        if masked {
            compute_depth_masked(disp, self.fx, self.baseline)
        } else {
            compute_depth(disp, self.fx, self.baseline)
        }
    }
}
