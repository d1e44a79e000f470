use crate::{BoundingBox, Detection};

pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy suppression, highest confidence first. Returns the indices of the
/// survivors in their original order.
pub fn suppress(dets: &[Detection], iou_th: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..dets.len()).collect();
    order.sort_by(|&a, &b| dets[b].confidence.total_cmp(&dets[a].confidence));

    let mut kept: Vec<usize> = Vec::new();
    for i in order {
        if kept.iter().all(|&k| iou(&dets[i].bbox, &dets[k].bbox) < iou_th) {
            kept.push(i);
        }
    }
    kept.sort_unstable();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, conf: f32, model: &str) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, 0.0, x1 + 10.0, 10.0),
            label: "cone".into(),
            confidence: conf,
            model: model.into(),
        }
    }

    #[test]
    fn iou_basics() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &BoundingBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
        let half = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((iou(&a, &half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn suppress_keeps_best_and_preserves_order() {
        let dets = vec![det(0.0, 0.6, "a"), det(1.0, 0.9, "b"), det(50.0, 0.3, "a")];
        assert_eq!(suppress(&dets, 0.5), vec![1, 2]);
        assert_eq!(suppress(&dets, 0.95), vec![0, 1, 2]);
    }
}
