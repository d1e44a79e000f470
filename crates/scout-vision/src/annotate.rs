use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use opencv::core::{Mat, Point, Scalar, CV_8UC3};
use opencv::imgproc;
use opencv::prelude::*;

use crate::Detection;

pub const BOX_THICKNESS: i32 = 3;
pub const STRIP_HEIGHT: i32 = 20;
pub const FONT_FACE: i32 = imgproc::FONT_HERSHEY_SIMPLEX;
pub const FONT_SCALE: f64 = 0.6;
pub const TEXT_THICKNESS: i32 = 2;
/// Caption baseline, measured up from the top edge of the box.
const TEXT_LIFT: i32 = 5;

pub fn caption(model: &str, det: &Detection) -> String {
    format!("{}: {} {:.2}", model, det.label, det.confidence)
}

// The matrix keeps the image's RGB byte order, so colours go in as R, G, B.
fn scalar(c: Rgb<u8>) -> Scalar {
    Scalar::new(f64::from(c[0]), f64::from(c[1]), f64::from(c[2]), 0.0)
}

/// Drawing surface over a copy of an RGB frame.
pub struct Canvas {
    mat: Mat,
    width: u32,
    height: u32,
}

impl Canvas {
    pub fn from_rgb(img: &RgbImage) -> Result<Self> {
        let (width, height) = img.dimensions();
        let mut mat = Mat::new_rows_cols_with_default(height as i32, width as i32, CV_8UC3, Scalar::all(0.0))?;
        mat.data_bytes_mut()?.copy_from_slice(img.as_raw());
        Ok(Self { mat, width, height })
    }

    /// Box outline, a filled caption strip sitting on the box's top edge, and
    /// the caption in white on the strip.
    pub fn draw_detection(&mut self, det: &Detection, color: Rgb<u8>) -> Result<()> {
        let Some([x0, y0, x1, y1]) = det.bbox.pixel_bounds(self.width, self.height) else {
            return Ok(());
        };
        let (x0, y0, x1, y1) = (x0 as i32, y0 as i32, x1 as i32, y1 as i32);
        let fill = scalar(color);
        imgproc::rectangle_points(&mut self.mat, Point::new(x0, y0), Point::new(x1, y1), fill, BOX_THICKNESS, imgproc::LINE_8, 0)?;

        let text = caption(&det.model, det);
        let mut baseline = 0;
        let size = imgproc::get_text_size(&text, FONT_FACE, FONT_SCALE, TEXT_THICKNESS, &mut baseline)?;
        imgproc::rectangle_points(
            &mut self.mat,
            Point::new(x0, y0 - STRIP_HEIGHT),
            Point::new(x0 + size.width, y0),
            fill,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            &mut self.mat,
            &text,
            Point::new(x0, y0 - TEXT_LIFT),
            FONT_FACE,
            FONT_SCALE,
            scalar(Rgb([255, 255, 255])),
            TEXT_THICKNESS,
            imgproc::LINE_8,
            false,
        )?;
        Ok(())
    }

    pub fn into_rgb(self) -> Result<RgbImage> {
        let bytes = self.mat.data_bytes()?.to_vec();
        RgbImage::from_raw(self.width, self.height, bytes).context("canvas size does not match its buffer")
    }
}

/// Draws `dets` in order onto a copy of `img`; later entries land on top.
pub fn render<'a>(img: &RgbImage, dets: impl IntoIterator<Item = (&'a Detection, Rgb<u8>)>) -> Result<RgbImage> {
    let mut canvas = Canvas::from_rgb(img)?;
    for (det, color) in dets {
        canvas.draw_detection(det, color)?;
    }
    canvas.into_rgb()
}
