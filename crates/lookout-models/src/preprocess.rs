//! Shared image preprocessing and post-processing helpers.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use lookout_core::BoundingBox;
use ndarray::Array4;

/// Scale and padding applied when fitting a frame into a square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a point from model-input space back to frame pixels.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// Map a box given by corners in model-input space back to frame pixels.
    pub fn box_to_frame(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        let (fx1, fy1) = self.to_frame(x1, y1);
        let (fx2, fy2) = self.to_frame(x2, y2);
        BoundingBox::from_corners(fx1, fy1, fx2, fy2)
    }
}

/// Resize `image` to fit a `size` × `size` canvas, centered, keeping aspect ratio.
pub fn letterbox(image: &RgbImage, size: u32, fill: [u8; 3]) -> (RgbImage, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb(fill));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Pack an RGB image into a `[1, 3, H, W]` tensor with `(p - mean) / std`.
pub fn to_nchw(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Something NMS can rank and compare.
pub trait Candidate {
    fn bbox(&self) -> &BoundingBox;
    fn score(&self) -> f32;
    /// Candidates of different classes never suppress each other.
    fn class(&self) -> usize {
        0
    }
}

/// Greedy non-maximum suppression. Output is sorted by descending score.
pub fn nms<T: Candidate>(mut candidates: Vec<T>, iou_threshold: f32) -> Vec<T> {
    candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));

    let mut keep: Vec<T> = Vec::new();
    for candidate in candidates {
        let overlaps = keep.iter().any(|kept| {
            kept.class() == candidate.class() && kept.bbox().iou(candidate.bbox()) > iou_threshold
        });
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}
