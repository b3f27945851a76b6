//! Frame type shared by capture and inference.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Pixel layout of a [`Frame`]'s buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes/pixel.
    Rgb8,
    /// 8-bit grayscale, 1 byte/pixel.
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// An image sample from a camera or a still image.
///
/// Pixel data is reference-counted so both pipelines can hold the same frame
/// without copying it.
#[derive(Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: Instant,
    /// Monotonically increasing per capture stream; 0 for still images.
    pub sequence: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

impl Frame {
    /// Wrap a raw pixel buffer, checking its length against the dimensions.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            format,
            timestamp: Instant::now(),
            sequence,
        })
    }

    /// Convert a decoded image into an RGB frame.
    pub fn from_image(image: &image::DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            data: rgb.into_raw().into(),
            width,
            height,
            format: PixelFormat::Rgb8,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    /// Decode an image file (any format the `image` crate supports).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FrameError> {
        let image = image::open(path.as_ref())?;
        Ok(Self::from_image(&image))
    }

    /// Copy out as an RGB image, expanding grayscale if needed.
    pub fn to_rgb_image(&self) -> image::RgbImage {
        let rgb = match self.format {
            PixelFormat::Rgb8 => self.data.to_vec(),
            PixelFormat::Gray8 => self.data.iter().flat_map(|&y| [y, y, y]).collect(),
        };
        // Length is validated at construction.
        image::RgbImage::from_raw(self.width, self.height, rgb)
            .unwrap_or_else(|| image::RgbImage::new(self.width, self.height))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_length() {
        let err = Frame::new(vec![0u8; 5], 2, 1, PixelFormat::Rgb8, 1).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength {
                expected: 6,
                actual: 5
            }
        ));
        assert!(Frame::new(vec![0u8; 6], 2, 1, PixelFormat::Rgb8, 1).is_ok());
    }

    #[test]
    fn test_gray_to_rgb_image() {
        let frame = Frame::new(vec![10, 200], 2, 1, PixelFormat::Gray8, 1).unwrap();
        let rgb = frame.to_rgb_image();
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 10, 10]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_from_image() {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            4,
            3,
            image::Rgb([1, 2, 3]),
        ));
        let frame = Frame::from_image(&image);
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.format, PixelFormat::Rgb8);
        assert_eq!(frame.data.len(), 36);
        assert_eq!(&frame.data[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_open_missing_file() {
        assert!(matches!(
            Frame::open("/nonexistent/sample.png"),
            Err(FrameError::Decode(_))
        ));
    }
}
