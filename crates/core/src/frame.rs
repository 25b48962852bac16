//! Decoded video frame.

use image::RgbImage;

/// One decoded frame and its position on the stream timeline.
///
/// Owned by the analysing session for a single loop iteration.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Seconds since stream start.
    pub position_secs: f64,
}

impl Frame {
    pub fn new(image: RgbImage, position_secs: f64) -> Self {
        Self {
            image,
            position_secs,
        }
    }

    /// Build a frame from a packed RGB24 buffer. Returns `None` when the
    /// buffer length does not match `width * height * 3`.
    pub fn from_rgb24(width: u32, height: u32, pixels: Vec<u8>, position_secs: f64) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(|image| Self::new(image, position_secs))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Byte length of one packed RGB24 frame.
pub fn rgb24_frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}
