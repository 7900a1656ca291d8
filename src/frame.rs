//! Frames and the classification window.
//!
//! - `Frame`: an owned RGB8 image as decoded by a capture session.
//! - `Window`: fixed-capacity batch of classifier-sized frames.
//!
//! Windows do not slide. A window is filled to exactly `WINDOW_LEN` frames,
//! classified once, and cleared. Pushing into a full window is an error, so a
//! window can never hold `WINDOW_LEN + 1` frames.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};

use crate::{INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH, WINDOW_LEN};

/// JPEG quality used for snapshots.
pub const SNAPSHOT_JPEG_QUALITY: u8 = 90;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded RGB8 frame, row-major, no padding between rows.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    /// Solid-colour frame, handy for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = rgb_len(width, height)?;
        let pixels = rgb.iter().copied().cycle().take(len).collect();
        Self::new(pixels, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True when the frame already has the classifier input shape.
    pub fn has_input_shape(&self) -> bool {
        self.width == INPUT_WIDTH && self.height == INPUT_HEIGHT
    }

    /// Resize to `width`x`height`. Frames already at that size are copied as-is.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if self.width == width && self.height == height {
            return Ok(self.clone());
        }
        let image = self.to_rgb_image()?;
        let resized = image::imageops::resize(&image, width, height, FilterType::Triangle);
        Frame::new(resized.into_raw(), width, height)
    }

    /// Resize to the classifier input shape.
    pub fn to_input_shape(&self) -> Result<Frame> {
        self.resized(INPUT_WIDTH, INPUT_HEIGHT)
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode JPEG")?;
        Ok(out)
    }

    fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

impl From<RgbImage> for Frame {
    fn from(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
        }
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(INPUT_CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// Window
// ----------------------------------------------------------------------------

/// Non-sliding batch of classifier-sized frames.
#[derive(Debug)]
pub struct Window {
    frames: Vec<Frame>,
    capacity: usize,
}

impl Window {
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_LEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame. Returns `true` when the window is now full.
    pub fn push(&mut self, frame: Frame) -> Result<bool> {
        if self.is_full() {
            return Err(anyhow!(
                "window already holds {} frames; classify and clear it first",
                self.capacity
            ));
        }
        if let Some(first) = self.frames.first() {
            if first.width() != frame.width() || first.height() != frame.height() {
                return Err(anyhow!(
                    "window frame size {}x{} does not match {}x{}",
                    frame.width(),
                    frame.height(),
                    first.width(),
                    first.height()
                ));
            }
        }
        self.frames.push(frame);
        Ok(self.is_full())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// `(T, H, W, C)` of the window contents.
    pub fn shape(&self) -> [usize; 4] {
        let (h, w) = self
            .frames
            .first()
            .map(|f| (f.height() as usize, f.width() as usize))
            .unwrap_or((INPUT_HEIGHT as usize, INPUT_WIDTH as usize));
        [self.frames.len(), h, w, INPUT_CHANNELS]
    }

    /// Frames concatenated in capture order (`T*H*W*C` bytes).
    pub fn to_contiguous(&self) -> Vec<u8> {
        let total: usize = self.frames.iter().map(|f| f.pixels().len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(frame.pixels());
        }
        out
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_frame(v: u8) -> Frame {
        Frame::filled(4, 2, [v, v, v]).unwrap()
    }

    #[test]
    fn frame_rejects_wrong_buffer_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn frame_resizes_to_input_shape() -> Result<()> {
        let frame = Frame::filled(64, 48, [200, 10, 10])?;
        let resized = frame.to_input_shape()?;
        assert!(resized.has_input_shape());
        assert_eq!(resized.pixels().len(), 224 * 224 * 3);
        // A solid colour stays solid under bilinear resampling.
        assert_eq!(&resized.pixels()[..3], &[200, 10, 10]);
        Ok(())
    }

    #[test]
    fn frame_encodes_decodable_jpeg() -> Result<()> {
        let frame = Frame::filled(32, 16, [0, 128, 255])?;
        let jpeg = frame.encode_jpeg(SNAPSHOT_JPEG_QUALITY)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 16);
        Ok(())
    }

    #[test]
    fn window_fills_at_capacity_and_never_overflows() -> Result<()> {
        let mut window = Window::new();
        for i in 0..(WINDOW_LEN - 1) {
            assert!(!window.push(small_frame(i as u8))?);
        }
        assert!(!window.is_full());
        assert!(window.push(small_frame(99))?);
        assert_eq!(window.len(), WINDOW_LEN);

        assert!(window.push(small_frame(100)).is_err());
        assert_eq!(window.len(), WINDOW_LEN);

        assert_eq!(window.latest().map(|f| f.pixels()[0]), Some(99));
        window.clear();
        assert!(window.is_empty());
        Ok(())
    }

    #[test]
    fn window_rejects_mixed_frame_sizes() -> Result<()> {
        let mut window = Window::with_capacity(3);
        window.push(small_frame(1))?;
        assert!(window.push(Frame::filled(2, 2, [0, 0, 0])?).is_err());
        assert_eq!(window.len(), 1);
        Ok(())
    }

    #[test]
    fn window_contiguous_layout_is_time_major() -> Result<()> {
        let mut window = Window::with_capacity(2);
        window.push(small_frame(1))?;
        window.push(small_frame(2))?;
        assert_eq!(window.shape(), [2, 2, 4, 3]);
        let bytes = window.to_contiguous();
        assert_eq!(bytes.len(), 2 * 2 * 4 * 3);
        assert!(bytes[..24].iter().all(|&b| b == 1));
        assert!(bytes[24..].iter().all(|&b| b == 2));
        Ok(())
    }
}
