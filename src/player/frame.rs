//! In-memory frames presented to a media sink.
//!
//! Adapters that do not decode real video paint a test card here so that
//! screenshots of passing pairs still carry something recognisable.

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use std::io::Cursor;

use super::types::{PlayerError, PlayerResult};

/// Size of the test card, matching the generated test assets
pub const TEST_CARD_WIDTH: u32 = 640;
pub const TEST_CARD_HEIGHT: u32 = 360;

const TEST_CARD_BOX: u32 = 50;

/// An RGB frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    /// Row-major, 3 bytes per pixel
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Create a black frame
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0u8; (width * height * 3) as usize],
        }
    }

    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut frame = Self::new(width, height);
        frame.fill(color);
        frame
    }

    /// The orbit test card: black background, red box at its start
    /// position, and a caption along the top edge.
    pub fn test_card(width: u32, height: u32, caption: &str) -> Self {
        let mut frame = Self::new(width, height);
        let orbit_width = width.saturating_sub(100 + TEST_CARD_BOX);
        let x = (width.saturating_sub(TEST_CARD_BOX)) / 2 + orbit_width / 2;
        let y = (height.saturating_sub(TEST_CARD_BOX)) / 2;
        frame.draw_rect(x, y, TEST_CARD_BOX, TEST_CARD_BOX, [255, 0, 0]);
        frame.draw_text(8, 8, caption, [255, 255, 255], [0, 0, 0]);
        frame
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle, clipped to the frame
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..(y + h).min(self.height) {
            for px in x..(x + w).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw text with 8x8 glyphs. No wrapping.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x >= self.width {
                break;
            }
            self.draw_char(cursor_x, y, ch, fg, bg);
            cursor_x += 8;
        }
    }

    fn draw_char(&mut self, x: u32, y: u32, ch: char, fg: [u8; 3], bg: [u8; 3]) {
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            let py = y + row_idx as u32;
            if py >= self.height {
                break;
            }
            for bit in 0..8 {
                let px = x + bit;
                if px >= self.width {
                    break;
                }
                // LSB is the leftmost pixel
                let color = if (row >> bit) & 1 == 1 { fg } else { bg };
                self.set_pixel(px, py, color);
            }
        }
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = ((y * self.width + x) * 3) as usize;
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    /// Encode as PNG bytes
    pub fn to_png(&self) -> PlayerResult<Vec<u8>> {
        if self.width == 0 || self.height == 0 {
            return Err(PlayerError::Frame("frame has zero dimensions".to_string()));
        }
        let img: RgbImage = ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| PlayerError::Frame("buffer size does not match dimensions".to_string()))?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| PlayerError::Frame(format!("failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }
}
