//! Pixel buffers handed from the render pipeline to a device sink.

use image::{Rgb, RgbImage};

/// Pixel layout of a [`Canvas`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 24-bit RGB, three bytes per pixel. Intermediate format after fitting.
    Rgb888,
    /// 16-bit RGB565, little-endian, two bytes per pixel.
    Rgb565Le,
    /// Six-color Spectra panel codes, two pixels per byte, high nibble first.
    /// Rows are padded to a whole byte.
    Spectra6,
}

impl PixelFormat {
    /// Number of bytes a `width` × `height` frame occupies in this format.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb888 => w * h * 3,
            PixelFormat::Rgb565Le => w * h * 2,
            PixelFormat::Spectra6 => w.div_ceil(2) * h,
        }
    }
}

/// A finished frame of exactly `width` × `height` pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Canvas {
    /// Wraps `data`, returning `None` if its length does not match the geometry.
    pub fn from_raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        (data.len() == format.frame_len(width, height)).then_some(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// An RGB canvas filled with `background`.
    pub fn filled(width: u32, height: u32, background: [u8; 3]) -> Self {
        let image = RgbImage::from_pixel(width, height, Rgb(background));
        Self::from_rgb(image)
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Rgb888,
            data: image.into_raw(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// RGB value at (`x`, `y`) for an [`PixelFormat::Rgb888`] canvas.
    pub fn rgb_at(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if self.format != PixelFormat::Rgb888 || x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_lengths_follow_format() {
        assert_eq!(PixelFormat::Rgb888.frame_len(4, 2), 24);
        assert_eq!(PixelFormat::Rgb565Le.frame_len(4, 2), 16);
        assert_eq!(PixelFormat::Spectra6.frame_len(4, 2), 4);
        assert_eq!(PixelFormat::Spectra6.frame_len(3, 2), 4);
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        assert!(Canvas::from_raw(2, 2, PixelFormat::Rgb565Le, vec![0; 7]).is_none());
        assert!(Canvas::from_raw(2, 2, PixelFormat::Rgb565Le, vec![0; 8]).is_some());
    }

    #[test]
    fn filled_canvas_reports_background() {
        let canvas = Canvas::filled(3, 2, [255, 255, 255]);
        assert_eq!(canvas.dimensions(), (3, 2));
        assert_eq!(canvas.rgb_at(2, 1), Some([255, 255, 255]));
        assert_eq!(canvas.rgb_at(3, 1), None);
    }
}
