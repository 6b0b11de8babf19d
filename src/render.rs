//! Turns a source image file into a device-ready [`Canvas`].
//!
//! The pipeline runs in three explicit stages: decode (with EXIF orientation),
//! fit (aspect-preserving scale centered on a background), and encode (the
//! device's native pixel format). Every failure is reported as a
//! [`RenderError`] carrying the source path and the stage.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use fast_image_resize as fir;
use image::{ImageReader, RgbaImage, imageops};
use tracing::debug;

use crate::canvas::{Canvas, PixelFormat};
use crate::error::RenderError;
use crate::processing::color::{blend_over, encode_rgb565_le, encode_spectra6};
use crate::processing::layout::place;

/// Target geometry and encoding for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub background: [u8; 3],
    /// Diffuse quantization error when encoding to a small palette.
    pub dither: bool,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    target: RenderTarget,
}

impl Renderer {
    pub fn new(target: RenderTarget) -> Self {
        Self { target }
    }

    /// Runs the full pipeline for `path`. Blocking; call from a blocking thread.
    pub fn render(&self, path: &Path) -> Result<Canvas, RenderError> {
        let image = decode_rgba8_apply_exif(path)?;
        let fitted = fit(
            &image,
            self.target.width,
            self.target.height,
            self.target.background,
        )
        .map_err(|reason| RenderError::Resize {
            path: path.to_path_buf(),
            width: self.target.width,
            height: self.target.height,
            reason,
        })?;
        encode(fitted, self.target.format, self.target.dither)
    }
}

/// Decodes `path` to RGBA8 and applies the EXIF orientation if one is recorded.
pub fn decode_rgba8_apply_exif(path: &Path) -> Result<RgbaImage, RenderError> {
    let meta = std::fs::metadata(path).map_err(|err| read_error(path, err))?;
    if meta.len() == 0 {
        return Err(RenderError::Empty {
            path: path.to_path_buf(),
        });
    }

    let img = ImageReader::open(path)
        .map_err(|err| read_error(path, err))?
        .with_guessed_format()
        .map_err(|err| read_error(path, err))?
        .decode()
        .map_err(|source| RenderError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    let img = img.to_rgba8();

    let orientation = read_orientation(path).unwrap_or(1);
    Ok(apply_orientation(img, orientation))
}

fn read_error(path: &Path, err: std::io::Error) -> RenderError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RenderError::Missing {
            path: path.to_path_buf(),
        }
    } else {
        RenderError::Read {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

fn read_orientation(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    let mut buf = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut buf).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let orientation = field.value.get_uint(0)?;
    debug!(orientation, path = %path.display(), "exif orientation");
    Some(orientation)
}

/// Maps the eight EXIF orientations onto flips/rotations. Unknown values are left as-is.
pub fn apply_orientation(img: RgbaImage, orientation: u32) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    }
}

/// Scales `image` to fit `width` × `height` and centers it on `background`.
///
/// The result is an RGB888 canvas of exactly the requested size.
pub fn fit(
    image: &RgbaImage,
    width: u32,
    height: u32,
    background: [u8; 3],
) -> Result<Canvas, String> {
    if width == 0 || height == 0 {
        return Err("target dimensions must be positive".to_string());
    }
    let placement = place(image.width(), image.height(), width, height);
    let scaled = resize_rgba(image, placement.width, placement.height)?;

    let mut rgb = image::RgbImage::from_pixel(width, height, image::Rgb(background));
    blend_over(&mut rgb, &scaled, placement.x, placement.y);
    Ok(Canvas::from_rgb(rgb))
}

/// Converts an RGB888 canvas into `format`.
pub fn encode(canvas: Canvas, format: PixelFormat, dither: bool) -> Result<Canvas, RenderError> {
    let (width, height) = canvas.dimensions();
    let from = canvas.format();
    if from != PixelFormat::Rgb888 {
        if from == format {
            return Ok(canvas);
        }
        return Err(RenderError::Encode { from, to: format });
    }

    let data = match format {
        PixelFormat::Rgb888 => return Ok(canvas),
        PixelFormat::Rgb565Le => encode_rgb565_le(canvas.as_bytes()),
        PixelFormat::Spectra6 => {
            let rgb = image::RgbImage::from_raw(width, height, canvas.into_bytes())
                .ok_or(RenderError::Encode { from, to: format })?;
            encode_spectra6(&rgb, dither)
        }
    };
    Canvas::from_raw(width, height, format, data).ok_or(RenderError::Encode { from, to: format })
}

fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage, String> {
    if source.width() == target_w && source.height() == target_h {
        return Ok(source.clone());
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| format!("invalid source buffer: {err}"))?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .map_err(|err| err.to_string())?;
    RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| "resized buffer has unexpected length".to_string())
}
