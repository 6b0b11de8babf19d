use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::canvas::{Canvas, PixelFormat};
use crate::config::FramebufferConfig;
use crate::error::DeviceError;
use crate::platform::device::{DeviceCapabilities, DeviceSink, RefreshReport, check_geometry};

const BYTES_PER_PIXEL: usize = 2;

/// Geometry reported by the kernel under `/sys/class/graphics/fbN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FbGeometry {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bits_per_pixel: Option<u32>,
    pub stride: Option<usize>,
}

/// Reads whatever of `virtual_size`, `bits_per_pixel` and `stride` is present in `dir`.
pub fn probe_geometry(dir: &Path) -> FbGeometry {
    let read = |name: &str| fs::read_to_string(dir.join(name)).ok();
    let mut geometry = FbGeometry::default();
    if let Some(size) = read("virtual_size") {
        let mut parts = size.trim().split(',');
        geometry.width = parts.next().and_then(|w| w.trim().parse().ok());
        geometry.height = parts.next().and_then(|h| h.trim().parse().ok());
    }
    geometry.bits_per_pixel = read("bits_per_pixel").and_then(|v| v.trim().parse().ok());
    geometry.stride = read("stride").and_then(|v| v.trim().parse().ok());
    geometry
}

/// Default sysfs directory for a device node such as `/dev/fb0`.
pub fn sysfs_dir_for(device: &Path) -> Option<PathBuf> {
    let name = device.file_name()?.to_str()?;
    Some(Path::new("/sys/class/graphics").join(name))
}

/// Raw RGB565 framebuffer written in raster order.
#[derive(Debug)]
pub struct FramebufferSink {
    path: PathBuf,
    file: File,
    caps: DeviceCapabilities,
    stride: usize,
}

impl FramebufferSink {
    pub fn open(cfg: &FramebufferConfig) -> Result<Self, DeviceError> {
        let name = cfg.path.display().to_string();
        let init_error = |reason: String| DeviceError::Init {
            device: name.clone(),
            reason,
        };

        let sysfs = cfg.sysfs_dir.clone().or_else(|| sysfs_dir_for(&cfg.path));
        let probed = sysfs.as_deref().map(probe_geometry).unwrap_or_default();
        debug!(?probed, sysfs = ?sysfs, "probed framebuffer geometry");

        let width = cfg
            .width
            .or(probed.width)
            .ok_or_else(|| init_error("width not configured and not reported by sysfs".into()))?;
        let height = cfg
            .height
            .or(probed.height)
            .ok_or_else(|| init_error("height not configured and not reported by sysfs".into()))?;
        if width == 0 || height == 0 {
            return Err(init_error(format!("invalid resolution {width}x{height}")));
        }
        if let Some(bpp) = probed.bits_per_pixel
            && bpp != 16
        {
            return Err(init_error(format!(
                "framebuffer is configured for {bpp} bits per pixel; RGB565 output needs 16"
            )));
        }

        let row_bytes = width as usize * BYTES_PER_PIXEL;
        let stride = match probed.stride {
            Some(stride) if stride >= row_bytes => stride,
            Some(stride) => {
                warn!(stride, row_bytes, "sysfs stride shorter than a row; ignoring");
                row_bytes
            }
            None => row_bytes,
        };

        let file = OpenOptions::new()
            .write(true)
            .open(&cfg.path)
            .map_err(|err| init_error(format!("cannot open for writing: {err}")))?;

        info!(
            device = %cfg.path.display(),
            width,
            height,
            stride,
            "framebuffer ready"
        );

        Ok(Self {
            path: cfg.path.clone(),
            file,
            caps: DeviceCapabilities {
                name,
                width,
                height,
                format: PixelFormat::Rgb565Le,
                background: [0, 0, 0],
                supports_sleep: false,
                refresh_latency_hint: Duration::from_millis(20),
            },
            stride,
        })
    }

    fn io_error(&self, source: std::io::Error) -> DeviceError {
        DeviceError::Io {
            device: self.caps.name.clone(),
            source,
        }
    }
}

impl DeviceSink for FramebufferSink {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn refresh(&mut self, canvas: &Canvas) -> Result<RefreshReport, DeviceError> {
        check_geometry(&self.caps, canvas)?;
        let started = Instant::now();
        let row_bytes = self.caps.width as usize * BYTES_PER_PIXEL;

        let frame: Cow<'_, [u8]> = if self.stride == row_bytes {
            Cow::Borrowed(canvas.as_bytes())
        } else {
            let mut padded = vec![0u8; self.stride * self.caps.height as usize];
            for (dst, src) in padded
                .chunks_exact_mut(self.stride)
                .zip(canvas.as_bytes().chunks_exact(row_bytes))
            {
                dst[..row_bytes].copy_from_slice(src);
            }
            Cow::Owned(padded)
        };

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|err| self.io_error(err))?;
        self.file
            .write_all(&frame)
            .map_err(|err| self.io_error(err))?;
        self.file.flush().map_err(|err| self.io_error(err))?;

        let latency = started.elapsed();
        debug!(device = %self.path.display(), bytes = frame.len(), ?latency, "framebuffer written");
        Ok(RefreshReport {
            latency,
            bytes: frame.len(),
        })
    }
}
