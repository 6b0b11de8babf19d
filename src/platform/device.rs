use std::time::Duration;

use crate::canvas::{Canvas, PixelFormat};
use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::platform::framebuffer::FramebufferSink;
use crate::platform::panel::{CommandPanelDriver, PagedPanelSink};
use crate::render::RenderTarget;

/// What a device can do, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Human-readable name used in logs and errors.
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Native encoding the device expects from [`DeviceSink::refresh`].
    pub format: PixelFormat,
    /// Fill color used around letterboxed images unless overridden.
    pub background: [u8; 3],
    pub supports_sleep: bool,
    /// Typical duration of one refresh.
    pub refresh_latency_hint: Duration,
}

impl DeviceCapabilities {
    /// Render target matching this device, with an optional background override.
    pub fn render_target(&self, background: Option<[u8; 3]>, dither: bool) -> RenderTarget {
        RenderTarget {
            width: self.width,
            height: self.height,
            format: self.format,
            background: background.unwrap_or(self.background),
            dither,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub latency: Duration,
    pub bytes: usize,
}

/// A physical output that accepts finished frames.
///
/// Implementations block for the duration of a refresh; callers are expected
/// to run them on a blocking thread.
pub trait DeviceSink: Send + 'static {
    fn capabilities(&self) -> &DeviceCapabilities;

    fn refresh(&mut self, canvas: &Canvas) -> Result<RefreshReport, DeviceError>;

    fn sleep(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::SleepUnsupported {
            device: self.capabilities().name.clone(),
        })
    }

    fn wake(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

impl DeviceSink for Box<dyn DeviceSink> {
    fn capabilities(&self) -> &DeviceCapabilities {
        (**self).capabilities()
    }

    fn refresh(&mut self, canvas: &Canvas) -> Result<RefreshReport, DeviceError> {
        (**self).refresh(canvas)
    }

    fn sleep(&mut self) -> Result<(), DeviceError> {
        (**self).sleep()
    }

    fn wake(&mut self) -> Result<(), DeviceError> {
        (**self).wake()
    }
}

/// Rejects a canvas whose size or encoding differs from the device.
pub fn check_geometry(caps: &DeviceCapabilities, canvas: &Canvas) -> Result<(), DeviceError> {
    if canvas.dimensions() == (caps.width, caps.height) && canvas.format() == caps.format {
        return Ok(());
    }
    Err(DeviceError::Geometry {
        device: caps.name.clone(),
        got_width: canvas.width(),
        got_height: canvas.height(),
        got_format: canvas.format(),
        want_width: caps.width,
        want_height: caps.height,
        want_format: caps.format,
    })
}

/// Brings up the configured device. Any error here is fatal for the process.
pub fn open(cfg: &DeviceConfig) -> Result<Box<dyn DeviceSink>, DeviceError> {
    match cfg {
        DeviceConfig::Framebuffer(fb) => Ok(Box::new(FramebufferSink::open(fb)?)),
        DeviceConfig::PagedPanel(panel) => {
            let driver = CommandPanelDriver::new(panel)?;
            Ok(Box::new(PagedPanelSink::new(driver, panel)?))
        }
    }
}
