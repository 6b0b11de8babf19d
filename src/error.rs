use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::canvas::PixelFormat;

/// Transient failures while rescanning the shared folder. Always retried.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("failed to read image folder {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list image folder {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("image folder {} is not a directory", path.display())]
    NotADirectory { path: PathBuf },
}

/// Pipeline stage a render failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Decode,
    Resize,
    Encode,
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RenderStage::Decode => "decode",
            RenderStage::Resize => "resize",
            RenderStage::Encode => "encode",
        })
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    /// The file disappeared between the snapshot and the decode.
    #[error("{} vanished before it could be decoded", path.display())]
    Missing { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is empty", path.display())]
    Empty { path: PathBuf },

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to resize {} to {width}x{height}: {reason}", path.display())]
    Resize {
        path: PathBuf,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("cannot encode {from:?} canvas as {to:?}")]
    Encode { from: PixelFormat, to: PixelFormat },
}

impl RenderError {
    pub fn stage(&self) -> RenderStage {
        match self {
            RenderError::Missing { .. }
            | RenderError::Read { .. }
            | RenderError::Empty { .. }
            | RenderError::Decode { .. } => RenderStage::Decode,
            RenderError::Resize { .. } => RenderStage::Resize,
            RenderError::Encode { .. } => RenderStage::Encode,
        }
    }

    /// `true` when the source vanished, which is a list race rather than a bad image.
    pub fn is_missing(&self) -> bool {
        matches!(self, RenderError::Missing { .. })
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device cannot be brought up at all. Fatal at startup.
    #[error("failed to initialize {device}: {reason}")]
    Init { device: String, reason: String },

    #[error("{device}: i/o error: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{device}: canvas is {got_width}x{got_height} {got_format:?}, device expects {want_width}x{want_height} {want_format:?}"
    )]
    Geometry {
        device: String,
        got_width: u32,
        got_height: u32,
        got_format: PixelFormat,
        want_width: u32,
        want_height: u32,
        want_format: PixelFormat,
    },

    #[error("{device}: command `{command}` failed: {detail}")]
    Command {
        device: String,
        command: String,
        detail: String,
    },

    #[error("{device} is asleep; wake it before refreshing")]
    Asleep { device: String },

    #[error("{device} does not support low-power sleep")]
    SleepUnsupported { device: String },
}

impl DeviceError {
    pub fn is_init(&self) -> bool {
        matches!(self, DeviceError::Init { .. })
    }
}
