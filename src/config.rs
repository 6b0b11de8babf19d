use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use serde::de::{self, Deserializer, SeqAccess, Unexpected, Visitor};

pub const DEFAULT_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "webp"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Shared folder the uploader drops images into.
    pub image_folder: PathBuf,
    /// Time an image stays on screen before the next one is shown.
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
    /// Allowed file extensions, matched case-insensitively, without the dot.
    pub extensions: Vec<String>,
    /// Fill color around letterboxed images.
    pub background: BackgroundPolicy,
    /// Put a sleep-capable device into low-power mode between refreshes.
    pub sleep_between_images: bool,
    /// Folder watcher timing.
    pub watcher: WatcherOptions,
    /// Display loop timing.
    pub slideshow: SlideshowOptions,
    /// Output device selection.
    pub device: DeviceConfig,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(mut self) -> Result<Self> {
        ensure!(
            !self.image_folder.as_os_str().is_empty(),
            "image-folder must not be empty"
        );
        ensure!(!self.dwell.is_zero(), "dwell must be greater than zero");
        ensure!(
            !self.extensions.is_empty(),
            "extensions must list at least one file extension"
        );
        self.extensions = self
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        ensure!(
            self.extensions.iter().all(|ext| !ext.is_empty()),
            "extensions must not contain blank entries"
        );
        self.watcher
            .validate()
            .context("invalid watcher configuration")?;
        self.slideshow
            .validate()
            .context("invalid slideshow configuration")?;
        self.device
            .validate()
            .context("invalid device configuration")?;
        Ok(self)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            image_folder: PathBuf::new(),
            dwell: Duration::from_secs(30),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            background: BackgroundPolicy::default(),
            sleep_between_images: true,
            watcher: WatcherOptions::default(),
            slideshow: SlideshowOptions::default(),
            device: DeviceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct WatcherOptions {
    /// Longest the watcher blocks waiting for a change notification.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// Pause after the first event before rescanning, letting writes finish.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Full rescan cadence; the only source of updates if notifications are unavailable.
    #[serde(with = "humantime_serde")]
    pub rescan_interval: Duration,
    /// First retry delay while the folder is missing or the watch cannot be set up.
    #[serde(with = "humantime_serde")]
    pub retry_initial: Duration,
    /// Upper bound for the doubling retry delay.
    #[serde(with = "humantime_serde")]
    pub retry_max: Duration,
}

impl WatcherOptions {
    fn validate(&self) -> Result<()> {
        ensure!(
            !self.poll_timeout.is_zero(),
            "watcher.poll-timeout must be greater than zero"
        );
        ensure!(
            !self.rescan_interval.is_zero(),
            "watcher.rescan-interval must be greater than zero"
        );
        ensure!(
            !self.retry_initial.is_zero(),
            "watcher.retry-initial must be greater than zero"
        );
        ensure!(
            self.retry_max >= self.retry_initial,
            "watcher.retry-max must be at least watcher.retry-initial"
        );
        Ok(())
    }
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_millis(100),
            rescan_interval: Duration::from_secs(60),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SlideshowOptions {
    /// Granularity of the dwell wait; bounds how late an image change can be.
    #[serde(with = "humantime_serde")]
    pub wait_slice: Duration,
    /// Poll interval while the folder holds no images.
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,
    /// Pause after a failed render or refresh.
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,
}

impl SlideshowOptions {
    fn validate(&self) -> Result<()> {
        ensure!(
            !self.wait_slice.is_zero(),
            "slideshow.wait-slice must be greater than zero"
        );
        ensure!(
            !self.idle_poll.is_zero(),
            "slideshow.idle-poll must be greater than zero"
        );
        Ok(())
    }
}

impl Default for SlideshowOptions {
    fn default() -> Self {
        Self {
            wait_slice: Duration::from_secs(1),
            idle_poll: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Background fill around a fitted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackgroundPolicy {
    /// Whatever the device prefers (black framebuffer, white panel).
    #[default]
    Auto,
    Rgb([u8; 3]),
}

impl BackgroundPolicy {
    pub fn resolve(self) -> Option<[u8; 3]> {
        match self {
            BackgroundPolicy::Auto => None,
            BackgroundPolicy::Rgb(rgb) => Some(rgb),
        }
    }
}

impl<'de> Deserialize<'de> for BackgroundPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BackgroundVisitor;

        impl<'de> Visitor<'de> for BackgroundVisitor {
            type Value = BackgroundPolicy;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an RGB triple or one of 'auto', 'black', 'white'")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    "auto" => Ok(BackgroundPolicy::Auto),
                    "black" => Ok(BackgroundPolicy::Rgb([0, 0, 0])),
                    "white" => Ok(BackgroundPolicy::Rgb([255, 255, 255])),
                    other => Err(de::Error::invalid_value(Unexpected::Str(other), &self)),
                }
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut rgb = [0u8; 3];
                for (index, channel) in rgb.iter_mut().enumerate() {
                    *channel = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(index, &self))?;
                }
                if seq.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(4, &self));
                }
                Ok(BackgroundPolicy::Rgb(rgb))
            }
        }

        deserializer.deserialize_any(BackgroundVisitor)
    }
}

/// Output device selector.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum DeviceConfig {
    Framebuffer(FramebufferConfig),
    PagedPanel(PagedPanelConfig),
}

impl DeviceConfig {
    fn validate(&self) -> Result<()> {
        match self {
            DeviceConfig::Framebuffer(fb) => {
                ensure!(
                    !fb.path.as_os_str().is_empty(),
                    "device.path must not be empty"
                );
                ensure!(
                    fb.width != Some(0) && fb.height != Some(0),
                    "device.width and device.height must be positive"
                );
            }
            DeviceConfig::PagedPanel(panel) => {
                ensure!(
                    panel.width > 0 && panel.height > 0,
                    "device.width and device.height must be positive"
                );
                ensure!(
                    !panel.refresh_command.trim().is_empty(),
                    "device.refresh-command must not be empty"
                );
            }
        }
        Ok(())
    }

    /// Whether palette quantization should diffuse error.
    pub fn dither(&self) -> bool {
        match self {
            DeviceConfig::Framebuffer(_) => false,
            DeviceConfig::PagedPanel(panel) => panel.dither,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig::Framebuffer(FramebufferConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct FramebufferConfig {
    /// Framebuffer device node.
    pub path: PathBuf,
    /// Resolution override; read from sysfs when absent.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// sysfs directory describing the framebuffer (defaults to `/sys/class/graphics/<name>`).
    pub sysfs_dir: Option<PathBuf>,
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/fb0"),
            width: None,
            height: None,
            sysfs_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PagedPanelConfig {
    /// Name used in logs.
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Floyd–Steinberg dithering when mapping to the panel palette.
    pub dither: bool,
    /// Shows a packed frame; receives it on stdin unless it contains `@BUFFER@`.
    pub refresh_command: String,
    /// File the packed frame is written to before the refresh command runs.
    pub buffer_path: Option<PathBuf>,
    /// Powers up / wakes the panel controller.
    pub init_command: Option<String>,
    /// Puts the panel into deep sleep. Without it the panel never sleeps.
    pub sleep_command: Option<String>,
    /// Typical full refresh duration, used for logging.
    #[serde(with = "humantime_serde")]
    pub refresh_latency_hint: Duration,
}

impl Default for PagedPanelConfig {
    fn default() -> Self {
        Self {
            name: "paged-panel".to_string(),
            width: 800,
            height: 480,
            dither: true,
            refresh_command: String::new(),
            buffer_path: None,
            init_command: None,
            sleep_command: None,
            refresh_latency_hint: Duration::from_secs(20),
        }
    }
}
