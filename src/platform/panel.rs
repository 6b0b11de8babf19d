use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::canvas::{Canvas, PixelFormat};
use crate::config::PagedPanelConfig;
use crate::error::DeviceError;
use crate::platform::device::{DeviceCapabilities, DeviceSink, RefreshReport, check_geometry};

/// Placeholder in the refresh command replaced by the buffer file path.
pub const BUFFER_PLACEHOLDER: &str = "@BUFFER@";

/// Low-level panel operations. Bus bring-up and driver installation happen
/// outside this crate; a driver only has to move a packed frame to the glass.
pub trait PanelDriver: Send + 'static {
    /// Power up (or wake) the controller so it accepts a frame.
    fn init(&mut self) -> Result<(), DeviceError>;
    /// Transfer `frame` and block until the panel finished refreshing.
    fn display(&mut self, frame: &[u8]) -> Result<(), DeviceError>;
    fn sleep(&mut self) -> Result<(), DeviceError>;
    fn supports_sleep(&self) -> bool;
}

/// Slow-refresh paged panel. Requires an explicit wake after sleeping.
pub struct PagedPanelSink<D: PanelDriver> {
    driver: D,
    caps: DeviceCapabilities,
    asleep: bool,
}

impl<D: PanelDriver> PagedPanelSink<D> {
    pub fn new(driver: D, cfg: &PagedPanelConfig) -> Result<Self, DeviceError> {
        Self::with_geometry(
            driver,
            cfg.name.clone(),
            cfg.width,
            cfg.height,
            cfg.refresh_latency_hint,
        )
    }

    pub fn with_geometry(
        mut driver: D,
        name: String,
        width: u32,
        height: u32,
        refresh_latency_hint: Duration,
    ) -> Result<Self, DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::Init {
                device: name,
                reason: format!("invalid resolution {width}x{height}"),
            });
        }
        if let Err(err) = driver.init() {
            return Err(match err {
                DeviceError::Init { .. } => err,
                other => DeviceError::Init {
                    device: name,
                    reason: other.to_string(),
                },
            });
        }
        info!(device = %name, width, height, "paged panel ready");
        Ok(Self {
            caps: DeviceCapabilities {
                name,
                width,
                height,
                format: PixelFormat::Spectra6,
                background: [255, 255, 255],
                supports_sleep: driver.supports_sleep(),
                refresh_latency_hint,
            },
            driver,
            asleep: false,
        })
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }
}

impl<D: PanelDriver> DeviceSink for PagedPanelSink<D> {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn refresh(&mut self, canvas: &Canvas) -> Result<RefreshReport, DeviceError> {
        check_geometry(&self.caps, canvas)?;
        if self.asleep {
            return Err(DeviceError::Asleep {
                device: self.caps.name.clone(),
            });
        }
        let started = Instant::now();
        self.driver.display(canvas.as_bytes())?;
        Ok(RefreshReport {
            latency: started.elapsed(),
            bytes: canvas.as_bytes().len(),
        })
    }

    fn sleep(&mut self) -> Result<(), DeviceError> {
        if !self.caps.supports_sleep {
            return Err(DeviceError::SleepUnsupported {
                device: self.caps.name.clone(),
            });
        }
        if self.asleep {
            return Ok(());
        }
        self.driver.sleep()?;
        self.asleep = true;
        Ok(())
    }

    fn wake(&mut self) -> Result<(), DeviceError> {
        if !self.asleep {
            return Ok(());
        }
        self.driver.init()?;
        self.asleep = false;
        Ok(())
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

type CommandRunner = Arc<dyn Fn(&str, Option<&[u8]>) -> io::Result<CommandOutput> + Send + Sync>;

/// Drives a panel through operator-supplied shell commands.
///
/// The refresh command receives the packed frame on stdin, or, when it
/// contains `@BUFFER@`, reads it from `buffer-path` written just before.
pub struct CommandPanelDriver {
    name: String,
    refresh_command: String,
    init_command: Option<String>,
    sleep_command: Option<String>,
    buffer_path: Option<PathBuf>,
    runner: CommandRunner,
}

impl fmt::Debug for CommandPanelDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPanelDriver")
            .field("name", &self.name)
            .field("refresh_command", &self.refresh_command)
            .field("init_command", &self.init_command)
            .field("sleep_command", &self.sleep_command)
            .field("buffer_path", &self.buffer_path)
            .finish()
    }
}

impl CommandPanelDriver {
    pub fn new(cfg: &PagedPanelConfig) -> Result<Self, DeviceError> {
        Self::build(cfg, default_runner())
    }

    fn build(cfg: &PagedPanelConfig, runner: CommandRunner) -> Result<Self, DeviceError> {
        let init_error = |reason: &str| DeviceError::Init {
            device: cfg.name.clone(),
            reason: reason.to_string(),
        };
        if cfg.refresh_command.trim().is_empty() {
            return Err(init_error("refresh-command must not be blank"));
        }
        if cfg.refresh_command.contains(BUFFER_PLACEHOLDER) && cfg.buffer_path.is_none() {
            return Err(init_error(
                "refresh-command uses @BUFFER@ but no buffer-path is configured",
            ));
        }
        let non_blank = |cmd: &Option<String>| cmd.clone().filter(|c| !c.trim().is_empty());

        Ok(Self {
            name: cfg.name.clone(),
            refresh_command: cfg.refresh_command.clone(),
            init_command: non_blank(&cfg.init_command),
            sleep_command: non_blank(&cfg.sleep_command),
            buffer_path: cfg.buffer_path.clone(),
            runner,
        })
    }

    #[cfg(test)]
    fn with_runner(cfg: &PagedPanelConfig, runner: CommandRunner) -> Result<Self, DeviceError> {
        Self::build(cfg, runner)
    }

    fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<(), DeviceError> {
        let output = (self.runner)(command, stdin).map_err(|err| DeviceError::Command {
            device: self.name.clone(),
            command: command.to_string(),
            detail: err.to_string(),
        })?;
        if output.status.success() {
            debug!(command, stdout = output.stdout.trim(), "panel command succeeded");
            return Ok(());
        }
        let exit = output
            .status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        warn!(
            command,
            exit_code = exit,
            stderr = output.stderr.trim(),
            "panel command failed"
        );
        Err(DeviceError::Command {
            device: self.name.clone(),
            command: command.to_string(),
            detail: format!("exit {exit}: {}", output.stderr.trim()),
        })
    }
}

impl PanelDriver for CommandPanelDriver {
    fn init(&mut self) -> Result<(), DeviceError> {
        match &self.init_command {
            Some(cmd) => self.run(cmd, None),
            None => Ok(()),
        }
    }

    fn display(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        if let Some(path) = &self.buffer_path {
            fs::write(path, frame).map_err(|source| DeviceError::Io {
                device: self.name.clone(),
                source,
            })?;
        }
        if self.refresh_command.contains(BUFFER_PLACEHOLDER) {
            let path = self
                .buffer_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let command = self.refresh_command.replace(BUFFER_PLACEHOLDER, &path);
            self.run(&command, None)
        } else {
            self.run(&self.refresh_command, Some(frame))
        }
    }

    fn sleep(&mut self) -> Result<(), DeviceError> {
        match &self.sleep_command {
            Some(cmd) => self.run(cmd, None),
            None => Err(DeviceError::SleepUnsupported {
                device: self.name.clone(),
            }),
        }
    }

    fn supports_sleep(&self) -> bool {
        self.sleep_command.is_some()
    }
}

fn default_runner() -> CommandRunner {
    Arc::new(|command: &str, stdin: Option<&[u8]>| run_shell(command, stdin))
}

fn run_shell(command: &str, stdin: Option<&[u8]>) -> io::Result<CommandOutput> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(data)) => {
            let data = data.to_vec();
            Some(std::thread::spawn(move || pipe.write_all(&data)))
        }
        _ => None,
    };

    let output = child.wait_with_output()?;
    if let Some(handle) = writer {
        match handle.join() {
            Ok(Err(err)) if err.kind() != io::ErrorKind::BrokenPipe => return Err(err),
            Err(_) => return Err(io::Error::other("stdin writer panicked")),
            _ => {}
        }
    }

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
