use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use rust_folder_frame::config::Configuration;
use rust_folder_frame::library::ImageLibrary;
use rust_folder_frame::platform::device::{self, DeviceSink};
use rust_folder_frame::render::Renderer;
use rust_folder_frame::tasks::{files, slideshow};

#[derive(Debug, Parser)]
#[command(
    name = "folder-frame",
    version,
    about = "slideshow of a shared image folder on a framebuffer or paged panel"
)]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Override the per-image dwell (e.g. "45s", "2m")
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    dwell: Option<Duration>,
    /// Show the first image once and exit
    #[arg(long)]
    once: bool,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let level = match verbosity {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };
    if let Some(level) = level {
        filter = filter.add_directive(
            format!("rust_folder_frame={level}")
                .parse()
                .context("invalid log directive")?,
        );
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        dwell,
        once,
        verbose,
    } = Args::parse();
    init_tracing(verbose)?;

    let mut cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?;
    if let Some(dwell) = dwell {
        cfg.dwell = dwell;
    }
    let cfg = cfg.validated().context("invalid configuration values")?;
    tracing::info!(
        "Loaded configuration from {}:\n{:#?}",
        config.display(),
        cfg
    );

    let device = device::open(&cfg.device).context("failed to initialize output device")?;
    let caps = device.capabilities().clone();
    tracing::info!(
        device = %caps.name,
        width = caps.width,
        height = caps.height,
        format = ?caps.format,
        supports_sleep = caps.supports_sleep,
        "output device ready"
    );
    let renderer = Renderer::new(caps.render_target(cfg.background.resolve(), cfg.device.dither()));

    let library = ImageLibrary::new(&cfg.image_folder, &cfg.extensions);
    {
        let library = library.clone();
        match tokio::task::spawn_blocking(move || library.rescan())
            .await
            .context("startup scan panicked")?
        {
            Ok(_) => {}
            Err(err) => tracing::warn!("startup scan failed: {err}"),
        }
    }
    tracing::info!(
        count = library.current_snapshot().len(),
        folder = %cfg.image_folder.display(),
        "startup scan complete"
    );

    if once {
        return show_once(&library, device, renderer).await;
    }

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sigterm.recv() => {
                            tracing::info!("SIGTERM received; initiating shutdown");
                            cancel.cancel();
                        }
                    }
                }
                Err(err) => tracing::warn!("failed to register SIGTERM handler: {err}"),
            }
        });
    }

    let mut tasks = JoinSet::new();

    // Folder watcher
    tasks.spawn({
        let library = library.clone();
        let options = cfg.watcher.clone();
        let cancel = cancel.clone();
        async move {
            files::run(library, options, cancel)
                .await
                .context("folder watcher failed")
        }
    });

    // Display loop
    tasks.spawn({
        let show = slideshow::Slideshow::new(
            library.clone(),
            device,
            renderer,
            slideshow::LoopSettings::from_config(&cfg),
        );
        let cancel = cancel.clone();
        async move {
            show.run(cancel)
                .await
                .map(|_| ())
                .context("slideshow failed")
        }
    });

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("task error: {e:?}");
                cancel.cancel();
            }
            Err(e) => {
                tracing::error!("join error: {e}");
                cancel.cancel();
            }
        }
    }

    Ok(())
}

/// Renders the first image, refreshes the device once and exits.
async fn show_once(
    library: &ImageLibrary,
    mut device: Box<dyn DeviceSink>,
    renderer: Renderer,
) -> Result<()> {
    let snapshot = library.current_snapshot();
    let Some(name) = snapshot.first() else {
        bail!("no images found in {}", library.folder().display());
    };
    let path = library.path_of(name);
    tracing::info!(path = %path.display(), "showing a single image");

    tokio::task::spawn_blocking(move || -> Result<()> {
        let canvas = renderer
            .render(&path)
            .with_context(|| format!("failed to render {}", path.display()))?;
        let report = device.refresh(&canvas).context("device refresh failed")?;
        tracing::info!(
            latency = %humantime::format_duration(report.latency),
            bytes = report.bytes,
            "image displayed"
        );
        if device.capabilities().supports_sleep {
            device.sleep().context("failed to put device to sleep")?;
        }
        Ok(())
    })
    .await
    .context("single-shot task panicked")?
}
