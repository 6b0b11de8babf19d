mod state;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::select;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use state::{DisplayState, LoopState, SlideshowSM, StateChange};

use crate::config::Configuration;
use crate::error::{DeviceError, RenderStage};
use crate::events::{FailureStage, SlideshowEvent};
use crate::library::{ImageLibrary, RescanOutcome};
use crate::platform::device::DeviceSink;
use crate::render::Renderer;
use crate::timing::Backoff;

const EVENT_CAPACITY: usize = 64;

/// Timing knobs for the display loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub dwell: Duration,
    pub wait_slice: Duration,
    pub idle_poll: Duration,
    pub error_backoff: Duration,
    pub sleep_between_images: bool,
}

impl LoopSettings {
    pub fn from_config(cfg: &Configuration) -> Self {
        Self {
            dwell: cfg.dwell,
            wait_slice: cfg.slideshow.wait_slice,
            idle_poll: cfg.slideshow.idle_poll,
            error_backoff: cfg.slideshow.error_backoff,
            sleep_between_images: cfg.sleep_between_images,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlideshowStats {
    pub shown: u64,
    /// Images that vanished before they could be shown.
    pub skipped: u64,
    /// Recoverable render and refresh failures.
    pub errors: u64,
}

/// The display loop. Owns the device and the display state.
pub struct Slideshow<D: DeviceSink> {
    library: ImageLibrary,
    device: Arc<Mutex<D>>,
    renderer: Arc<Renderer>,
    settings: LoopSettings,
    display: DisplayState,
    sm: SlideshowSM,
    stats: SlideshowStats,
    backoff: Backoff,
    supports_sleep: bool,
    device_name: String,
    events: broadcast::Sender<SlideshowEvent>,
}

impl<D: DeviceSink> Slideshow<D> {
    pub fn new(library: ImageLibrary, device: D, renderer: Renderer, settings: LoopSettings) -> Self {
        let supports_sleep = device.capabilities().supports_sleep;
        let device_name = device.capabilities().name.clone();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            library,
            device: Arc::new(Mutex::new(device)),
            renderer: Arc::new(renderer),
            backoff: Backoff::fixed(settings.error_backoff),
            settings,
            display: DisplayState::default(),
            sm: SlideshowSM::default(),
            stats: SlideshowStats::default(),
            supports_sleep,
            device_name,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlideshowEvent> {
        self.events.subscribe()
    }

    /// Shared handle to the device, e.g. to inspect it after the loop stopped.
    pub fn device(&self) -> Arc<Mutex<D>> {
        self.device.clone()
    }

    pub fn state(&self) -> LoopState {
        self.sm.current()
    }

    /// Runs until `cancel` fires. A refresh in flight is always allowed to finish.
    #[instrument(skip_all, fields(folder = %self.library.folder().display()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SlideshowStats> {
        info!(
            dwell = %humantime::format_duration(self.settings.dwell),
            supports_sleep = self.supports_sleep,
            "slideshow started"
        );

        while !cancel.is_cancelled() {
            if !self.step(&cancel).await {
                break;
            }
        }

        self.shutdown().await;
        info!(
            shown = self.stats.shown,
            skipped = self.stats.skipped,
            errors = self.stats.errors,
            "slideshow stopped"
        );
        Ok(self.stats)
    }

    /// One pass through the state machine. Returns `false` once cancelled.
    async fn step(&mut self, cancel: &CancellationToken) -> bool {
        let updated = self.library.take_updated();
        let snapshot = self.library.current_snapshot();
        if self.display.on_snapshot(snapshot.len()) {
            debug!(len = snapshot.len(), "image list shrank; restarting from the first image");
        }
        if updated {
            debug!(len = snapshot.len(), "picked up new image list");
        }

        if snapshot.is_empty() {
            self.goto(LoopState::Idle);
            return self.pause(self.settings.idle_poll, cancel).await;
        }
        self.goto(LoopState::Waiting);

        let remaining = self
            .display
            .remaining_dwell(self.settings.dwell, Instant::now());
        if !remaining.is_zero() {
            return self
                .pause(remaining.min(self.settings.wait_slice), cancel)
                .await;
        }

        let index = self.display.current_index();
        let name = snapshot[index].clone();
        let path = self.library.path_of(&name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return self.skip_missing(name, cancel).await;
        }
        self.show(index, name, path, cancel).await
    }

    async fn show(
        &mut self,
        index: usize,
        name: String,
        path: PathBuf,
        cancel: &CancellationToken,
    ) -> bool {
        if self.display.device_asleep() {
            match self.with_device(|device| device.wake()).await {
                Ok(()) => self.display.set_device_asleep(false),
                Err(err) => warn!(error = %err, "failed to wake device"),
            }
        }

        self.goto(LoopState::Rendering);
        let started = Instant::now();
        let renderer = self.renderer.clone();
        let source = path.clone();
        let canvas = match tokio::task::spawn_blocking(move || renderer.render(&source)).await {
            Ok(Ok(canvas)) => canvas,
            Ok(Err(err)) if err.is_missing() => return self.skip_missing(name, cancel).await,
            Ok(Err(err)) => {
                warn!(path = %path.display(), stage = %err.stage(), error = %err, "failed to render image; skipping");
                return self
                    .recover(name, FailureStage::Render(err.stage()), cancel)
                    .await;
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "render task panicked");
                return self
                    .recover(name, FailureStage::Render(RenderStage::Decode), cancel)
                    .await;
            }
        };
        debug!(
            path = %path.display(),
            elapsed = %humantime::format_duration(started.elapsed()),
            "image rendered"
        );

        self.goto(LoopState::AwaitingRefresh);
        match self.with_device(move |device| device.refresh(&canvas)).await {
            Ok(report) => {
                self.display.mark_displayed(Instant::now());
                // The list may have grown or shrunk while the refresh ran.
                self.advance_in_current_list();
                self.stats.shown += 1;
                info!(
                    image = %name,
                    index,
                    latency = %humantime::format_duration(report.latency),
                    bytes = report.bytes,
                    "image displayed"
                );
                self.publish(SlideshowEvent::Displayed { name, index });
                if self.supports_sleep && self.settings.sleep_between_images {
                    self.goto(LoopState::Sleeping);
                    match self.with_device(|device| device.sleep()).await {
                        Ok(()) => self.display.set_device_asleep(true),
                        Err(err) => warn!(error = %err, "failed to put device to sleep"),
                    }
                }
                true
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "device refresh failed");
                self.recover(name, FailureStage::Refresh, cancel).await
            }
        }
    }

    /// The file is gone: correct the list right away instead of waiting for the watcher.
    async fn skip_missing(&mut self, name: String, cancel: &CancellationToken) -> bool {
        self.goto(LoopState::Waiting);
        info!(image = %name, "image vanished before display; rescanning");
        self.stats.skipped += 1;
        self.publish(SlideshowEvent::Skipped { name: name.clone() });

        let library = self.library.clone();
        match tokio::task::spawn_blocking(move || library.rescan()).await {
            Ok(Ok(RescanOutcome::Changed { .. })) => true,
            Ok(Ok(RescanOutcome::Unchanged)) => {
                let snapshot = self.library.current_snapshot();
                if snapshot.contains(&name) {
                    // Still listed; step over it so the loop cannot spin on it.
                    self.display.advance(snapshot.len());
                }
                true
            }
            Ok(Err(err)) => {
                warn!(error = %err, "out-of-band rescan failed");
                self.pause(self.settings.wait_slice, cancel).await
            }
            Err(err) => {
                error!(error = %err, "rescan task panicked");
                self.pause(self.settings.wait_slice, cancel).await
            }
        }
    }

    /// Counts a per-image failure, moves on and backs off.
    async fn recover(
        &mut self,
        name: String,
        stage: FailureStage,
        cancel: &CancellationToken,
    ) -> bool {
        self.stats.errors += 1;
        self.publish(SlideshowEvent::Failed { name, stage });
        self.advance_in_current_list();
        self.goto(LoopState::Waiting);
        let delay = self.backoff.next_delay();
        select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    fn advance_in_current_list(&mut self) {
        let len = self.library.current_snapshot().len();
        self.display.advance(len);
    }

    /// Waits up to `duration`, waking early when the image list changes.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        select! {
            _ = cancel.cancelled() => false,
            _ = self.library.changed() => true,
            _ = sleep(duration) => true,
        }
    }

    async fn with_device<T, F>(&self, op: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut D) -> Result<T, DeviceError> + Send + 'static,
        T: Send + 'static,
    {
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || {
            let mut device = lock(&device);
            op(&mut *device)
        })
        .await
        .map_err(|err| DeviceError::Command {
            device: self.device_name.clone(),
            command: "device operation".to_string(),
            detail: format!("blocking task failed: {err}"),
        })?
    }

    async fn shutdown(&mut self) {
        if !self.supports_sleep || self.display.device_asleep() {
            return;
        }
        match self.with_device(|device| device.sleep()).await {
            Ok(()) => {
                self.display.set_device_asleep(true);
                info!("device put to sleep for shutdown");
            }
            Err(err) => warn!(error = %err, "failed to put device to sleep on shutdown"),
        }
    }

    fn goto(&mut self, to: LoopState) {
        if let Some(change) = self.sm.goto(to) {
            debug!(from = %change.from, to = %change.to, "slideshow state");
            self.publish(SlideshowEvent::StateChanged {
                from: change.from,
                to: change.to,
            });
        }
    }

    fn publish(&self, event: SlideshowEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn lock<D>(device: &Mutex<D>) -> MutexGuard<'_, D> {
    device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
