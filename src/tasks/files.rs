//! Folder watcher: turns filesystem notifications into coalesced rescans.
//!
//! Runs on a dedicated blocking thread. Every wait is bounded by
//! `poll-timeout`, so a dropped notification or a cancellation is noticed
//! within one tick.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::WatcherOptions;
use crate::events::{WatchEvent, WatchEventKind};
use crate::library::{ImageLibrary, RescanOutcome};
use crate::timing::{Backoff, blocking_pause};

#[instrument(skip_all, fields(folder = %library.folder().display()))]
pub async fn run(
    library: ImageLibrary,
    options: WatcherOptions,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::task::spawn_blocking(move || watch_blocking(&library, &options, &cancel))
        .await
        .context("folder watcher thread panicked")?;
    info!("folder watcher stopped");
    Ok(())
}

/// Maps a raw notification onto the changes the watcher cares about.
pub fn classify(event: &Event) -> Vec<WatchEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Remove(_) => WatchEventKind::Deleted,
        EventKind::Modify(ModifyKind::Name(_)) => WatchEventKind::Renamed,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => WatchEventKind::WriteComplete,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .map(|path| WatchEvent {
            kind,
            path: path.clone(),
        })
        .collect()
}

/// Outcome of one [`EventPump::wait_batch`].
#[derive(Debug, PartialEq, Eq)]
pub enum Batch {
    /// At least one relevant change (or a backend error) arrived; rescan once.
    Changes {
        events: Vec<WatchEvent>,
        errors: usize,
    },
    /// Only notifications the watcher ignores arrived.
    Quiet,
    Timeout,
    /// The notification backend went away.
    Disconnected,
}

impl Batch {
    pub fn needs_rescan(&self) -> bool {
        matches!(self, Batch::Changes { .. })
    }
}

/// Receiving end of the notification bridge.
pub struct EventPump {
    rx: Receiver<notify::Result<Event>>,
}

impl EventPump {
    pub fn new(rx: Receiver<notify::Result<Event>>) -> Self {
        Self { rx }
    }

    /// Blocks up to `timeout` for a first notification, then waits `settle`
    /// and drains everything that queued up meanwhile into a single batch.
    pub fn wait_batch(&self, timeout: Duration, settle: Duration) -> Batch {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(first) => first,
            Err(RecvTimeoutError::Timeout) => return Batch::Timeout,
            Err(RecvTimeoutError::Disconnected) => return Batch::Disconnected,
        };
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }

        let mut events = Vec::new();
        let mut errors = 0;
        for received in std::iter::once(first).chain(self.rx.try_iter()) {
            match received {
                Ok(event) if event.need_rescan() => errors += 1,
                Ok(event) => {
                    trace!(kind = ?event.kind, paths = ?event.paths, "notify event");
                    events.extend(classify(&event));
                }
                Err(err) => {
                    warn!(error = %err, "watch error");
                    errors += 1;
                }
            }
        }

        if events.is_empty() && errors == 0 {
            Batch::Quiet
        } else {
            Batch::Changes { events, errors }
        }
    }
}

struct WatchSession {
    _watcher: RecommendedWatcher,
    pump: EventPump,
}

impl WatchSession {
    fn start(folder: &Path) -> notify::Result<Self> {
        let (tx, rx) = unbounded::<notify::Result<Event>>();
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(folder, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            pump: EventPump::new(rx),
        })
    }
}

/// Identity of the folder, used to notice it being replaced.
#[cfg(unix)]
fn folder_identity(folder: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(folder).ok()?;
    meta.is_dir().then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn folder_identity(folder: &Path) -> Option<(u64, u64)> {
    folder.is_dir().then_some((0, 0))
}

fn rescan(library: &ImageLibrary, reason: &str) {
    match library.rescan() {
        Ok(RescanOutcome::Changed { len }) => debug!(reason, count = len, "rescan published"),
        Ok(RescanOutcome::Unchanged) => trace!(reason, "rescan found no change"),
        Err(err) => warn!(reason, error = %err, "rescan failed; keeping previous image list"),
    }
}

fn watch_blocking(library: &ImageLibrary, options: &WatcherOptions, cancel: &CancellationToken) {
    let folder = library.folder().to_path_buf();
    let mut retry = Backoff::new(options.retry_initial, options.retry_max);

    'session: while !cancel.is_cancelled() {
        let Some(identity) = folder_identity(&folder) else {
            rescan(library, "folder-missing");
            let delay = retry.next_delay();
            debug!(
                folder = %folder.display(),
                retry_in = %humantime::format_duration(delay),
                "image folder not available"
            );
            if !blocking_pause(cancel, delay, options.poll_timeout) {
                break;
            }
            continue;
        };

        let session = match WatchSession::start(&folder) {
            Ok(session) => {
                info!(watching = %folder.display(), "notify watcher initialized");
                retry.reset();
                Some(session)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    interval = %humantime::format_duration(options.rescan_interval),
                    "change notification unavailable; falling back to periodic rescans"
                );
                None
            }
        };

        // Catch up on anything that changed while nothing was watching.
        rescan(library, "watch-established");
        let mut last_rescan = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break 'session;
            }

            match &session {
                Some(session) => {
                    match session
                        .pump
                        .wait_batch(options.poll_timeout, options.settle_delay)
                    {
                        Batch::Changes { events, errors } => {
                            debug!(events = events.len(), errors, "coalesced change batch");
                            rescan(library, "notify");
                            last_rescan = Instant::now();
                        }
                        Batch::Quiet | Batch::Timeout => {}
                        Batch::Disconnected => {
                            warn!("notify backend disconnected; re-establishing watch");
                            continue 'session;
                        }
                    }
                }
                None => {
                    if !blocking_pause(cancel, options.poll_timeout, options.poll_timeout) {
                        break 'session;
                    }
                }
            }

            if last_rescan.elapsed() >= options.rescan_interval {
                rescan(library, "periodic");
                last_rescan = Instant::now();
                if session.is_none() {
                    // Try native notification again.
                    continue 'session;
                }
            }

            if folder_identity(&folder) != Some(identity) {
                info!(folder = %folder.display(), "image folder replaced or removed; re-establishing watch");
                continue 'session;
            }
        }
    }
}
