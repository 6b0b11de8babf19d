use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use rust_folder_frame::canvas::{Canvas, PixelFormat};
use rust_folder_frame::config::{DEFAULT_EXTENSIONS, WatcherOptions};
use rust_folder_frame::error::{DeviceError, RenderStage};
use rust_folder_frame::events::{FailureStage, SlideshowEvent};
use rust_folder_frame::library::ImageLibrary;
use rust_folder_frame::platform::device::{DeviceCapabilities, DeviceSink, RefreshReport};
use rust_folder_frame::platform::panel::{PagedPanelSink, PanelDriver};
use rust_folder_frame::render::Renderer;
use rust_folder_frame::tasks::files;
use rust_folder_frame::tasks::slideshow::{LoopSettings, LoopState, Slideshow, SlideshowStats};
use tempfile::tempdir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Refresh(Vec<u8>),
    Sleep,
    Wake,
}

/// In-memory device that records every call.
struct RecordingSink {
    caps: DeviceCapabilities,
    ops: Arc<Mutex<Vec<Op>>>,
    failing_refreshes: usize,
    refresh_delay: Duration,
    on_wake: Option<Box<dyn FnMut() + Send>>,
    asleep: bool,
}

impl RecordingSink {
    fn new(supports_sleep: bool) -> (Self, Arc<Mutex<Vec<Op>>>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let sink = Self {
            caps: DeviceCapabilities {
                name: "recorder".into(),
                width: 8,
                height: 4,
                format: PixelFormat::Rgb888,
                background: [0, 0, 0],
                supports_sleep,
                refresh_latency_hint: Duration::ZERO,
            },
            ops: ops.clone(),
            failing_refreshes: 0,
            refresh_delay: Duration::ZERO,
            on_wake: None,
            asleep: false,
        };
        (sink, ops)
    }
}

impl DeviceSink for RecordingSink {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn refresh(&mut self, canvas: &Canvas) -> Result<RefreshReport, DeviceError> {
        if self.asleep {
            return Err(DeviceError::Asleep {
                device: self.caps.name.clone(),
            });
        }
        if self.failing_refreshes > 0 {
            self.failing_refreshes -= 1;
            return Err(DeviceError::Io {
                device: self.caps.name.clone(),
                source: std::io::Error::other("bus timeout"),
            });
        }
        std::thread::sleep(self.refresh_delay);
        self.ops
            .lock()
            .unwrap()
            .push(Op::Refresh(canvas.as_bytes().to_vec()));
        Ok(RefreshReport {
            latency: Duration::from_millis(1),
            bytes: canvas.as_bytes().len(),
        })
    }

    fn sleep(&mut self) -> Result<(), DeviceError> {
        if !self.caps.supports_sleep {
            return Err(DeviceError::SleepUnsupported {
                device: self.caps.name.clone(),
            });
        }
        self.asleep = true;
        self.ops.lock().unwrap().push(Op::Sleep);
        Ok(())
    }

    fn wake(&mut self) -> Result<(), DeviceError> {
        self.asleep = false;
        self.ops.lock().unwrap().push(Op::Wake);
        if let Some(hook) = self.on_wake.as_mut() {
            hook();
        }
        Ok(())
    }
}

fn extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

fn write_png(dir: &Path, name: &str, color: [u8; 3]) {
    RgbImage::from_pixel(8, 4, Rgb(color))
        .save(dir.join(name))
        .unwrap();
}

fn settings(dwell: Duration) -> LoopSettings {
    LoopSettings {
        dwell,
        wait_slice: Duration::from_millis(5),
        idle_poll: Duration::from_millis(20),
        error_backoff: Duration::from_millis(10),
        sleep_between_images: true,
    }
}

fn start<D: DeviceSink>(
    library: &ImageLibrary,
    device: D,
    settings: LoopSettings,
) -> (
    broadcast::Receiver<SlideshowEvent>,
    JoinHandle<anyhow::Result<SlideshowStats>>,
    CancellationToken,
) {
    let renderer = Renderer::new(device.capabilities().render_target(None, false));
    let show = Slideshow::new(library.clone(), device, renderer, settings);
    let events = show.subscribe();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(show.run(cancel.clone()));
    (events, handle, cancel)
}

/// Collects events until `done` returns true on one of them.
async fn collect_until(
    events: &mut broadcast::Receiver<SlideshowEvent>,
    mut done: impl FnMut(&SlideshowEvent) -> bool,
) -> Vec<SlideshowEvent> {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let stop = done(&event);
                    seen.push(event);
                    if stop {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("slideshow did not produce the expected events in time");
    seen
}

fn displayed(events: &[SlideshowEvent]) -> Vec<(String, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            SlideshowEvent::Displayed { name, index } => Some((name.clone(), *index)),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycles_through_images_and_wraps_around() {
    let dir = tempdir().unwrap();
    write_png(dir.path(), "a.png", [255, 0, 0]);
    write_png(dir.path(), "b.png", [0, 255, 0]);
    write_png(dir.path(), "c.png", [0, 0, 255]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (sink, ops) = RecordingSink::new(false);
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_millis(10)));

    let mut count = 0;
    let seen = collect_until(&mut events, |e| {
        if matches!(e, SlideshowEvent::Displayed { .. }) {
            count += 1;
        }
        count == 6
    })
    .await;
    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();

    let order: Vec<_> = displayed(&seen).into_iter().map(|(n, _)| n).collect();
    assert_eq!(order, ["a.png", "b.png", "c.png", "a.png", "b.png", "c.png"]);
    assert!(stats.shown >= 6);
    assert_eq!(stats.errors, 0);

    let ops = ops.lock().unwrap();
    match &ops[0] {
        Op::Refresh(frame) => {
            assert_eq!(frame.len(), 8 * 4 * 3);
            assert_eq!(&frame[..3], &[255, 0, 0]);
        }
        other => panic!("expected a refresh, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vanished_file_is_skipped_without_losing_the_dwell_slot() {
    let dir = tempdir().unwrap();
    for name in ["a.png", "b.png", "c.png"] {
        write_png(dir.path(), name, [10, 20, 30]);
    }
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();
    // Removed behind the library's back; nothing rescans until the loop notices.
    fs::remove_file(dir.path().join("b.png")).unwrap();

    let dwell = Duration::from_millis(800);
    let (sink, _ops) = RecordingSink::new(false);
    let (mut events, handle, cancel) = start(&library, sink, settings(dwell));

    let mut first_shown = None;
    let seen = collect_until(&mut events, |e| match e {
        SlideshowEvent::Displayed { name, .. } if name == "a.png" => {
            first_shown = Some(Instant::now());
            false
        }
        SlideshowEvent::Displayed { name, .. } => name == "c.png",
        _ => false,
    })
    .await;
    let gap = first_shown.unwrap().elapsed();
    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert!(seen.contains(&SlideshowEvent::Skipped {
        name: "b.png".into()
    }));
    assert_eq!(
        displayed(&seen),
        [("a.png".to_string(), 0), ("c.png".to_string(), 1)]
    );
    assert!(
        gap < dwell * 2,
        "the skip must not start a new dwell period (took {gap:?})"
    );
    assert_eq!(stats.skipped, 1);
    assert_eq!(library.current_snapshot().names(), ["a.png", "c.png"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_removed_after_existence_check_is_skipped_from_waiting() {
    let dir = tempdir().unwrap();
    write_png(dir.path(), "a.png", [1, 1, 1]);
    write_png(dir.path(), "b.png", [2, 2, 2]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    // Waking happens after the existence check and before the decode.
    let (mut sink, _ops) = RecordingSink::new(true);
    let doomed = dir.path().join("b.png");
    sink.on_wake = Some(Box::new(move || {
        let _ = fs::remove_file(&doomed);
    }));
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_millis(10)));
    let seen = collect_until(&mut events, |e| matches!(e, SlideshowEvent::Skipped { .. })).await;
    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(
        &seen[seen.len() - 2..],
        [
            SlideshowEvent::StateChanged {
                from: LoopState::Rendering,
                to: LoopState::Waiting
            },
            SlideshowEvent::Skipped {
                name: "b.png".into()
            },
        ]
    );
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn image_added_during_refresh_is_shown_next() {
    let dir = tempdir().unwrap();
    write_png(dir.path(), "a.png", [1, 1, 1]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (mut sink, _ops) = RecordingSink::new(false);
    sink.refresh_delay = Duration::from_millis(400);
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_millis(10)));

    collect_until(&mut events, |e| {
        matches!(
            e,
            SlideshowEvent::StateChanged {
                to: LoopState::AwaitingRefresh,
                ..
            }
        )
    })
    .await;
    write_png(dir.path(), "b.png", [2, 2, 2]);
    library.rescan().unwrap();

    let mut count = 0;
    let seen = collect_until(&mut events, |e| {
        if matches!(e, SlideshowEvent::Displayed { .. }) {
            count += 1;
        }
        count == 2
    })
    .await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(
        displayed(&seen),
        [("a.png".to_string(), 0), ("b.png".to_string(), 1)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emptied_folder_returns_loop_to_idle() {
    let dir = tempdir().unwrap();
    write_png(dir.path(), "a.png", [1, 1, 1]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (sink, ops) = RecordingSink::new(false);
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_secs(60)));
    // Shown, then dwelling.
    collect_until(&mut events, |e| {
        matches!(
            e,
            SlideshowEvent::StateChanged {
                from: LoopState::AwaitingRefresh,
                to: LoopState::Waiting
            }
        )
    })
    .await;

    fs::remove_file(dir.path().join("a.png")).unwrap();
    library.rescan().unwrap();
    let seen = collect_until(&mut events, |e| {
        matches!(
            e,
            SlideshowEvent::StateChanged {
                to: LoopState::Idle,
                ..
            }
        )
    })
    .await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(
        seen.last(),
        Some(&SlideshowEvent::StateChanged {
            from: LoopState::Waiting,
            to: LoopState::Idle
        })
    );
    assert_eq!(ops.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shrinking_list_restarts_from_first_image() {
    let dir = tempdir().unwrap();
    for name in ["a.png", "b.png", "c.png"] {
        write_png(dir.path(), name, [4, 5, 6]);
    }
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (sink, _ops) = RecordingSink::new(false);
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_millis(500)));
    // Once b.png is up, c.png (index 2) is next.
    collect_until(&mut events, |e| {
        matches!(e, SlideshowEvent::Displayed { name, .. } if name == "b.png")
    })
    .await;

    fs::remove_file(dir.path().join("b.png")).unwrap();
    fs::remove_file(dir.path().join("c.png")).unwrap();
    library.rescan().unwrap();
    let seen = collect_until(&mut events, |e| {
        matches!(e, SlideshowEvent::Displayed { .. })
    })
    .await;
    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(displayed(&seen), [("a.png".to_string(), 0)]);
    assert_eq!(stats.skipped, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_folder_stays_idle_until_an_image_arrives() {
    let dir = tempdir().unwrap();
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(files::run(
        library.clone(),
        WatcherOptions {
            poll_timeout: Duration::from_millis(50),
            settle_delay: Duration::from_millis(20),
            rescan_interval: Duration::from_millis(200),
            ..WatcherOptions::default()
        },
        cancel.clone(),
    ));

    let (sink, ops) = RecordingSink::new(false);
    let (mut events, handle, show_cancel) =
        start(&library, sink, settings(Duration::from_millis(10)));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(ops.lock().unwrap().is_empty());
    assert!(events.try_recv().is_err(), "an empty list must not leave Idle");

    write_png(dir.path(), "new.png", [1, 2, 3]);
    let seen = collect_until(&mut events, |e| {
        matches!(e, SlideshowEvent::Displayed { .. })
    })
    .await;

    show_cancel.cancel();
    cancel.cancel();
    handle.await.unwrap().unwrap();
    watcher.await.unwrap().unwrap();

    assert_eq!(
        seen.first(),
        Some(&SlideshowEvent::StateChanged {
            from: LoopState::Idle,
            to: LoopState::Waiting
        })
    );
    assert!(seen.contains(&SlideshowEvent::StateChanged {
        from: LoopState::Waiting,
        to: LoopState::Rendering
    }));
    assert_eq!(displayed(&seen), [("new.png".to_string(), 0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_image_is_skipped_and_counted() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("bad.png"), b"definitely not a png").unwrap();
    write_png(dir.path(), "good.png", [9, 9, 9]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (sink, _ops) = RecordingSink::new(false);
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_millis(10)));
    let seen = collect_until(&mut events, |e| {
        matches!(e, SlideshowEvent::Displayed { name, .. } if name == "good.png")
    })
    .await;
    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert!(seen.contains(&SlideshowEvent::Failed {
        name: "bad.png".into(),
        stage: FailureStage::Render(RenderStage::Decode),
    }));
    assert!(stats.errors >= 1);
    // Bad files are never deleted; the folder belongs to the uploader.
    assert!(dir.path().join("bad.png").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_failure_advances_and_retries_next_cycle() {
    let dir = tempdir().unwrap();
    write_png(dir.path(), "a.png", [1, 1, 1]);
    write_png(dir.path(), "b.png", [2, 2, 2]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (mut sink, ops) = RecordingSink::new(false);
    sink.failing_refreshes = 1;
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_millis(10)));
    let seen = collect_until(&mut events, |e| {
        matches!(e, SlideshowEvent::Displayed { name, .. } if name == "a.png")
    })
    .await;
    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(
        seen.iter()
            .find(|e| matches!(e, SlideshowEvent::Failed { .. }))
            .cloned(),
        Some(SlideshowEvent::Failed {
            name: "a.png".into(),
            stage: FailureStage::Refresh,
        })
    );
    assert_eq!(displayed(&seen)[0], ("b.png".to_string(), 1));
    assert_eq!(stats.errors, 1);
    assert!(ops.lock().unwrap().len() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sleep_capable_device_sleeps_between_images_and_wakes_first() {
    let dir = tempdir().unwrap();
    write_png(dir.path(), "a.png", [1, 1, 1]);
    write_png(dir.path(), "b.png", [2, 2, 2]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (sink, ops) = RecordingSink::new(true);
    let (mut events, handle, cancel) = start(&library, sink, settings(Duration::from_millis(10)));
    let mut count = 0;
    collect_until(&mut events, |e| {
        if matches!(e, SlideshowEvent::Displayed { .. }) {
            count += 1;
        }
        count == 2
    })
    .await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let ops = ops.lock().unwrap();
    let kinds: Vec<&str> = ops
        .iter()
        .take(5)
        .map(|op| match op {
            Op::Refresh(_) => "refresh",
            Op::Sleep => "sleep",
            Op::Wake => "wake",
        })
        .collect();
    assert_eq!(kinds, ["refresh", "sleep", "wake", "refresh", "sleep"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_puts_sleep_capable_device_to_sleep() {
    let dir = tempdir().unwrap();
    write_png(dir.path(), "a.png", [1, 1, 1]);
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let (sink, ops) = RecordingSink::new(true);
    let mut loop_settings = settings(Duration::from_secs(60));
    loop_settings.sleep_between_images = false;
    let (mut events, handle, cancel) = start(&library, sink, loop_settings);
    collect_until(&mut events, |e| {
        matches!(e, SlideshowEvent::Displayed { .. })
    })
    .await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let ops = ops.lock().unwrap();
    assert!(matches!(ops[0], Op::Refresh(_)));
    assert_eq!(ops.last(), Some(&Op::Sleep));
    assert_eq!(ops.len(), 2);
}

#[derive(Default)]
struct FakePanel {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PanelDriver for FakePanel {
    fn init(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn display(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn supports_sleep(&self) -> bool {
        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paged_panel_receives_packed_palette_frames() {
    let dir = tempdir().unwrap();
    // 2:1 source on a 6x2 panel leaves white bars left and right.
    RgbImage::from_pixel(4, 2, Rgb([0, 0, 0]))
        .save(dir.path().join("black.png"))
        .unwrap();
    let library = ImageLibrary::new(dir.path(), &extensions());
    library.rescan().unwrap();

    let driver = FakePanel::default();
    let frames = driver.frames.clone();
    let panel =
        PagedPanelSink::with_geometry(driver, "fake".into(), 6, 2, Duration::from_secs(1)).unwrap();
    let (mut events, handle, cancel) = start(&library, panel, settings(Duration::from_secs(60)));
    collect_until(&mut events, |e| {
        matches!(e, SlideshowEvent::Displayed { .. })
    })
    .await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    // Two pixels per byte: white, black | black, black | black, white per row.
    assert_eq!(frames[0], vec![0x10, 0x00, 0x01, 0x10, 0x00, 0x01]);
}
