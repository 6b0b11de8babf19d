use std::path::PathBuf;

use crate::error::RenderStage;
use crate::tasks::slideshow::LoopState;

/// Kind of a directory-level change seen by the folder watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Deleted,
    Renamed,
    WriteComplete,
}

/// One filesystem change. Only used to decide when to rescan; never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

/// Published by the display loop for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlideshowEvent {
    StateChanged { from: LoopState, to: LoopState },
    Displayed { name: String, index: usize },
    /// The image vanished before it could be shown.
    Skipped { name: String },
    Failed { name: String, stage: FailureStage },
}

/// Where a recoverable per-image failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Render(RenderStage),
    Refresh,
}
