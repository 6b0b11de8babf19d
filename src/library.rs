//! The shared, copy-on-write list of displayable images.
//!
//! [`ImageLibrary`] is the only state the folder watcher and the display loop
//! share. Rescans build a complete new [`ImageListSnapshot`] off to the side
//! and swap it in together with the one-shot "updated" flag under a single
//! short lock, so readers either see the old list or the new one.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::LibraryError;

/// Immutable, lexicographically sorted image file names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageListSnapshot {
    names: Vec<String>,
}

impl ImageListSnapshot {
    /// Sorts `names`; the caller is responsible for filtering.
    pub fn new(mut names: Vec<String>) -> Self {
        names.sort();
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Deref for ImageListSnapshot {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.names
    }
}

/// Result of a [`ImageLibrary::rescan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanOutcome {
    /// A different list was published; `len` is its size.
    Changed { len: usize },
    Unchanged,
}

/// Returns `true` if `path` has one of `extensions` (lowercase, no dot).
pub fn is_supported_image(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            extensions.iter().any(|e| *e == ext)
        })
}

#[derive(Debug)]
struct Published {
    snapshot: Arc<ImageListSnapshot>,
    updated: bool,
}

#[derive(Debug)]
struct LibraryInner {
    folder: PathBuf,
    extensions: Vec<String>,
    published: Mutex<Published>,
    rescan_gate: Mutex<()>,
    changed: Notify,
}

/// Cheaply cloneable handle to the shared image list.
#[derive(Debug, Clone)]
pub struct ImageLibrary {
    inner: Arc<LibraryInner>,
}

impl ImageLibrary {
    /// Creates a library with an empty snapshot. Call [`rescan`](Self::rescan) to populate it.
    pub fn new(folder: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            inner: Arc::new(LibraryInner {
                folder: folder.into(),
                extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
                published: Mutex::new(Published {
                    snapshot: Arc::new(ImageListSnapshot::default()),
                    updated: false,
                }),
                rescan_gate: Mutex::new(()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.inner.folder
    }

    /// Full path of `name` inside the image folder.
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.inner.folder.join(name)
    }

    /// The current snapshot. Never blocks on a rescan in progress.
    pub fn current_snapshot(&self) -> Arc<ImageListSnapshot> {
        self.published().snapshot.clone()
    }

    /// Consumes the one-shot "updated" flag, returning whether it was set.
    pub fn take_updated(&self) -> bool {
        std::mem::take(&mut self.published().updated)
    }

    /// Resolves once a rescan published a new snapshot since the last wake.
    pub async fn changed(&self) {
        self.inner.changed.notified().await
    }

    /// Lists the folder and publishes the result if it differs from the current snapshot.
    ///
    /// Blocking. Concurrent callers are serialized. A missing folder publishes
    /// an empty list; other listing failures keep the previous snapshot.
    pub fn rescan(&self) -> Result<RescanOutcome, LibraryError> {
        let _gate = self
            .inner
            .rescan_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let listed = self.list_folder()?;
        let candidate = ImageListSnapshot::new(listed);

        let len = candidate.len();
        {
            let mut published = self.published();
            if *published.snapshot == candidate {
                return Ok(RescanOutcome::Unchanged);
            }
            published.snapshot = Arc::new(candidate);
            published.updated = true;
        }
        self.inner.changed.notify_one();
        info!(count = len, folder = %self.inner.folder.display(), "image list updated");
        Ok(RescanOutcome::Changed { len })
    }

    fn list_folder(&self) -> Result<Vec<String>, LibraryError> {
        let folder = &self.inner.folder;
        match std::fs::metadata(folder) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(LibraryError::NotADirectory {
                    path: folder.clone(),
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(folder = %folder.display(), "image folder missing; treating as empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(LibraryError::Io {
                    path: folder.clone(),
                    source,
                });
            }
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    return Err(LibraryError::Walk {
                        path: folder.clone(),
                        source: err,
                    });
                }
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || !is_supported_image(entry.path(), &self.inner.extensions)
            {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) => names.push(name.to_string()),
                None => debug!(path = %entry.path().display(), "skipping non UTF-8 file name"),
            }
        }
        Ok(names)
    }

    fn published(&self) -> MutexGuard<'_, Published> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
