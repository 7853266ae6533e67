//! Filesystem watch over the module and its extra watch paths.
//!
//! Files are watched through their parent directory so editors that replace
//! files on save are still seen; events are then filtered to the file itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event as FsEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::state::WatcherEvent;

use super::Event;

/// Debounced watch; dropping it closes the watch.
pub(crate) struct SourceWatch {
    _watcher: RecommendedWatcher,
    debounce: JoinHandle<()>,
}

/// What a watched path reacts to.
#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Directory(PathBuf),
}

impl Target {
    fn new(path: &Path) -> Self {
        if path.is_dir() {
            Target::Directory(path.to_path_buf())
        } else {
            Target::File(path.to_path_buf())
        }
    }

    fn matches(&self, changed: &Path) -> bool {
        match self {
            Target::File(file) => changed == file,
            Target::Directory(dir) => changed.starts_with(dir),
        }
    }

    fn watch_root(&self) -> (&Path, RecursiveMode) {
        match self {
            Target::File(file) => (
                file.parent().unwrap_or(Path::new(".")),
                RecursiveMode::NonRecursive,
            ),
            Target::Directory(dir) => (dir, RecursiveMode::Recursive),
        }
    }
}

/// Only additions, modifications and removals count as changes.
///
/// Opening or reading a file (as every worker does on load) is not one.
fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

impl SourceWatch {
    /// Watch `paths`, reporting changes as [`WatcherEvent::Changed`] once
    /// `debounce` has passed without further changes.
    ///
    /// Paths that cannot be watched are logged and skipped. Must be called
    /// from within a tokio runtime.
    pub(crate) fn start(
        paths: &[PathBuf],
        debounce: Duration,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self> {
        let targets: Arc<Vec<Target>> = Arc::new(paths.iter().map(|p| Target::new(p)).collect());
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();

        let filter = Arc::clone(&targets);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<FsEvent>| {
            match result {
                Ok(event) => {
                    let relevant = is_change(&event.kind)
                        && event
                            .paths
                            .iter()
                            .any(|path| filter.iter().any(|target| target.matches(path)));
                    if relevant {
                        let _ = changes_tx.send(());
                    }
                }
                Err(e) => tracing::warn!("File watch error: {}", e),
            }
        })
        .map_err(|e| Error::Watch(e.to_string()))?;

        for target in targets.iter() {
            let (root, mode) = target.watch_root();
            if let Err(e) = watcher.watch(root, mode) {
                tracing::warn!(path = %root.display(), "Cannot watch path: {}", e);
            }
        }

        Ok(Self {
            _watcher: watcher,
            debounce: tokio::spawn(debounce_changes(changes_rx, debounce, events)),
        })
    }
}

impl Drop for SourceWatch {
    fn drop(&mut self) {
        self.debounce.abort();
    }
}

/// Collapse bursts of raw changes into one event after a quiet period.
async fn debounce_changes(
    mut changes: mpsc::UnboundedReceiver<()>,
    window: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    while changes.recv().await.is_some() {
        loop {
            match tokio::time::timeout(window, changes.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        if events.send(Event::Watcher(WatcherEvent::Changed)).is_err() {
            return;
        }
    }
}
