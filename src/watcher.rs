use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use notify::{Config, RecommendedWatcher, Watcher};

use crate::worker::Message;

const DEBOUNCE_MS: u64 = 500;

/// Coalesces bursts of filesystem events per directory: a directory is only
/// reported once it has been quiet for the debounce window.
pub struct DebounceState {
    pending: Arc<Mutex<HashMap<PathBuf, Instant>>>,
    delay: Duration,
}

impl DebounceState {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            delay: Duration::from_millis(debounce_ms),
        }
    }

    /// Records a fresh event for the directory.
    pub fn touch(&self, dir: &Path) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(dir.to_path_buf(), Instant::now());
        }
    }

    /// True once the directory has been quiet for the full window; the entry
    /// is consumed so the next burst starts over.
    pub fn ready(&self, dir: &Path) -> bool {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(&last) = pending.get(dir) {
                if last.elapsed() >= self.delay {
                    pending.remove(dir);
                    return true;
                }
            }
        }
        false
    }

    pub fn clear(&self, dir: &Path) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(dir);
        }
    }
}

/// Watches tracked folder roots and every subdirectory the scanner
/// encounters, posting debounced `DirectoryChanged` messages to the engine.
pub struct FolderWatch {
    watcher: RecommendedWatcher,
    watched: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FolderWatch {
    pub fn new(engine_tx: Sender<Message>) -> Result<Self> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let config = Config::default().with_poll_interval(Duration::from_secs(2));
        let watcher = RecommendedWatcher::new(raw_tx, config)?;
        let watched: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));
        let debounce = Arc::new(DebounceState::new(DEBOUNCE_MS));

        let watched_for_thread = watched.clone();
        std::thread::spawn(move || {
            for res in raw_rx {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("filesystem watch error: {e}");
                        continue;
                    }
                };
                for path in &event.paths {
                    let Some(dir) = watched_dir(&watched_for_thread, path) else {
                        continue;
                    };
                    debounce.touch(&dir);

                    let tx = engine_tx.clone();
                    let debounce = debounce.clone();
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(DEBOUNCE_MS + 50));
                        if debounce.ready(&dir) {
                            log::debug!("directory changed: {}", dir.display());
                            let _ = tx.send(Message::DirectoryChanged { path: dir });
                        }
                    });
                }
            }
        });

        Ok(Self { watcher, watched })
    }

    pub fn add_path(&mut self, path: &Path) -> bool {
        if let Ok(set) = self.watched.lock() {
            if set.contains(path) {
                return true;
            }
        }
        match self.watcher.watch(path, notify::RecursiveMode::NonRecursive) {
            Ok(()) => {
                if let Ok(mut set) = self.watched.lock() {
                    set.insert(path.to_path_buf());
                }
                true
            }
            Err(e) => {
                log::warn!("cannot watch {}: {e}", path.display());
                false
            }
        }
    }

    pub fn remove_path(&mut self, path: &Path) -> bool {
        if let Ok(mut set) = self.watched.lock() {
            set.remove(path);
        }
        match self.watcher.unwatch(path) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("cannot unwatch {}: {e}", path.display());
                false
            }
        }
    }
}

/// Maps an event path to the watched directory it belongs to: the path itself
/// when a watched directory changed, otherwise its parent.
fn watched_dir(watched: &Arc<Mutex<HashSet<PathBuf>>>, path: &Path) -> Option<PathBuf> {
    let set = watched.lock().ok()?;
    if set.contains(path) {
        return Some(path.to_path_buf());
    }
    let parent = path.parent()?;
    if set.contains(parent) {
        return Some(parent.to_path_buf());
    }
    None
}
