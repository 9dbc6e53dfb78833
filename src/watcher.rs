// src/watcher.rs
use crate::config::AppConfig;
use crate::event::{ChangeEvent, ChangeKind};
use anyhow::Result;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher as NotifyWatcherTrait}; // For .watch()
use notify_debouncer_full::{new_debouncer, DebouncedEvent};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, info, warn};

/// Decides which filesystem changes are allowed to trigger a rebuild.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    roots: Vec<PathBuf>,
    output_dir: Option<PathBuf>,
    ignore_dotfiles: bool,
}

impl ChangeFilter {
    /// `roots` are the watched paths; dot-segments are only checked below them.
    pub fn new(roots: Vec<PathBuf>, ignore_dotfiles: bool) -> Self {
        Self {
            roots,
            output_dir: None,
            ignore_dotfiles,
        }
    }

    /// Drops every change inside `dir`, so writing the site never retriggers a build.
    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    pub fn accepts(&self, path: &Path) -> bool {
        if let Some(output_dir) = &self.output_dir {
            if path.starts_with(output_dir) {
                return false;
            }
        }
        if self.ignore_dotfiles && self.has_dot_segment(path) {
            return false;
        }
        true
    }

    fn has_dot_segment(&self, path: &Path) -> bool {
        let relative = self
            .roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);
        relative.components().any(|c| match c {
            Component::Normal(name) => name.to_string_lossy().starts_with('.'),
            _ => false,
        })
    }
}

/// Best-effort absolute form of `path`, used to compare against event paths.
fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// Runs the file system watcher in a background thread.
///
/// This function spawns a new thread that sets up a debounced file system watcher
/// for the paths in `AppConfig`. Accepted changes are sent as `ChangeEvent`s
/// through the provided Tokio mpsc channel.
///
/// Directories are watched recursively and single files non-recursively.
/// Paths that do not exist are skipped with a warning.
///
/// # Errors
///
/// Returns an error only if the thread cannot be spawned.
pub async fn run_watcher(app_config: Arc<AppConfig>, event_tx: Sender<ChangeEvent>) -> Result<()> {
    let roots: Vec<PathBuf> = app_config
        .watch_paths
        .iter()
        .map(|p| absolute(Path::new(p)))
        .collect();
    let filter = ChangeFilter::new(roots.clone(), app_config.ignore_dotfiles)
        .with_output_dir(absolute(&app_config.site_dir));
    let debounce = app_config.debounce;

    std::thread::Builder::new()
        .name("sitewatch-watcher".to_string())
        .spawn(move || {
            let (debouncer_internal_tx, debouncer_internal_rx) = std::sync::mpsc::channel();

            // The debouncer lives as long as this thread.
            let mut debouncer = match new_debouncer(debounce, None, debouncer_internal_tx) {
                Ok(d) => d,
                Err(e) => {
                    error!("[WatcherThread] Failed to create debouncer: {}", e);
                    return;
                }
            };

            for path in &roots {
                if !path.exists() {
                    warn!(
                        "[WatcherThread] Path does not exist, skipping: {}",
                        path.display()
                    );
                    continue;
                }
                let mode = if path.is_dir() {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                match debouncer.watcher().watch(path, mode) {
                    Ok(_) => info!("[WatcherThread] Watching: {}", path.display()),
                    Err(e) => error!(
                        "[WatcherThread] Failed to watch {}: {}",
                        path.display(),
                        e
                    ),
                }
                debouncer.cache().add_root(path, mode);
            }

            info!("[WatcherThread] File system watcher thread started for {:?}", roots);

            loop {
                match debouncer_internal_rx.recv() {
                    Ok(Ok(events)) => {
                        for debounced_event in events {
                            if !handle_debounced_event(&debounced_event, &filter, &event_tx) {
                                info!("[WatcherThread] Change receiver dropped. Exiting.");
                                return;
                            }
                        }
                    }
                    Ok(Err(errors)) => {
                        for error in errors {
                            error!("[WatcherThread] Debouncer reported error: {:?}", error);
                        }
                    }
                    Err(e) => {
                        // The debouncer dropped its sender.
                        error!("[WatcherThread] Debouncer internal channel error: {:?}. Watcher thread exiting.", e);
                        break;
                    }
                }
            }
        })?;

    Ok(())
}

/// Maps a notify event kind to a [`ChangeKind`]. Access and other
/// non-mutating kinds map to `None`.
pub fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Some(ChangeKind::Rename),
        EventKind::Modify(_) => Some(ChangeKind::Write),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        _ => None,
    }
}

/// Filters one debounced event and forwards it to the build loop.
///
/// Returns `false` once the receiving side is gone.
fn handle_debounced_event(
    debounced_event: &DebouncedEvent,
    filter: &ChangeFilter,
    event_tx: &Sender<ChangeEvent>,
) -> bool {
    let Some(op) = change_kind(&debounced_event.kind) else {
        debug!(
            "[WatcherThread] Ignored event kind {:?} for {:?}",
            debounced_event.kind, debounced_event.paths
        );
        return true;
    };

    // A rename carries both paths; either side being accepted is enough.
    let Some(path) = debounced_event.paths.iter().find(|p| filter.accepts(p)) else {
        debug!("[WatcherThread] Filtered out: {:?}", debounced_event.paths);
        return true;
    };

    let event = ChangeEvent {
        path: path.to_string_lossy().to_string(),
        op,
    };
    debug!("[WatcherThread] Produced event: {:?}", event);

    // Blocking send: this runs on a plain std thread.
    event_tx.blocking_send(event).is_ok()
}
