//! Kernel change notifications for watched directories.
//!
//! Each send-only or latest descriptor is watched non-recursively.
//! Raw notify events are collapsed into the three kinds the controller
//! cares about: updated (write finished, file closed or moved in),
//! modified (write seen, file still open), deleted (removed or renamed
//! away). Delete events are only forwarded for descriptors whose delete
//! policy applies them.

use anyhow::{Context, Result};
use bitflags::bitflags;
use notify::event::{AccessKind, AccessMode, CreateKind, EventKind, ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::paths::{DeleteMode, PathRegistry};

bitflags! {
    /// Change kinds observed for one file in one notification batch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Changes: u8 {
        const UPDATED  = 1 << 0;
        const MODIFIED = 1 << 1;
        const DELETED  = 1 << 2;
    }
}

/// One change notification handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// The watched directory the file lives in.
    pub watched_path: PathBuf,
    /// Absolute path of the changed file.
    pub path: PathBuf,
    pub changes: Changes,
}

/// Keeps the underlying kernel watches alive.
pub struct FileWatcher {
    _watcher: notify::RecommendedWatcher,
    pub watched: usize,
}

/// Subscribe to change notifications for every sendable descriptor.
///
/// Events arrive on `tx` from the notify backend thread. Descriptors in
/// receive-only mode are not watched at all.
pub fn spawn(registry: &PathRegistry, tx: mpsc::UnboundedSender<FileEvent>) -> Result<FileWatcher> {
    // policy snapshot for the callback: watched dir -> forward deletes?
    let dirs: HashMap<PathBuf, bool> = registry
        .iter()
        .filter(|w| w.path_mode.can_send())
        .map(|w| (w.path.clone(), w.delete_mode == DeleteMode::Apply))
        .collect();
    let lookup = dirs.clone();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "filesystem watcher error");
                return;
            }
        };
        for (path, changes) in classify(&event) {
            let Some(watched_path) = path.parent().map(Path::to_path_buf) else {
                continue;
            };
            let Some(apply_deletes) = lookup.get(&watched_path) else {
                continue;
            };
            let mut changes = changes;
            if !apply_deletes {
                changes.remove(Changes::DELETED);
            }
            if changes.is_empty() {
                continue;
            }
            let _ = tx.send(FileEvent {
                watched_path,
                path,
                changes,
            });
        }
    })
    .context("cannot create filesystem watcher")?;

    let mut watched = 0;
    for (dir, _) in &dirs {
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => watched += 1,
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "cannot watch directory; its files will not be replicated"
                );
            }
        }
    }
    tracing::info!(
        configured = dirs.len(),
        watching = watched,
        "directory change notifications registered"
    );

    Ok(FileWatcher {
        _watcher: watcher,
        watched,
    })
}

/// Map a notify event onto per-path change sets.
fn classify(event: &notify::Event) -> Vec<(PathBuf, Changes)> {
    match event.kind {
        // a rename within the tree deletes the source name and settles
        // the destination name in a single event
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![
                (event.paths[0].clone(), Changes::DELETED),
                (event.paths[1].clone(), Changes::UPDATED),
            ]
        }
        kind => {
            let changes = match kind {
                EventKind::Access(AccessKind::Close(AccessMode::Write)) => Changes::UPDATED,
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Changes::UPDATED,
                EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
                    Changes::MODIFIED
                }
                EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                    Changes::MODIFIED
                }
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    Changes::DELETED
                }
                _ => Changes::empty(),
            };
            if changes.is_empty() {
                Vec::new()
            } else {
                event
                    .paths
                    .iter()
                    .map(|p| (p.clone(), changes))
                    .collect()
            }
        }
    }
}
