//! Process-wide registry of files currently offered for pull.
//!
//! Every offered file carries a random 32-bit transfer id drawn from the
//! OS entropy pool. Re-offering a file regenerates its id, so a receiver
//! acting on a stale announcement can never pull a newer version than the
//! one it was told about; its request simply fails to match.

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::cell::RefCell;
use std::time::SystemTime;

/// Captured `stat` fields for an offered file.
#[derive(Debug, Clone, Copy)]
pub struct StatSnapshot {
    pub size: u64,
    pub mode: u32,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub uid: u32,
    pub gid: u32,
}

impl StatSnapshot {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            size: meta.len(),
            mode: meta.mode(),
            mtime_sec: meta.mtime().max(0) as u64,
            mtime_nsec: meta.mtime_nsec().max(0) as u64,
            uid: meta.uid(),
            gid: meta.gid(),
        }
    }

    fn capture(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&meta))
    }
}

/// One locally offered file.
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub filename: PathBuf,
    pub id: u32,
    pub stat: StatSnapshot,
    pub last_updated: SystemTime,
    pub start_sharing: SystemTime,
    /// Set while the record reflects a file we just published from a
    /// transfer; the next matching change notification is our own rename.
    just_received: bool,
}

/// Map from transfer id to shared file. Ids are unique at any instant;
/// an id freed by removal may be handed out again later.
///
/// The registry lives on the loop thread: the controller owns it and
/// send sessions consult it by reference, so plain interior mutability
/// is all the sharing it needs.
#[derive(Debug, Default)]
pub struct SharedFiles {
    inner: RefCell<HashMap<u32, SharedFile>>,
}

impl SharedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `path` for pull, registering it or regenerating the id of an
    /// existing record, and capture a fresh `stat` snapshot.
    ///
    /// Returns `None` when the file vanished before it could be stat'ed
    /// (created and deleted without ever being closed); any stale record
    /// is dropped in that case.
    pub fn offer(&self, path: &Path) -> Option<SharedFile> {
        let stat = match StatSnapshot::capture(path) {
            Ok(stat) => stat,
            Err(e) => {
                tracing::warn!(
                    filename = %path.display(),
                    error = %e,
                    "cannot stat file; not sharing"
                );
                let mut files = self.inner.borrow_mut();
                files.retain(|_, f| f.filename != path);
                return None;
            }
        };

        let now = SystemTime::now();
        let mut files = self.inner.borrow_mut();

        let previous = files
            .iter()
            .find(|(_, f)| f.filename == path)
            .map(|(id, _)| *id);
        let mut record = match previous {
            Some(old_id) => files.remove(&old_id).expect("record just found"),
            None => SharedFile {
                filename: path.to_path_buf(),
                id: 0,
                stat,
                last_updated: now,
                start_sharing: now,
                just_received: false,
            },
        };

        record.id = fresh_id(&files);
        record.stat = stat;
        record.start_sharing = now;
        record.just_received = false;
        let shared = record.clone();
        files.insert(record.id, record);
        Some(shared)
    }

    pub fn get(&self, id: u32) -> Option<SharedFile> {
        self.inner.borrow().get(&id).cloned()
    }

    pub fn get_by_path(&self, path: &Path) -> Option<SharedFile> {
        self.inner
            .borrow()
            .values()
            .find(|f| f.filename == path)
            .cloned()
    }

    pub fn remove(&self, id: u32) -> Option<SharedFile> {
        self.inner.borrow_mut().remove(&id)
    }

    /// Drop the record for a locally deleted file, if any.
    pub fn remove_by_path(&self, path: &Path) -> bool {
        let mut files = self.inner.borrow_mut();
        let before = files.len();
        files.retain(|_, f| f.filename != path);
        files.len() != before
    }

    /// Recompute the captured `stat` after a transfer replaced the file
    /// on disk, registering the file if it was not offered before. The
    /// record is marked so the rename's own change notification can be
    /// told apart from a real local write.
    pub fn refresh(&self, path: &Path) {
        let stat = match StatSnapshot::capture(path) {
            Ok(stat) => stat,
            Err(e) => {
                tracing::debug!(
                    filename = %path.display(),
                    error = %e,
                    "cannot refresh stat snapshot"
                );
                return;
            }
        };
        let now = SystemTime::now();
        let mut files = self.inner.borrow_mut();
        if let Some(record) = files.values_mut().find(|f| f.filename == path) {
            record.stat = stat;
            record.last_updated = now;
            record.just_received = true;
            return;
        }
        let id = fresh_id(&files);
        files.insert(
            id,
            SharedFile {
                filename: path.to_path_buf(),
                id,
                stat,
                last_updated: now,
                start_sharing: now,
                just_received: true,
            },
        );
    }

    /// True exactly once for the change notification caused by our own
    /// publish of `path`, judged by an unchanged `stat` snapshot.
    pub fn consume_received_echo(&self, path: &Path, current: &StatSnapshot) -> bool {
        let mut files = self.inner.borrow_mut();
        let Some(record) = files.values_mut().find(|f| f.filename == path) else {
            return false;
        };
        if !record.just_received {
            return false;
        }
        if record.stat.size == current.size
            && record.stat.mtime_sec == current.mtime_sec
            && record.stat.mtime_nsec == current.mtime_nsec
        {
            record.just_received = false;
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fresh_id(files: &HashMap<u32, SharedFile>) -> u32 {
    loop {
        let id = OsRng.next_u32();
        if !files.contains_key(&id) {
            return id;
        }
    }
}
