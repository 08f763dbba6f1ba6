//! Debouncing of mid-write modifications.
//!
//! Close-after-write notifications are authoritative and bypass this set
//! entirely. Plain write notifications only say "someone is writing"; the
//! file is offered once no further write has been seen for the configured
//! window. The minimum window is 3 seconds because kernel notification
//! coalescing can defer a close event by a second or two.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default quiescence window in seconds.
pub const DEFAULT_TRANSFER_AFTER: u32 = 10;
/// Hard lower bound for the window.
pub const MIN_TRANSFER_AFTER: u32 = 3;

/// Cadence at which the set is polled for quiescent entries.
pub const TICK: Duration = Duration::from_secs(1);

/// Files that saw a write but no close yet, with their last-write stamp.
#[derive(Debug)]
pub struct ModifiedSet {
    files: HashMap<PathBuf, Instant>,
    window: Duration,
}

impl ModifiedSet {
    pub fn new(transfer_after_sec: u32) -> Self {
        Self {
            files: HashMap::new(),
            window: Duration::from_secs(u64::from(transfer_after_sec.max(MIN_TRANSFER_AFTER))),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a write, refreshing the stamp of an existing entry.
    pub fn touch(&mut self, path: &Path) {
        self.files.insert(path.to_path_buf(), Instant::now());
    }

    /// Drop an entry whose file was closed or deleted. Returns whether the
    /// file was being tracked.
    pub fn settle(&mut self, path: &Path) -> bool {
        self.files.remove(path).is_some()
    }

    /// Remove and return every file whose last write is at least one
    /// window in the past.
    pub fn drain_quiescent(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let mut ready: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.files.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_clamped_to_minimum() {
        let set = ModifiedSet::new(1);
        assert_eq!(set.window(), Duration::from_secs(3));
        let set = ModifiedSet::new(10);
        assert_eq!(set.window(), Duration::from_secs(10));
    }

    #[test]
    fn quiescent_entries_drain_after_the_window() {
        let mut set = ModifiedSet::new(3);
        let path = PathBuf::from("/data/log");
        set.touch(&path);

        let start = Instant::now();
        assert!(set.drain_quiescent(start).is_empty());
        assert!(set
            .drain_quiescent(start + Duration::from_secs(2))
            .is_empty());

        let ready = set.drain_quiescent(start + Duration::from_secs(4));
        assert_eq!(ready, vec![path]);
        assert!(set.is_empty());
    }

    #[test]
    fn touch_refreshes_the_stamp() {
        let mut set = ModifiedSet::new(3);
        let path = PathBuf::from("/data/log");
        set.touch(&path);

        // a fresh write keeps the file out of the quiescent drain
        std::thread::sleep(Duration::from_millis(10));
        set.touch(&path);
        let almost = Instant::now() + Duration::from_millis(2990);
        assert!(set.drain_quiescent(almost).is_empty());
    }

    #[test]
    fn settle_removes_without_draining() {
        let mut set = ModifiedSet::new(3);
        let path = PathBuf::from("/data/log");
        set.touch(&path);

        assert!(set.settle(&path));
        assert!(!set.settle(&path));
        assert!(set
            .drain_quiescent(Instant::now() + Duration::from_secs(60))
            .is_empty());
    }

    #[test]
    fn drain_handles_multiple_files_independently() {
        let mut set = ModifiedSet::new(3);
        let old = PathBuf::from("/data/a");
        let fresh = PathBuf::from("/data/b");
        set.touch(&old);
        let t0 = Instant::now();
        std::thread::sleep(Duration::from_millis(20));
        set.touch(&fresh);

        let ready = set.drain_quiescent(t0 + Duration::from_secs(3));
        assert_eq!(ready, vec![old]);
        assert_eq!(set.len(), 1);
    }
}
