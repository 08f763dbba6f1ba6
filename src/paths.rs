//! Watched-path descriptors and the per-path policy registry.
//!
//! Policies come from `*.conf` files under the configured watch-dirs
//! roots. Each file holds `[section]` blocks with `path=`, and optional
//! `path_mode=`, `delete_mode=` and `path_part=` keys. Broken sections are
//! skipped with a log line; a registry that ends up empty aborts startup.

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Direction policy for a watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMode {
    /// Local changes are announced; remote announcements are ignored.
    #[default]
    SendOnly,
    /// Remote announcements are fetched; local changes are not announced.
    ReceiveOnly,
    /// Both directions; last writer wins.
    Latest,
}

impl PathMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "send-only" => Some(Self::SendOnly),
            "receive-only" => Some(Self::ReceiveOnly),
            "latest" => Some(Self::Latest),
            _ => None,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, Self::SendOnly | Self::Latest)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, Self::ReceiveOnly | Self::Latest)
    }
}

/// Whether remote deletions are applied locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    #[default]
    Ignore,
    Apply,
}

impl DeleteMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "ignore" => Some(Self::Ignore),
            "apply" => Some(Self::Apply),
            _ => None,
        }
    }
}

/// One configured directory and its replication policy.
#[derive(Debug, Clone)]
pub struct WatchedPath {
    pub path: PathBuf,
    pub path_mode: PathMode,
    pub delete_mode: DeleteMode,
    /// Overrides mount-based temp placement when set.
    pub temp_dir: Option<PathBuf>,
}

/// The set of watched-path descriptors, looked up by longest segment match.
#[derive(Debug, Default)]
pub struct PathRegistry {
    paths: Vec<WatchedPath>,
}

impl PathRegistry {
    /// Scan every `*.conf` file under the given roots.
    ///
    /// # Errors
    ///
    /// Fails when a section declares an empty or root (`/`) path, or when
    /// no usable descriptor remains after the scan.
    pub fn load(watch_dirs: &[PathBuf]) -> Result<Self> {
        let mut registry = Self::default();
        for dir in watch_dirs {
            registry.load_dir(dir)?;
        }

        if registry.paths.is_empty() {
            bail!("no watched paths found in any configuration file; refusing to start");
        }

        tracing::info!(
            paths = registry.paths.len(),
            "loaded watched-path configuration"
        );
        Ok(registry)
    }

    #[cfg(test)]
    pub fn from_descriptors(paths: Vec<WatchedPath>) -> Self {
        Self { paths }
    }

    fn load_dir(&mut self, dir: &Path) -> Result<()> {
        if dir.as_os_str().is_empty() || dir == Path::new("/") {
            bail!("the root directory (/) and the empty string are not valid watch-dirs roots");
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::info!(dir = %dir.display(), error = %e, "skipping unreadable watch-dirs root");
                return Ok(());
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension() == Some(OsStr::new("conf")))
            .collect();
        files.sort();

        if files.is_empty() {
            tracing::info!(dir = %dir.display(), "no configuration files in watch-dirs root");
        }

        for file in files {
            self.load_file(&file)?;
        }
        Ok(())
    }

    fn load_file(&mut self, file: &Path) -> Result<()> {
        tracing::debug!(file = %file.display(), "loading watched-path configuration");
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("cannot read configuration file {}", file.display()))?;

        let mut section: Option<Section> = None;
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some(done) = section.take() {
                    self.finish_section(file, done)?;
                }
                section = Some(Section::new(name));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(file = %file.display(), line = raw, "ignoring malformed line");
                continue;
            };
            let Some(current) = section.as_mut() else {
                tracing::warn!(file = %file.display(), line = raw, "ignoring key outside any section");
                continue;
            };
            current.set(key.trim(), value.trim());
        }

        if let Some(done) = section.take() {
            self.finish_section(file, done)?;
        }
        Ok(())
    }

    fn finish_section(&mut self, file: &Path, section: Section) -> Result<()> {
        let Some(path) = section.path else {
            tracing::info!(
                file = %file.display(),
                section = section.name,
                "ignoring section without a path= parameter"
            );
            return Ok(());
        };

        if path.is_empty() || path == "/" {
            bail!(
                "section [{}] in {} declares path {:?}; the empty string and / are not watchable",
                section.name,
                file.display(),
                path
            );
        }

        let Some(path_mode) = PathMode::parse(&section.path_mode) else {
            tracing::warn!(
                file = %file.display(),
                section = section.name,
                path_mode = section.path_mode,
                "ignoring section with unrecognized path_mode"
            );
            return Ok(());
        };
        let Some(delete_mode) = DeleteMode::parse(&section.delete_mode) else {
            tracing::warn!(
                file = %file.display(),
                section = section.name,
                delete_mode = section.delete_mode,
                "ignoring section with unrecognized delete_mode"
            );
            return Ok(());
        };

        let path = PathBuf::from(path);
        if self.paths.iter().any(|w| w.path == path) {
            tracing::warn!(
                file = %file.display(),
                path = %path.display(),
                "ignoring second definition of watched path"
            );
            return Ok(());
        }

        self.paths.push(WatchedPath {
            path,
            path_mode,
            delete_mode,
            temp_dir: section.temp_dir.map(PathBuf::from),
        });
        Ok(())
    }

    /// Descriptor sharing the most leading `/`-delimited segments with
    /// `dir`, or `None` when no segment matches at all.
    pub fn best_match(&self, dir: &Path) -> Option<&WatchedPath> {
        let mut best: Option<&WatchedPath> = None;
        let mut best_count = 0usize;
        for watched in &self.paths {
            let count = shared_segments(&watched.path, dir);
            if count > best_count {
                best_count = count;
                best = Some(watched);
            }
        }
        best
    }

    /// True when `path` is exactly one of the configured directories.
    pub fn is_watched_dir(&self, path: &Path) -> bool {
        self.paths.iter().any(|w| w.path == path)
    }

    /// Policy of the descriptor governing `dir`, if any.
    pub fn policy(&self, dir: &Path) -> Option<(PathMode, DeleteMode)> {
        self.best_match(dir).map(|w| (w.path_mode, w.delete_mode))
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchedPath> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

struct Section {
    name: String,
    path: Option<String>,
    path_mode: String,
    delete_mode: String,
    temp_dir: Option<String>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            path_mode: String::new(),
            delete_mode: String::new(),
            temp_dir: None,
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            "path" => self.path = Some(value.to_string()),
            "path_mode" => self.path_mode = value.to_string(),
            "delete_mode" => self.delete_mode = value.to_string(),
            "path_part" => self.temp_dir = Some(value.to_string()),
            _ => {}
        }
    }
}

fn path_segments(p: &Path) -> impl Iterator<Item = &OsStr> {
    p.components().filter_map(|c| match c {
        Component::Normal(s) => Some(s),
        _ => None,
    })
}

/// Number of leading whole segments of descriptor path `a` matching the
/// queried directory `b`. A trailing segment only counts when it matches
/// completely, so `/var/lib/data` shares two segments with
/// `/var/lib/datafoo`, not three. A descriptor deeper than the query
/// governs nothing in it and scores zero: `/data/archive` must not
/// match a lookup for `/data`.
fn shared_segments(a: &Path, b: &Path) -> usize {
    if path_segments(a).count() > path_segments(b).count() {
        return 0;
    }
    path_segments(a)
        .zip(path_segments(b))
        .take_while(|(x, y)| x == y)
        .count()
}
