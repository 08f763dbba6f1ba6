//! Ties watcher, quiescence set, registries, bus and transfer sessions
//! together.
//!
//! The controller is driven from the daemon loop: change notifications
//! and bus messages come in, announcements and receive sessions go out.
//! All policy decisions happen here so the endpoints stay dumb.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::bus::{BusCommand, BusEvent, BusHandle};
use crate::config::{Credentials, Settings};
use crate::paths::{DeleteMode, PathRegistry, WatchedPath};
use crate::protocol::Endpoint;
use crate::quiesce::ModifiedSet;
use crate::receiver::ReceiveSession;
use crate::registry::{SharedFiles, StatSnapshot};
use crate::watcher::{Changes, FileEvent};

pub struct Controller {
    paths: Rc<PathRegistry>,
    files: Rc<SharedFiles>,
    quiesce: ModifiedSet,
    temp_dirs: Vec<PathBuf>,
    endpoints: String,
    credentials: Option<Credentials>,
    connector: Option<TlsConnector>,
    bus: BusHandle,
    /// Completed receive sessions report their target here.
    done_tx: mpsc::UnboundedSender<PathBuf>,
    /// Temp-file sequence, unique for the process lifetime.
    temp_counter: Arc<AtomicU64>,
}

impl Controller {
    pub fn new(
        paths: Rc<PathRegistry>,
        files: Rc<SharedFiles>,
        settings: &Settings,
        connector: Option<TlsConnector>,
        bus: BusHandle,
        done_tx: mpsc::UnboundedSender<PathBuf>,
    ) -> Self {
        Self {
            paths,
            files,
            quiesce: ModifiedSet::new(settings.transfer_after_sec),
            temp_dirs: settings.temp_dirs.clone(),
            endpoints: settings.advertised_endpoints(),
            credentials: settings.credentials.clone(),
            connector,
            bus,
            done_tx,
            temp_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// One change notification from the filesystem watcher.
    pub fn handle_file_event(&mut self, event: FileEvent) {
        if event.changes.contains(Changes::DELETED) {
            self.quiesce.settle(&event.path);
            self.files.remove_by_path(&event.path);
            tracing::debug!(filename = %event.path.display(), "local deletion announced");
            self.bus.publish(BusCommand::FileDeleted {
                filename: event.path,
            });
            return;
        }

        // filter targets replication cannot handle
        let meta = match std::fs::symlink_metadata(&event.path) {
            Ok(meta) => meta,
            Err(_) => return, // vanished between the event and now
        };
        let file_type = meta.file_type();
        if !file_type.is_file() && !file_type.is_dir() && !file_type.is_symlink() {
            tracing::warn!(
                filename = %event.path.display(),
                "found a special file (device, fifo or socket) which cannot be replicated"
            );
            return;
        }
        let Ok(meta) = std::fs::metadata(&event.path) else {
            return; // dangling symlink
        };
        if !meta.is_file() {
            return;
        }

        if event.changes.contains(Changes::UPDATED) {
            self.quiesce.settle(&event.path);
            let current = StatSnapshot::from_metadata(&meta);
            if self.files.consume_received_echo(&event.path, &current) {
                tracing::debug!(
                    filename = %event.path.display(),
                    "change notification is our own publish; not re-announcing"
                );
                return;
            }
            self.offer(&event.path);
        } else if event.changes.contains(Changes::MODIFIED) {
            self.quiesce.touch(&event.path);
        }
    }

    /// 1-second cadence: announce files whose writes have gone quiet.
    pub fn tick(&mut self, now: Instant) {
        for path in self.quiesce.drain_quiescent(now) {
            self.offer(&path);
        }
    }

    /// Register (or re-register) the file and announce it to the cluster.
    fn offer(&mut self, path: &Path) {
        let Some(shared) = self.files.offer(path) else {
            // the file disappeared before it could be stat'ed
            return;
        };
        tracing::info!(
            filename = %path.display(),
            id = shared.id,
            "announcing changed file"
        );
        self.bus.publish(BusCommand::FileChanged {
            filename: path.to_path_buf(),
            id: shared.id,
            mtime_sec: shared.stat.mtime_sec,
            mtime_nsec: shared.stat.mtime_nsec,
            endpoints: self.endpoints.clone(),
        });
    }

    /// One message from the control bus.
    pub fn handle_bus_event(&mut self, event: BusEvent) {
        match event.command {
            BusCommand::FileChanged {
                filename,
                id,
                endpoints,
                ..
            } => self.start_receive(filename, id, &endpoints, event.secure),
            BusCommand::FileDeleted { filename } => self.delete_local(&filename),
            BusCommand::Stop => {
                // the daemon loop turns this into a shutdown before we
                // ever see it
            }
        }
    }

    /// A receive session finished and published its file.
    pub fn file_received(&mut self, path: &Path) {
        self.files.refresh(path);
    }

    /// Decide whether and how to fetch an announced file. `None` means
    /// the announcement is ignored; the reason is logged.
    fn plan_receive(
        &self,
        filename: &Path,
        endpoints_csv: &str,
        secure_bus: bool,
    ) -> Option<(Endpoint, PathBuf)> {
        let dir = filename.parent()?;
        let Some(descriptor) = self.paths.best_match(dir) else {
            tracing::debug!(
                filename = %filename.display(),
                "no watched path covers this file here; ignoring transfer order"
            );
            return None;
        };
        if !descriptor.path_mode.can_receive() {
            tracing::debug!(
                filename = %filename.display(),
                "path policy forbids receiving this file; ignoring transfer order"
            );
            return None;
        }

        let endpoints = Endpoint::parse_list(endpoints_csv);
        let endpoint = if secure_bus {
            // an announcement from a secure channel must not lead to a
            // plain-text pull
            endpoints.into_iter().find(|e| e.secure)
        } else {
            endpoints.into_iter().next()
        };
        let Some(endpoint) = endpoint else {
            tracing::warn!(
                filename = %filename.display(),
                endpoints = endpoints_csv,
                "announcement carries no usable endpoint"
            );
            return None;
        };
        if endpoint.secure && self.connector.is_none() {
            tracing::warn!(
                filename = %filename.display(),
                "secure endpoint selected but no certificate configured; ignoring transfer order"
            );
            return None;
        }

        let temp_dir = self.temp_dir_for(descriptor, dir);
        Some((endpoint, temp_dir))
    }

    fn start_receive(&mut self, filename: PathBuf, id: u32, endpoints_csv: &str, secure: bool) {
        let Some((endpoint, temp_dir)) = self.plan_receive(&filename, endpoints_csv, secure) else {
            return;
        };

        tracing::debug!(
            filename = %filename.display(),
            id,
            peer = %endpoint,
            temp_dir = %temp_dir.display(),
            "starting receive session"
        );

        let session = ReceiveSession {
            target: filename.clone(),
            id,
            temp_dir,
            endpoint,
            expected: self.credentials.clone(),
            connector: self.connector.clone(),
        };
        let done = self.done_tx.clone();
        let counter = self.temp_counter.clone();
        tokio::spawn(async move {
            match session.run(&counter).await {
                Ok(()) => {
                    let _ = done.send(filename);
                }
                Err(e) => {
                    tracing::error!(
                        filename = %filename.display(),
                        error = %e,
                        "receive session failed"
                    );
                }
            }
        });
    }

    fn delete_local(&mut self, filename: &Path) {
        let Some(dir) = filename.parent() else {
            return;
        };
        let Some(descriptor) = self.paths.best_match(dir) else {
            tracing::debug!(
                filename = %filename.display(),
                "no watched path covers this file here; ignoring delete order"
            );
            return;
        };
        if descriptor.delete_mode != DeleteMode::Apply {
            tracing::debug!(
                filename = %filename.display(),
                "path policy forbids deleting this file; ignoring delete order"
            );
            return;
        }

        match std::fs::remove_file(filename) {
            Ok(()) => {
                tracing::info!(filename = %filename.display(), "deleted on remote order");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    filename = %filename.display(),
                    error = %e,
                    "cannot delete file on remote order"
                );
            }
        }
        self.files.remove_by_path(filename);
    }

    /// Pick the staging directory for a destination directory: the
    /// descriptor override first, then the first configured temp dir on
    /// the same mount, then the first configured temp dir. Staying on
    /// one mount is what keeps the final rename atomic.
    fn temp_dir_for(&self, descriptor: &WatchedPath, dir: &Path) -> PathBuf {
        if let Some(temp_dir) = &descriptor.temp_dir {
            return temp_dir.clone();
        }
        if let Some(mount) = mount_point_of(dir) {
            for temp_dir in &self.temp_dirs {
                if temp_dir.starts_with(&mount) {
                    return temp_dir.clone();
                }
            }
            tracing::debug!(
                dir = %dir.display(),
                mount = %mount.display(),
                "no temp dir shares the destination mount; rename may not be atomic"
            );
        }
        self.temp_dirs[0].clone()
    }
}

/// Longest mount point containing `path`, from the live mount table.
fn mount_point_of(path: &Path) -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut best: Option<PathBuf> = None;
    let mut best_len = 0;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let len = mount.as_os_str().len();
            if best.is_none() || len > best_len {
                best_len = len;
                best = Some(mount.to_path_buf());
            }
        }
    }
    best
}
