//! Scoped privilege elevation for publishing received files.
//!
//! The daemon runs as a restricted service account, but a received file
//! may belong to any user, so ownership changes and the final rename can
//! need root. The guard raises the effective ids and restores them on
//! drop, which also covers panics. Elevation is best-effort: without the
//! saved set-user-id (or the capability), publication proceeds with the
//! daemon's own rights and metadata application degrades gracefully.

pub struct Privileges {
    restore: Option<(libc::uid_t, libc::gid_t)>,
}

impl Privileges {
    /// Raise the effective uid/gid to root for the lifetime of the guard.
    pub fn elevate() -> Self {
        let euid = unsafe { libc::geteuid() };
        if euid == 0 {
            return Self { restore: None };
        }

        let egid = unsafe { libc::getegid() };
        if unsafe { libc::seteuid(0) } != 0 {
            tracing::debug!("cannot elevate privileges; publishing with current rights");
            return Self { restore: None };
        }
        if unsafe { libc::setegid(0) } != 0 {
            tracing::debug!("effective gid stays unchanged during elevation");
        }
        Self {
            restore: Some((euid, egid)),
        }
    }

    /// Whether the guard actually elevated.
    pub fn is_elevated(&self) -> bool {
        self.restore.is_some() || unsafe { libc::geteuid() } == 0
    }
}

impl Drop for Privileges {
    fn drop(&mut self) {
        let Some((uid, gid)) = self.restore.take() else {
            return;
        };
        // restore the gid while still root, then drop the uid
        if unsafe { libc::setegid(gid) } != 0 {
            tracing::error!("failed to restore effective gid after elevation");
        }
        if unsafe { libc::seteuid(uid) } != 0 {
            tracing::error!("failed to restore effective uid after elevation");
        }
    }
}
