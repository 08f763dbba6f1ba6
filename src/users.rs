//! Unix user/group database lookups and file attribute application.
//!
//! The wire protocol carries owner and group as names, not numeric ids,
//! because the peers' user databases need not assign the same numbers.
//! Lookups use the reentrant libc interfaces with a growing buffer.

use std::ffi::{CStr, CString};
use std::fs::Permissions;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const INITIAL_BUF: usize = 1024;
const MAX_BUF: usize = 1 << 20;

/// Name of the user owning `uid`, if the database knows it.
pub fn user_name(uid: u32) -> Option<String> {
    let mut buf = vec![0u8; INITIAL_BUF];
    loop {
        let mut pwd = MaybeUninit::<libc::passwd>::uninit();
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                pwd.as_mut_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < MAX_BUF {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr((*result).pw_name) };
        return name.to_str().ok().map(str::to_string);
    }
}

/// Name of the group `gid`, if the database knows it.
pub fn group_name(gid: u32) -> Option<String> {
    let mut buf = vec![0u8; INITIAL_BUF];
    loop {
        let mut grp = MaybeUninit::<libc::group>::uninit();
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrgid_r(
                gid,
                grp.as_mut_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < MAX_BUF {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr((*result).gr_name) };
        return name.to_str().ok().map(str::to_string);
    }
}

/// Numeric uid for a user name on this host.
pub fn uid_for(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let mut buf = vec![0u8; INITIAL_BUF];
    loop {
        let mut pwd = MaybeUninit::<libc::passwd>::uninit();
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(
                cname.as_ptr(),
                pwd.as_mut_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < MAX_BUF {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        return Some(unsafe { (*result).pw_uid });
    }
}

/// Numeric gid for a group name on this host.
pub fn gid_for(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    let mut buf = vec![0u8; INITIAL_BUF];
    loop {
        let mut grp = MaybeUninit::<libc::group>::uninit();
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrnam_r(
                cname.as_ptr(),
                grp.as_mut_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf.len() < MAX_BUF {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        return Some(unsafe { (*result).gr_gid });
    }
}

/// Set owner and group by name.
///
/// # Errors
///
/// `NotFound` when either name is unknown on this host; otherwise the
/// `chown` errno.
pub fn apply_owner(path: &Path, username: &str, groupname: &str) -> io::Result<()> {
    let uid = uid_for(username).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("unknown user {username:?}"))
    })?;
    let gid = gid_for(groupname).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("unknown group {groupname:?}"))
    })?;

    let cpath = cpath(path)?;
    if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set the POSIX permission bits.
pub fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))
}

/// Set the modification time, leaving the access time untouched.
pub fn apply_mtime(path: &Path, sec: u64, nsec: u64) -> io::Result<()> {
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: sec as libc::time_t,
            tv_nsec: nsec as libc::c_long,
        },
    ];
    let cpath = cpath(path)?;
    if unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn current_user_round_trips_through_the_database() {
        let uid = unsafe { libc::getuid() };
        let name = user_name(uid).expect("current user has a name");
        assert!(!name.is_empty());
        assert_eq!(uid_for(&name), Some(uid));
    }

    #[test]
    fn current_group_round_trips_through_the_database() {
        let gid = unsafe { libc::getgid() };
        let name = group_name(gid).expect("current group has a name");
        assert_eq!(gid_for(&name), Some(gid));
    }

    #[test]
    fn unknown_names_resolve_to_none() {
        assert!(uid_for("no-such-user-rfsd-test").is_none());
        assert!(gid_for("no-such-group-rfsd-test").is_none());
    }

    #[test]
    fn apply_mode_changes_permission_bits() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").expect("write");

        apply_mode(&path, 0o640).expect("chmod");
        let mode = std::fs::metadata(&path).expect("stat").mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn apply_mtime_sets_seconds_and_nanoseconds() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").expect("write");

        apply_mtime(&path, 1_600_000_000, 123_456_789).expect("utimensat");
        let meta = std::fs::metadata(&path).expect("stat");
        assert_eq!(meta.mtime(), 1_600_000_000);
        assert_eq!(meta.mtime_nsec(), 123_456_789);
    }
}
