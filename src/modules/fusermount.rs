//! Mounting through the setuid `fusermount` helper.
//!
//! The helper opens `/dev/fuse`, mounts it, and sends the descriptor back
//! over a socketpair whose far end it finds at descriptor 3.

use super::ancillary;
use super::constants::{COMM_FD, COMM_FD_ENV, FUSERMOUNT_BINARIES, HELPER_FALLBACK_DIR};
use super::error::HelperError;
use super::options::MountOptions;
use log::debug;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn look_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Finds the first of `names` on `PATH`, then in `fallback_dir`.
pub fn look_path_fallback(names: &[&str], fallback_dir: &Path) -> Option<PathBuf> {
    names.iter().find_map(|name| {
        look_path(name).or_else(|| {
            let candidate = fallback_dir.join(name);
            is_executable(&candidate).then_some(candidate)
        })
    })
}

/// Locates the `fusermount` helper.
pub fn find_binary() -> Result<PathBuf, HelperError> {
    look_path_fallback(FUSERMOUNT_BINARIES, Path::new(HELPER_FALLBACK_DIR)).ok_or_else(|| {
        HelperError::NotFound {
            name: FUSERMOUNT_BINARIES.join(" or "),
            fallback: HELPER_FALLBACK_DIR.to_string(),
        }
    })
}

/// Command-line arguments for mounting `mount_point`.
pub fn mount_args(mount_point: &Path, options: &MountOptions) -> Vec<OsString> {
    let mut args = vec![mount_point.as_os_str().to_os_string()];
    let strings = options.options_strings();
    if !strings.is_empty() {
        args.push("-o".into());
        args.push(strings.join(",").into());
    }
    args
}

// Runs in the child between fork and exec, so only raw libc calls.
fn install_comm_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl and dup2 are async-signal-safe and touch only descriptors.
    let rc = unsafe {
        if fd == COMM_FD {
            libc::fcntl(fd, libc::F_SETFD, 0)
        } else {
            libc::dup2(fd, COMM_FD)
        }
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mounts `mount_point` with the helper found on this system.
pub fn mount(mount_point: &Path, options: &MountOptions) -> Result<OwnedFd, HelperError> {
    let bin = find_binary()?;
    mount_with(&bin, mount_point, options)
}

/// Mounts `mount_point` by running `bin` and receiving the descriptor it
/// passes back.
pub fn mount_with(
    bin: &Path,
    mount_point: &Path,
    options: &MountOptions,
) -> Result<OwnedFd, HelperError> {
    let (local, remote) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(HelperError::Socket)?;
    // SAFETY: socketpair returned two fresh descriptors we now own.
    let (local, remote) = unsafe { (OwnedFd::from_raw_fd(local), OwnedFd::from_raw_fd(remote)) };

    let mut cmd = Command::new(bin);
    cmd.args(mount_args(mount_point, options))
        .env(COMM_FD_ENV, COMM_FD.to_string());
    let remote_fd = remote.as_raw_fd();
    // SAFETY: the hook only calls async-signal-safe functions.
    unsafe {
        cmd.pre_exec(move || install_comm_fd(remote_fd));
    }

    if options.debug {
        debug!("fusermount: running {:?}", cmd);
    }
    let status = cmd.status().map_err(|source| HelperError::Spawn {
        bin: bin.to_path_buf(),
        source,
    })?;
    // Once our copy is gone a helper that sent nothing reads as EOF.
    drop(remote);

    if !status.success() {
        return Err(HelperError::ExitedNonZero {
            bin: bin.to_path_buf(),
            status,
        });
    }

    let fd = ancillary::recv_descriptor(local.as_fd())?;
    // SAFETY: the descriptor was just installed in this process by recvmsg.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modules::error::AncillaryError;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes an executable shell script named `name` into `dir`.
    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Retries while another test thread still holds the script open for
    /// writing across a fork.
    pub(crate) fn retry_busy<T, E, F>(mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Debug,
    {
        for _ in 0..20 {
            match f() {
                Err(e) if format!("{:?}", e).contains("Text file busy") => {
                    thread::sleep(Duration::from_millis(20));
                }
                other => return other,
            }
        }
        f()
    }

    #[test]
    fn test_mount_args() {
        let options = MountOptions {
            name: "demo".to_string(),
            allow_other: true,
            ..Default::default()
        };
        let args = mount_args(Path::new("/mnt/x"), &options);
        assert_eq!(args, vec!["/mnt/x", "-o", "allow_other,subtype=demo"]);

        let bare = MountOptions {
            name: String::new(),
            ..Default::default()
        };
        assert_eq!(mount_args(Path::new("/mnt/x"), &bare), vec!["/mnt/x"]);
    }

    #[test]
    fn test_look_path_fallback_uses_fallback_dir() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "fusewire-test-helper", "exit 0");
        assert_eq!(
            look_path_fallback(&["fusewire-test-helper"], dir.path()),
            Some(script)
        );
        assert_eq!(look_path_fallback(&["fusewire-missing"], dir.path()), None);
    }

    #[test]
    fn test_look_path_fallback_skips_non_executables() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("plain"), "data").unwrap();
        assert_eq!(look_path_fallback(&["plain"], dir.path()), None);
    }

    #[test]
    fn test_helper_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let bin = write_script(dir.path(), "fusermount", "exit 3");
        let err = retry_busy(|| mount_with(&bin, Path::new("/mnt/x"), &MountOptions::default()))
            .unwrap_err();
        match err {
            HelperError::ExitedNonZero { status, .. } => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_helper_sees_comm_fd_and_arguments() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("args");
        let body = format!(
            r#"[ "${env}" = "{fd}" ] || exit 10
[ -e /proc/$$/fd/{fd} ] || exit 11
echo "$@" > "{log}""#,
            env = COMM_FD_ENV,
            fd = COMM_FD,
            log = log.display()
        );
        let bin = write_script(dir.path(), "fusermount", &body);
        let options = MountOptions {
            options: vec!["ro".to_string()],
            ..Default::default()
        };

        // The helper exits cleanly without sending a descriptor.
        let err = retry_busy(|| mount_with(&bin, Path::new("/mnt/x"), &options)).unwrap_err();
        assert!(
            matches!(
                err,
                HelperError::DescriptorTransfer(AncillaryError::ControlTooShort { len: 0, .. })
            ),
            "unexpected error: {err}"
        );
        assert_eq!(
            fs::read_to_string(&log).unwrap().trim(),
            "/mnt/x -o ro,subtype=fusewire"
        );
    }
}
