//! Tearing a mount down.

use super::error::{HelperError, UnmountError};
use super::fusermount;
use super::options::MountOptions;
use log::debug;
use std::path::Path;
use std::process::Command;

/// Unmounts `mount_point`.
///
/// With `direct_mount` set the `umount` system call is tried first; any
/// failure there falls back to `fusermount -u`.
pub fn unmount(mount_point: &Path, options: &MountOptions) -> Result<(), UnmountError> {
    if options.direct_mount {
        match nix::mount::umount(mount_point) {
            Ok(()) => return Ok(()),
            Err(e) => {
                if options.debug {
                    debug!("unmount: umount {:?} failed: {}", mount_point, e);
                }
            }
        }
    }
    let bin = fusermount::find_binary()?;
    run_unmount_helper(&bin, mount_point)
}

/// Runs `bin -u mount_point`.
///
/// Anything the helper prints on stderr counts as a failure, even with a
/// zero exit status.
pub fn run_unmount_helper(bin: &Path, mount_point: &Path) -> Result<(), UnmountError> {
    let output = Command::new(bin)
        .arg("-u")
        .arg(mount_point)
        .output()
        .map_err(|source| {
            UnmountError::Helper(HelperError::Spawn {
                bin: bin.to_path_buf(),
                source,
            })
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() || !output.status.success() {
        return Err(UnmountError::Failed {
            stderr,
            status: output.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::fusermount::tests::{retry_busy, write_script};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_helper_stderr_and_status_fail() {
        let dir = TempDir::new().unwrap();
        let bin = write_script(dir.path(), "fusermount", "echo 'entry not found' >&2\nexit 1");

        let err = retry_busy(|| run_unmount_helper(&bin, Path::new("/mnt/x"))).unwrap_err();
        match err {
            UnmountError::Failed { stderr, status } => {
                assert_eq!(stderr, "entry not found");
                assert_eq!(status.code(), Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_helper_stdout_is_ignored() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("args");
        let body = format!("echo \"$@\" > \"{}\"\necho unmounted", log.display());
        let bin = write_script(dir.path(), "fusermount", &body);

        retry_busy(|| run_unmount_helper(&bin, Path::new("/mnt/x"))).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap().trim(), "-u /mnt/x");
    }

    #[test]
    fn test_helper_stderr_with_success_still_fails() {
        let dir = TempDir::new().unwrap();
        let bin = write_script(dir.path(), "fusermount", "echo warning >&2\nexit 0");

        let err = retry_busy(|| run_unmount_helper(&bin, Path::new("/mnt/x"))).unwrap_err();
        assert!(err.to_string().starts_with("warning (code"));
    }

    #[test]
    fn test_missing_helper_binary() {
        let err = run_unmount_helper(Path::new("/nonexistent/fusermount"), Path::new("/mnt/x"))
            .unwrap_err();
        assert!(matches!(err, UnmountError::Helper(_)));
    }
}
