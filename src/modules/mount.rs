//! Establishing the kernel channel.
//!
//! Three strategies produce the channel descriptor, tried in order:
//!
//! 1. `Direct`: open `/dev/fuse` and call `mount(2)` ourselves (opt-in,
//!    needs privileges).
//! 2. `MagicFd`: the mountpoint is `/dev/fd/N` and the caller already
//!    mounted descriptor `N`.
//! 3. `Fusermount`: let the setuid helper mount and pass the descriptor back.

use super::constants::{
    FUSE_DEVICE, HELPER_ONLY_OPTIONS, MAGIC_FD_DIR, MOUNT_BINARY, MTAB_PATH, ROOT_GROUP_ID,
    ROOT_MODE, ROOT_USER_ID,
};
use super::error::MountError;
use super::fusermount;
use super::options::MountOptions;
use log::{debug, info, warn};
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, AccessFlags};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;

/// How a channel was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountStrategy {
    /// `mount(2)` called by this process.
    Direct,
    /// Descriptor named by a `/dev/fd/N` mountpoint.
    MagicFd,
    /// Descriptor passed back by `fusermount`.
    Fusermount,
}

/// The open descriptor to the kernel driver for one mounted session.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
    mount_point: PathBuf,
    strategy: MountStrategy,
}

impl Channel {
    /// Wraps an already established descriptor.
    pub fn new(fd: OwnedFd, mount_point: impl Into<PathBuf>, strategy: MountStrategy) -> Self {
        Self {
            fd,
            mount_point: mount_point.into(),
            strategy,
        }
    }

    /// Where the filesystem is mounted.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// How the descriptor was obtained.
    pub fn strategy(&self) -> MountStrategy {
        self.strategy
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Returns `N` when `mount_point` is exactly `/dev/fd/N` with `N >= 0`.
pub fn parse_magic_fd(mount_point: &Path) -> Option<RawFd> {
    let rest = mount_point.to_str()?.strip_prefix(MAGIC_FD_DIR)?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    rest.parse::<RawFd>().ok().filter(|fd| *fd >= 0)
}

/// Mount data for a direct mount of descriptor `fd`.
pub fn direct_mount_data(fd: RawFd, options: &MountOptions) -> String {
    // Caller options come last so they can override the defaults.
    let mut r = vec![
        format!("fd={}", fd),
        ROOT_MODE.to_string(),
        ROOT_USER_ID.to_string(),
        ROOT_GROUP_ID.to_string(),
    ];
    r.extend(
        options
            .options
            .iter()
            .filter(|o| !HELPER_ONLY_OPTIONS.contains(&o.as_str()))
            .cloned(),
    );
    if options.allow_other {
        r.push("allow_other".to_string());
    }
    r.join(",")
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Whether `mtab` is a plain writable file outside `mount_point`.
pub fn mtab_needs_update(mtab: &Path, mount_point: &Path) -> bool {
    if mtab.starts_with(mount_point) {
        return false;
    }
    match fs::symlink_metadata(mtab) {
        Ok(meta) if meta.file_type().is_file() => {}
        _ => return false,
    }
    unistd::access(mtab, AccessFlags::W_OK).is_ok()
}

fn update_mtab(source: &str, mount_point: &Path, fs_type: &str, data: &str) {
    let output = Command::new(MOUNT_BINARY)
        .arg("--no-canonicalize")
        .arg("-i")
        .arg("-f")
        .arg("-t")
        .arg(fs_type)
        .arg("-o")
        .arg(data)
        .arg(source)
        .arg(mount_point)
        .output();
    match output {
        Ok(out) if out.status.success() => {}
        Ok(out) => warn!(
            "update {}: {}{}",
            MTAB_PATH,
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        ),
        Err(e) => warn!("update {}: {}", MTAB_PATH, e),
    }
}

fn mount_direct(mount_point: &Path, options: &MountOptions) -> Result<OwnedFd, MountError> {
    let raw = fcntl::open(FUSE_DEVICE, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| MountError::from_errno("open", FUSE_DEVICE, e))?;
    // SAFETY: open returned a fresh descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let source = options.source();
    let fs_type = options.fs_type();
    let flags = options.mount_flags();
    let data = direct_mount_data(fd.as_raw_fd(), options);

    if options.debug {
        debug!(
            "mount_direct: mount({:?}, {:?}, {:?}, {:#x}, {:?})",
            source,
            mount_point,
            fs_type,
            flags.bits(),
            data
        );
    }
    nix::mount::mount(
        Some(source),
        mount_point,
        Some(fs_type.as_str()),
        flags,
        Some(data.as_str()),
    )
    .map_err(|e| MountError::from_errno("mount", mount_point, e))?;

    if unistd::geteuid().is_root() {
        let real = absolute(mount_point);
        if mtab_needs_update(Path::new(MTAB_PATH), &real) {
            update_mtab(source, &real, &fs_type, &data);
        }
    }
    Ok(fd)
}

fn adopt_magic_fd(fd: RawFd) -> Result<OwnedFd, MountError> {
    fcntl::fcntl(fd, FcntlArg::F_GETFD).map_err(|source| MountError::MagicFdInvalid { fd, source })?;
    // SAFETY: the descriptor is open and the caller hands it to this session.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Establishes the kernel channel for `mount_point`.
///
/// `ready` runs once, after the descriptor is usable, and never on failure.
pub fn establish(
    mount_point: &Path,
    options: &MountOptions,
    ready: impl FnOnce(),
) -> Result<Channel, MountError> {
    if options.direct_mount {
        match mount_direct(mount_point, options) {
            Ok(fd) => {
                info!("Mounted {} directly", mount_point.display());
                ready();
                return Ok(Channel::new(fd, mount_point, MountStrategy::Direct));
            }
            Err(e) if options.direct_mount_strict => return Err(e),
            Err(e) => {
                if options.debug {
                    debug!("mount: failed to do direct mount: {}", e);
                }
            }
        }
    }

    let (fd, strategy) = match parse_magic_fd(mount_point) {
        Some(fd) => {
            if options.debug {
                debug!("mount: magic mountpoint {:?}, using fd {}", mount_point, fd);
            }
            (adopt_magic_fd(fd)?, MountStrategy::MagicFd)
        }
        None => (
            fusermount::mount(mount_point, options)?,
            MountStrategy::Fusermount,
        ),
    };

    fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|source| MountError::Syscall {
            call: "fcntl",
            source,
        })?;

    info!("Mounted {} via {:?}", mount_point.display(), strategy);
    ready();
    Ok(Channel::new(fd, mount_point, strategy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_parse_magic_fd() {
        assert_eq!(parse_magic_fd(Path::new("/dev/fd/7")), Some(7));
        assert_eq!(parse_magic_fd(Path::new("/dev/fd/0")), Some(0));
        assert_eq!(parse_magic_fd(Path::new("/dev/fd/-1")), None);
        assert_eq!(parse_magic_fd(Path::new("/dev/fd/abc")), None);
        assert_eq!(parse_magic_fd(Path::new("/dev/fd/")), None);
        assert_eq!(parse_magic_fd(Path::new("/dev/fd/7/x")), None);
        assert_eq!(parse_magic_fd(Path::new("/tmp/mnt")), None);
        assert_eq!(parse_magic_fd(Path::new("dev/fd/7")), None);
    }

    #[test]
    fn test_direct_mount_data_filters_helper_options() {
        let options = MountOptions {
            options: vec![
                "nonempty".to_string(),
                "default_permissions".to_string(),
                "allow_root".to_string(),
                "max_read=131072".to_string(),
            ],
            allow_other: true,
            ..Default::default()
        };
        assert_eq!(
            direct_mount_data(5, &options),
            "fd=5,rootmode=40000,user_id=0,group_id=0,default_permissions,max_read=131072,allow_other"
        );
    }

    #[test]
    fn test_mtab_needs_update() {
        let dir = TempDir::new().unwrap();
        let mtab = dir.path().join("mtab");
        let mnt = Path::new("/definitely/elsewhere");

        assert!(!mtab_needs_update(&mtab, mnt));

        fs::write(&mtab, "").unwrap();
        assert!(mtab_needs_update(&mtab, mnt));
        // The mount table lives under the mountpoint.
        assert!(!mtab_needs_update(&mtab, dir.path()));

        let link = dir.path().join("mtab-link");
        symlink(&mtab, &link).unwrap();
        assert!(!mtab_needs_update(&link, mnt));
    }

    #[test]
    fn test_establish_with_magic_fd() {
        let (r, w) = pipe().unwrap();
        let mount_point = PathBuf::from(format!("/dev/fd/{}", w));
        let mut signalled = 0;

        let channel = establish(&mount_point, &MountOptions::default(), || signalled += 1).unwrap();

        assert_eq!(signalled, 1);
        assert_eq!(channel.as_raw_fd(), w);
        assert_eq!(channel.strategy(), MountStrategy::MagicFd);
        assert_eq!(channel.mount_point(), mount_point.as_path());
        let flags = fcntl::fcntl(w, FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));

        drop(channel);
        unistd::close(r).unwrap();
    }

    #[test]
    fn test_establish_rejects_closed_magic_fd() {
        let (r, w) = pipe().unwrap();
        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
        // Both numbers are free again; use the higher one so a concurrently
        // opened descriptor is less likely to land on it.
        let fd = r.max(w) + 1000;
        let mut signalled = false;

        let err = establish(
            Path::new(&format!("/dev/fd/{}", fd)),
            &MountOptions::default(),
            || signalled = true,
        )
        .unwrap_err();

        assert!(matches!(err, MountError::MagicFdInvalid { fd: f, .. } if f == fd));
        assert!(!signalled);
    }
}
