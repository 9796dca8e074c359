//! Error types for channel setup, teardown and the splice path.

use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// A malformed descriptor-passing message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AncillaryError {
    /// The control region cannot hold a header plus one descriptor.
    #[error("too short control message: {len} bytes, need {need}")]
    ControlTooShort {
        /// Bytes available (or declared by the header).
        len: usize,
        /// Minimum number of bytes for one passed descriptor.
        need: usize,
    },

    /// The control message is not an `SCM_RIGHTS` message.
    #[error("recvmsg returned wrong control type: level {level}, type {kind}")]
    WrongControlType {
        /// `cmsg_level` as received.
        level: i32,
        /// `cmsg_type` as received.
        kind: i32,
    },

    /// The kernel cut the control data short (`MSG_CTRUNC`).
    #[error("control message truncated")]
    Truncated,

    /// The encoded descriptor is negative.
    #[error("fd < 0: {0}")]
    NegativeDescriptor(i32),
}

/// Failures while driving the setuid mount helper.
#[derive(Debug, Error)]
pub enum HelperError {
    /// Creating the socketpair failed.
    #[error("socketpair: {0}")]
    Socket(#[source] Errno),

    /// No helper binary on `PATH` or in the fallback directory.
    #[error("{name} not found in PATH or {fallback}")]
    NotFound {
        /// Binary names that were tried.
        name: String,
        /// Directory searched after `PATH`.
        fallback: String,
    },

    /// The helper process could not be started or waited on.
    #[error("running {bin}: {source}")]
    Spawn {
        /// Helper path.
        bin: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The helper exited unsuccessfully.
    #[error("{bin} exited with {status}")]
    ExitedNonZero {
        /// Helper path.
        bin: PathBuf,
        /// Exit status.
        status: ExitStatus,
    },

    /// `recvmsg` on the retained socket end failed.
    #[error("recvmsg: {0}")]
    Receive(#[source] Errno),

    /// The helper's message did not carry a usable descriptor.
    #[error("descriptor transfer failed: {0}")]
    DescriptorTransfer(#[from] AncillaryError),
}

/// Failures establishing the kernel channel.
#[derive(Debug, Error)]
pub enum MountError {
    /// Opening the device or mounting was not permitted.
    #[error("permission denied for {path}: {source}")]
    PermissionDenied {
        /// Device node or mountpoint.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: Errno,
    },

    /// A mount-related system call failed.
    #[error("{call}: {source}")]
    Syscall {
        /// Name of the failing call.
        call: &'static str,
        /// Underlying errno.
        #[source]
        source: Errno,
    },

    /// The helper-mediated mount failed.
    #[error("fusermount: {0}")]
    Helper(#[from] HelperError),

    /// A `/dev/fd/N` mountpoint names a descriptor that is not open.
    #[error("magic mountpoint fd {fd} is not usable: {source}")]
    MagicFdInvalid {
        /// Descriptor number from the mountpoint.
        fd: i32,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
}

impl MountError {
    pub(crate) fn from_errno(call: &'static str, path: impl Into<PathBuf>, errno: Errno) -> Self {
        match errno {
            Errno::EPERM | Errno::EACCES => MountError::PermissionDenied {
                path: path.into(),
                source: errno,
            },
            _ => MountError::Syscall {
                call,
                source: errno,
            },
        }
    }
}

/// Failures tearing the channel down.
#[derive(Debug, Error)]
pub enum UnmountError {
    /// The unmount helper could not be located or run.
    #[error(transparent)]
    Helper(#[from] HelperError),

    /// The unmount helper reported a failure.
    #[error("{stderr} (code {status})")]
    Failed {
        /// Captured standard error, trimmed.
        stderr: String,
        /// Exit status of the helper.
        status: ExitStatus,
    },
}

/// Failures on the splice path. The writer recovers from all of these by
/// falling back to a vectored write.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No pooled pipe and a new one could not be created.
    #[error("no pipe available: {0}")]
    PoolExhausted(#[source] Errno),

    /// The pipe could not be resized to the requested capacity.
    #[error("cannot grow pipe to {want} bytes (max {max})")]
    GrowFailed {
        /// Requested capacity.
        want: usize,
        /// Largest capacity the pipe may take.
        max: usize,
        /// Errno from `F_SETPIPE_SZ`, if the call was made.
        #[source]
        source: Option<Errno>,
    },

    /// A step moved fewer bytes than required.
    #[error("short {kind} transfer: got {got}, want {want}")]
    ShortTransfer {
        /// Which step came up short (`header`, `payload`, `channel`).
        kind: &'static str,
        /// Bytes moved.
        got: usize,
        /// Bytes required.
        want: usize,
    },

    /// A pipe or channel write failed.
    #[error("write: {0}")]
    Write(#[from] Errno),
}
