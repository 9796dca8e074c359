//! Decoding of descriptor-passing (`SCM_RIGHTS`) control messages.
//!
//! The control region returned by `recvmsg(2)` is treated as a binary record:
//! a `cmsghdr` (`cmsg_len`, `cmsg_level`, `cmsg_type`) followed, after
//! alignment, by 4-byte descriptors. Every field is read through a
//! bounds-checked slice; nothing is reinterpreted in place.

use super::error::{AncillaryError, HelperError};
use nix::errno::Errno;
use nix::unistd;
use std::mem::{self, offset_of};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// Size of `struct cmsghdr`.
pub const CMSG_HEADER_LEN: usize = mem::size_of::<libc::cmsghdr>();

const LEN_OFFSET: usize = offset_of!(libc::cmsghdr, cmsg_len);
const LEN_WIDTH: usize = offset_of!(libc::cmsghdr, cmsg_level) - LEN_OFFSET;
const LEVEL_OFFSET: usize = offset_of!(libc::cmsghdr, cmsg_level);
const TYPE_OFFSET: usize = offset_of!(libc::cmsghdr, cmsg_type);

/// Offset of the payload, i.e. `CMSG_DATA`.
pub const CMSG_DATA_OFFSET: usize = align(CMSG_HEADER_LEN);

/// Smallest control message carrying one descriptor.
pub const CMSG_MIN_LEN: usize = CMSG_DATA_OFFSET + mem::size_of::<i32>();

const CONTROL_BUF_LEN: usize = 4 * 256;

const fn align(len: usize) -> usize {
    let word = mem::size_of::<usize>();
    (len + word - 1) & !(word - 1)
}

fn field<const N: usize>(control: &[u8], offset: usize) -> Result<[u8; N], AncillaryError> {
    control
        .get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(AncillaryError::ControlTooShort {
            len: control.len(),
            need: offset + N,
        })
}

fn read_i32(control: &[u8], offset: usize) -> Result<i32, AncillaryError> {
    field::<4>(control, offset).map(i32::from_ne_bytes)
}

fn read_len(control: &[u8]) -> Result<usize, AncillaryError> {
    match LEN_WIDTH {
        8 => field::<8>(control, LEN_OFFSET).map(|b| u64::from_ne_bytes(b) as usize),
        _ => field::<4>(control, LEN_OFFSET).map(|b| u32::from_ne_bytes(b) as usize),
    }
}

/// Extracts the descriptor from the control bytes of one received message.
pub fn extract_descriptor(control: &[u8]) -> Result<RawFd, AncillaryError> {
    if control.len() <= CMSG_HEADER_LEN || control.len() < CMSG_MIN_LEN {
        return Err(AncillaryError::ControlTooShort {
            len: control.len(),
            need: CMSG_MIN_LEN,
        });
    }

    let level = read_i32(control, LEVEL_OFFSET)?;
    let kind = read_i32(control, TYPE_OFFSET)?;
    if level != libc::SOL_SOCKET || kind != libc::SCM_RIGHTS {
        return Err(AncillaryError::WrongControlType { level, kind });
    }

    // The kernel-declared length must cover the descriptor too.
    let declared = read_len(control)?;
    if declared < CMSG_MIN_LEN {
        return Err(AncillaryError::ControlTooShort {
            len: declared,
            need: CMSG_MIN_LEN,
        });
    }

    let fd = read_i32(control, CMSG_DATA_OFFSET)?;
    if fd < 0 {
        return Err(AncillaryError::NegativeDescriptor(fd));
    }
    Ok(fd)
}

/// Every descriptor carried by an `SCM_RIGHTS` message, as far as the
/// declared length and the buffer both reach. Negative values are skipped.
pub fn passed_descriptors(control: &[u8]) -> Vec<RawFd> {
    let is_rights = matches!(
        (read_i32(control, LEVEL_OFFSET), read_i32(control, TYPE_OFFSET)),
        (Ok(libc::SOL_SOCKET), Ok(libc::SCM_RIGHTS))
    );
    if !is_rights {
        return Vec::new();
    }
    let end = read_len(control).map_or(0, |len| len.min(control.len()));
    (CMSG_DATA_OFFSET..end.max(CMSG_DATA_OFFSET))
        .step_by(mem::size_of::<i32>())
        .filter_map(|offset| read_i32(control, offset).ok())
        .filter(|fd| *fd >= 0)
        .collect()
}

/// Receives one message on `socket` and returns the descriptor it carries.
///
/// Any other descriptor the kernel installed for the message is closed.
pub fn recv_descriptor(socket: BorrowedFd<'_>) -> Result<RawFd, HelperError> {
    let mut control = [0u8; CONTROL_BUF_LEN];
    recv_descriptor_into(socket, &mut control)
}

fn recv_descriptor_into(socket: BorrowedFd<'_>, control: &mut [u8]) -> Result<RawFd, HelperError> {
    let mut data = [0u8; 4];

    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    // SAFETY: an all-zero msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;

    // SAFETY: iov and control outlive the call and their lengths match.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(HelperError::Receive(Errno::last()));
    }

    let received = (msg.msg_controllen as usize).min(control.len());
    let control = &control[..received];
    let result = if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        Err(AncillaryError::Truncated)
    } else {
        extract_descriptor(control)
    };

    let kept = result.as_ref().ok().copied();
    for fd in passed_descriptors(control) {
        if Some(fd) != kept {
            let _ = unistd::close(fd);
        }
    }
    Ok(result?)
}
