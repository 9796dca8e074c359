//! Zero-copy transfer of a header and payload into the kernel channel.
//!
//! Header and payload have to reach the channel in one write, and a pipe
//! cannot be seeked into, so both are staged in order in the same pipe:
//!
//!  1. write the header into the pipe          --> [header]
//!  2. splice the payload into the pipe        --> [header][payload]
//!  3. splice the whole pipe into the channel
//!
//! In-memory payloads go in together with the header as one `writev`.

use super::error::TransferError;
use super::pipe::{page_size, PipeLease, PipeSource};
use super::response::Payload;
use std::os::fd::BorrowedFd;

/// Moves `header` followed by `payload` into `channel`.
///
/// Any failure is returned as-is; nothing is retried and bytes already
/// consumed from a file are not recovered.
pub fn transfer(
    pool: &dyn PipeSource,
    channel: BorrowedFd<'_>,
    header: &[u8],
    payload: &Payload,
) -> Result<(), TransferError> {
    let mut pipe = PipeLease::acquire(pool)?;

    let size = payload.len();
    let total = header.len() + size;
    // The kernel blocks writers on an almost full pipe, so leave a page spare.
    pipe.grow(total + page_size())?;

    match payload {
        Payload::File(data) => {
            let n = pipe.write(header)?;
            if n != header.len() {
                return Err(TransferError::ShortTransfer {
                    kind: "header",
                    got: n,
                    want: header.len(),
                });
            }
            let n = pipe.load_from_at(data.fd(), size, data.offset())?;
            if n != size {
                return Err(TransferError::ShortTransfer {
                    kind: "payload",
                    got: n,
                    want: size,
                });
            }
        }
        Payload::Slices(_) | Payload::Flat(_) => {
            let bufs = payload.io_slices(header);
            let n = pipe.write_vectored(&bufs)?;
            if n != total {
                return Err(TransferError::ShortTransfer {
                    kind: "payload",
                    got: n,
                    want: total,
                });
            }
        }
    }

    let n = pipe.write_to(channel, total)?;
    if n != total {
        return Err(TransferError::ShortTransfer {
            kind: "channel",
            got: n,
            want: total,
        });
    }
    Ok(())
}
