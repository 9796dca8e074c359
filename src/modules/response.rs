//! Outgoing responses and the collaborators they carry.
//!
//! A response is a header plus exactly one kind of payload. The header is
//! produced by a [`HeaderEncoder`] so the writer can re-encode it when the
//! payload it finally sends is shorter than announced.

use super::constants::OUT_HEADER_LEN;
use nix::errno::Errno;
use std::fmt;
use std::fs::File;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

/// Errno-style status of one response. `0` is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(pub i32);

impl Status {
    /// Success.
    pub const OK: Status = Status(0);

    /// Whether this is [`Status::OK`].
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Status for an I/O error, `EIO` when it carries no errno.
    pub fn from_io(err: &io::Error) -> Self {
        Status(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<Errno> for Status {
    fn from(errno: Errno) -> Self {
        Status(errno as i32)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK")
        } else {
            write!(f, "{} ({})", Errno::from_i32(self.0).desc(), self.0)
        }
    }
}

/// A payload that lives in an open file.
pub trait FileData: Send {
    /// Descriptor to splice from.
    fn fd(&self) -> RawFd;

    /// Position of the first byte.
    fn offset(&self) -> i64;

    /// Number of bytes requested.
    fn size(&self) -> usize;

    /// Copies the payload into `buf` (sized to [`FileData::size`]). Returns
    /// the bytes obtained, which may be fewer than requested, and the status
    /// of the read.
    fn read_into(&self, buf: &mut [u8]) -> (usize, Status);
}

/// A byte range of a shared [`File`].
#[derive(Debug, Clone)]
pub struct FileRange {
    file: Arc<File>,
    offset: u64,
    len: usize,
}

impl FileRange {
    /// `len` bytes of `file` starting at `offset`.
    pub fn new(file: Arc<File>, offset: u64, len: usize) -> Self {
        Self { file, offset, len }
    }
}

impl FileData for FileRange {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn offset(&self) -> i64 {
        self.offset as i64
    }

    fn size(&self) -> usize {
        self.len
    }

    fn read_into(&self, buf: &mut [u8]) -> (usize, Status) {
        let want = buf.len().min(self.len);
        let mut got = 0;
        while got < want {
            match self.file.read_at(&mut buf[got..want], self.offset + got as u64) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return (got, Status::from_io(&e)),
            }
        }
        (got, Status::OK)
    }
}

/// The payload of a response. Exactly one representation is active.
pub enum Payload {
    /// Bytes to be read from an open file.
    File(Box<dyn FileData>),
    /// Discontiguous buffers, sent in order.
    Slices(Vec<Vec<u8>>),
    /// One contiguous buffer.
    Flat(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Flat(Vec::new())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::File(data) => f
                .debug_struct("File")
                .field("fd", &data.fd())
                .field("offset", &data.offset())
                .field("size", &data.size())
                .finish(),
            Payload::Slices(bufs) => f.debug_tuple("Slices").field(&bufs.len()).finish(),
            Payload::Flat(buf) => f.debug_tuple("Flat").field(&buf.len()).finish(),
        }
    }
}

impl Payload {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::File(data) => data.size(),
            Payload::Slices(bufs) => bufs.iter().map(Vec::len).sum(),
            Payload::Flat(buf) => buf.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the payload comes from a file.
    pub fn is_file(&self) -> bool {
        matches!(self, Payload::File(_))
    }

    /// `header` followed by the in-memory payload, ready for `writev`.
    /// File payloads contribute nothing.
    pub fn io_slices<'a>(&'a self, header: &'a [u8]) -> Vec<IoSlice<'a>> {
        let mut bufs = vec![IoSlice::new(header)];
        match self {
            Payload::File(_) => {}
            Payload::Slices(slices) => bufs.extend(slices.iter().map(|s| IoSlice::new(s))),
            Payload::Flat(buf) => bufs.push(IoSlice::new(buf)),
        }
        bufs
    }
}

/// Produces the fixed-format header that precedes a payload.
pub trait HeaderEncoder: Send {
    /// Header for a payload of `payload_len` bytes sent with `status`.
    fn encode(&self, payload_len: usize, status: Status) -> Vec<u8>;
}

/// `struct fuse_out_header`: `len: u32`, `error: i32`, `unique: u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutHeader {
    /// Request identifier echoed back to the kernel.
    pub unique: u64,
}

impl HeaderEncoder for OutHeader {
    fn encode(&self, payload_len: usize, status: Status) -> Vec<u8> {
        // The kernel rejects error replies that announce a body.
        let payload_len = if status.is_ok() { payload_len } else { 0 };
        let mut header = Vec::with_capacity(OUT_HEADER_LEN);
        header.extend_from_slice(&((OUT_HEADER_LEN + payload_len) as u32).to_ne_bytes());
        header.extend_from_slice(&(-status.0).to_ne_bytes());
        header.extend_from_slice(&self.unique.to_ne_bytes());
        header
    }
}

/// Signal fired once the response has been handed to the kernel.
pub trait Completion: Send {
    /// Marks the response done.
    fn done(self: Box<Self>);
}

impl<F: FnOnce() + Send> Completion for F {
    fn done(self: Box<Self>) {
        (*self)()
    }
}

/// One reply to the kernel.
pub struct OutgoingResponse {
    /// Status reported in the header.
    pub status: Status,
    /// Data following the header.
    pub payload: Payload,
    header: Box<dyn HeaderEncoder>,
    completion: Option<Box<dyn Completion>>,
}

impl fmt::Debug for OutgoingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingResponse")
            .field("status", &self.status)
            .field("payload", &self.payload)
            .field("pending_completion", &self.completion.is_some())
            .finish()
    }
}

impl OutgoingResponse {
    /// A successful response.
    pub fn new(header: impl HeaderEncoder + 'static, payload: Payload) -> Self {
        Self {
            status: Status::OK,
            payload,
            header: Box::new(header),
            completion: None,
        }
    }

    /// Sets the status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Registers the completion signal.
    pub fn on_done(mut self, completion: impl Completion + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    /// Header for the current payload and status.
    pub fn encode_header(&self) -> Vec<u8> {
        self.header.encode(self.payload.len(), self.status)
    }

    /// Header for a payload of `payload_len` bytes.
    pub fn encode_header_for(&self, payload_len: usize) -> Vec<u8> {
        self.header.encode(payload_len, self.status)
    }

    /// Fires the completion signal. Later calls do nothing.
    pub fn mark_done(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_out_header_layout() {
        let header = OutHeader { unique: 42 }.encode(100, Status::OK);
        assert_eq!(header.len(), OUT_HEADER_LEN);
        assert_eq!(u32::from_ne_bytes(header[0..4].try_into().unwrap()), 116);
        assert_eq!(i32::from_ne_bytes(header[4..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_ne_bytes(header[8..16].try_into().unwrap()), 42);
    }

    #[test]
    fn test_error_header_announces_no_body() {
        let header = OutHeader { unique: 3 }.encode(100, Status(libc::EIO));
        assert_eq!(u32::from_ne_bytes(header[0..4].try_into().unwrap()), OUT_HEADER_LEN as u32);
        assert_eq!(i32::from_ne_bytes(header[4..8].try_into().unwrap()), -libc::EIO);
    }

    #[test]
    fn test_payload_len_and_slices() {
        let payload = Payload::Slices(vec![b"ab".to_vec(), b"cde".to_vec()]);
        assert_eq!(payload.len(), 5);
        let slices = payload.io_slices(b"H");
        let joined: Vec<u8> = slices.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(joined, b"Habcde");

        assert!(Payload::default().is_empty());
        assert!(!Payload::Flat(vec![1]).is_file());
    }

    #[test]
    fn test_file_range_reads_short_at_eof() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello world").unwrap();
        let range = FileRange::new(Arc::new(file), 6, 10);
        assert_eq!(range.size(), 10);

        let mut buf = vec![0u8; range.size()];
        let (n, status) = range.read_into(&mut buf);
        assert_eq!(n, 5);
        assert!(status.is_ok());
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn test_completion_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut response = OutgoingResponse::new(OutHeader { unique: 1 }, Payload::default())
            .on_done(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        response.mark_done();
        response.mark_done();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::OK.to_string(), "OK");
        assert_eq!(Status::from(Errno::EIO), Status(libc::EIO));
        assert!(Status(libc::EIO).to_string().contains("5"));
    }
}
