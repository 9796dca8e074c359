//! Pipe pairs used as staging buffers for splicing, and the pool that
//! hands them out.
//!
//! A pipe's capacity only ever grows. Pairs go back to the pool after every
//! transfer; a pair that still holds unflushed bytes is closed instead of
//! being reused.

use super::constants::{DEFAULT_PAGE_SIZE, DEFAULT_PIPE_MAX_SIZE, PIPE_MAX_SIZE_PATH};
use super::error::TransferError;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag, SpliceFFlags};
use nix::sys::uio;
use nix::unistd::{self, SysconfVar};
use parking_lot::Mutex;
use std::fs;
use std::io::IoSlice;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::OnceLock;

/// System page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match unistd::sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => DEFAULT_PAGE_SIZE,
    })
}

/// Largest capacity an unprivileged pipe may be given.
pub fn max_pipe_size() -> usize {
    static MAX_PIPE_SIZE: OnceLock<usize> = OnceLock::new();
    *MAX_PIPE_SIZE.get_or_init(|| {
        fs::read_to_string(PIPE_MAX_SIZE_PATH)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_PIPE_MAX_SIZE)
    })
}

/// Whether pipes on this system can be resized, which the splice path needs.
pub fn splice_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let pair = match PipePair::open(max_pipe_size()) {
            Ok(pair) => pair,
            Err(_) => return false,
        };
        let size = match fcntl::fcntl(pair.read_fd(), FcntlArg::F_GETPIPE_SZ) {
            Ok(size) if size > 0 => size,
            _ => return false,
        };
        let resized = fcntl::fcntl(pair.read_fd(), FcntlArg::F_SETPIPE_SZ(2 * size)).is_ok();
        if !resized {
            debug!("pipes cannot be resized, splicing disabled");
        }
        resized
    })
}

/// A connected pipe: bytes written to the write end are read from the read end.
#[derive(Debug)]
pub struct PipePair {
    read: OwnedFd,
    write: OwnedFd,
    size: usize,
    max_size: usize,
    pending: usize,
}

impl PipePair {
    /// Creates a pipe whose capacity may be grown up to `max_size`.
    pub fn open(max_size: usize) -> Result<Self, Errno> {
        let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        // SAFETY: pipe2 returned two fresh descriptors we now own.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) };
        let size = fcntl::fcntl(r, FcntlArg::F_GETPIPE_SZ)
            .map(|s| s as usize)
            .unwrap_or(DEFAULT_PAGE_SIZE * 16);
        Ok(Self {
            read,
            write,
            size,
            max_size,
            pending: 0,
        })
    }

    /// Read end.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Write end.
    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Current capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capacity limit for this pair.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes written into the pipe and not yet moved out.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Grows the capacity to at least `size`. Never shrinks.
    pub fn grow(&mut self, size: usize) -> Result<(), TransferError> {
        if size <= self.size {
            return Ok(());
        }
        if size > self.max_size {
            return Err(TransferError::GrowFailed {
                want: size,
                max: self.max_size,
                source: None,
            });
        }
        let want = i32::try_from(size).map_err(|_| TransferError::GrowFailed {
            want: size,
            max: self.max_size,
            source: None,
        })?;
        let granted = fcntl::fcntl(self.read_fd(), FcntlArg::F_SETPIPE_SZ(want)).map_err(|e| {
            TransferError::GrowFailed {
                want: size,
                max: self.max_size,
                source: Some(e),
            }
        })?;
        self.size = self.size.max(granted as usize);
        Ok(())
    }

    /// Writes `buf` into the pipe with a single call.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, TransferError> {
        let n = unistd::write(self.write_fd(), buf)?;
        self.pending += n;
        Ok(n)
    }

    /// Writes all of `bufs` into the pipe with a single vectored call.
    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize, TransferError> {
        let n = uio::writev(self.write_fd(), bufs)?;
        self.pending += n;
        Ok(n)
    }

    /// Splices up to `len` bytes from `fd` at `offset` into the pipe.
    pub fn load_from_at(
        &mut self,
        fd: RawFd,
        len: usize,
        offset: i64,
    ) -> Result<usize, TransferError> {
        let mut off = offset as libc::loff_t;
        let n = fcntl::splice(
            fd,
            Some(&mut off),
            self.write_fd(),
            None,
            len,
            SpliceFFlags::SPLICE_F_MOVE,
        )?;
        self.pending += n;
        Ok(n)
    }

    /// Splices up to `len` bytes out of the pipe into `fd`.
    pub fn write_to(&mut self, fd: BorrowedFd<'_>, len: usize) -> Result<usize, TransferError> {
        let n = fcntl::splice(
            self.read_fd(),
            None,
            fd.as_raw_fd(),
            None,
            len,
            SpliceFFlags::SPLICE_F_MOVE,
        )?;
        self.pending = self.pending.saturating_sub(n);
        Ok(n)
    }
}

/// Where the splice path borrows its pipes from.
///
/// The writer only sees this trait, so tests can hand it a source that fails
/// on demand.
pub trait PipeSource: Send + Sync {
    /// Borrows a pair.
    fn get(&self) -> Result<PipePair, TransferError>;

    /// Returns a pair previously handed out by `get`.
    fn done(&self, pair: PipePair);
}

/// A pair borrowed from a [`PipeSource`], returned when dropped.
pub struct PipeLease<'a> {
    source: &'a dyn PipeSource,
    pair: Option<PipePair>,
}

impl<'a> PipeLease<'a> {
    /// Borrows a pair from `source`.
    pub fn acquire(source: &'a dyn PipeSource) -> Result<Self, TransferError> {
        let pair = source.get()?;
        Ok(Self {
            source,
            pair: Some(pair),
        })
    }
}

impl Deref for PipeLease<'_> {
    type Target = PipePair;

    fn deref(&self) -> &PipePair {
        // Only None after drop.
        self.pair.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PipeLease<'_> {
    fn deref_mut(&mut self) -> &mut PipePair {
        self.pair.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PipeLease<'_> {
    fn drop(&mut self) {
        if let Some(pair) = self.pair.take() {
            self.source.done(pair);
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<PipePair>,
    in_use: usize,
}

/// Thread-safe pool of reusable pipe pairs.
#[derive(Debug)]
pub struct PipePool {
    state: Mutex<PoolState>,
    max_size: usize,
}

impl Default for PipePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PipePool {
    /// Creates a pool whose pipes may grow to the system maximum.
    pub fn new() -> Self {
        Self::with_max_size(max_pipe_size())
    }

    /// Creates a pool whose pipes may grow to at most `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_size,
        }
    }

    /// Capacity limit of the pipes this pool hands out.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// `(in_use, idle)` counts.
    pub fn stats(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.in_use, state.idle.len())
    }

    /// Closes all idle pairs.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.idle.clear();
    }
}

impl PipeSource for PipePool {
    fn get(&self) -> Result<PipePair, TransferError> {
        let mut state = self.state.lock();
        let pair = match state.idle.pop() {
            Some(pair) => pair,
            None => PipePair::open(self.max_size).map_err(TransferError::PoolExhausted)?,
        };
        state.in_use += 1;
        Ok(pair)
    }

    fn done(&self, pair: PipePair) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if pair.pending() == 0 {
            state.idle.push(pair);
        } else {
            debug!("discarding pipe with {} unflushed bytes", pair.pending());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::thread;

    fn read_all(fd: RawFd, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let n = unistd::read(fd, &mut buf[got..]).unwrap();
            assert!(n > 0);
            got += n;
        }
        buf
    }

    #[test]
    fn test_grow_within_limit() {
        if !splice_supported() {
            return;
        }
        let page = page_size();
        let max = max_pipe_size();
        let mut pair = PipePair::open(max).unwrap();
        for size in [1, page, 4 * page, max - 2 * page - 1] {
            pair.grow(size + page).unwrap();
            assert!(pair.size() >= size + page);
        }
    }

    #[test]
    fn test_supported_means_resizable() {
        if !splice_supported() {
            return;
        }
        let mut pair = PipePair::open(max_pipe_size()).unwrap();
        let doubled = 2 * pair.size();
        pair.grow(doubled).unwrap();
        assert!(pair.size() >= doubled);
    }

    #[test]
    fn test_grow_never_shrinks() {
        if !splice_supported() {
            return;
        }
        let page = page_size();
        let mut pair = PipePair::open(max_pipe_size()).unwrap();
        pair.grow(32 * page).unwrap();
        let grown = pair.size();
        pair.grow(page).unwrap();
        assert_eq!(pair.size(), grown);
    }

    #[test]
    fn test_grow_beyond_max_is_reported() {
        let mut pair = PipePair::open(max_pipe_size()).unwrap();
        let err = pair.grow(max_pipe_size() + 1).unwrap_err();
        assert!(matches!(err, TransferError::GrowFailed { source: None, .. }));
    }

    #[test]
    fn test_write_then_load_then_flush() {
        if !splice_supported() {
            return;
        }
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut pair = PipePair::open(max_pipe_size()).unwrap();
        assert_eq!(pair.write(b"hdr:").unwrap(), 4);
        assert_eq!(pair.load_from_at(file.as_raw_fd(), 5, 3).unwrap(), 5);
        assert_eq!(pair.pending(), 9);

        let sink = PipePair::open(max_pipe_size()).unwrap();
        // SAFETY: sink outlives the borrow.
        let out = unsafe { BorrowedFd::borrow_raw(sink.write_fd()) };
        assert_eq!(pair.write_to(out, 9).unwrap(), 9);
        assert_eq!(pair.pending(), 0);
        assert_eq!(read_all(sink.read_fd(), 9), b"hdr:34567");
    }

    #[test]
    fn test_pool_reuses_clean_pairs() {
        let pool = PipePool::new();
        let pair = pool.get().unwrap();
        let fd = pair.read_fd();
        assert_eq!(pool.stats(), (1, 0));

        pool.done(pair);
        assert_eq!(pool.stats(), (0, 1));
        assert_eq!(pool.get().unwrap().read_fd(), fd);
    }

    #[test]
    fn test_pool_discards_dirty_pairs() {
        let pool = PipePool::new();
        {
            let mut lease = PipeLease::acquire(&pool).unwrap();
            lease.write(b"left behind").unwrap();
        }
        assert_eq!(pool.stats(), (0, 0));
    }

    #[test]
    fn test_lease_returns_on_error_path() {
        let pool = PipePool::with_max_size(1);
        let result = (|| -> Result<(), TransferError> {
            let mut lease = PipeLease::acquire(&pool)?;
            lease.grow(1 << 30)?;
            Ok(())
        })();
        assert!(result.is_err());
        assert_eq!(pool.stats(), (0, 1));
    }

    #[test]
    fn test_concurrent_borrow_and_return() {
        let pool = Arc::new(PipePool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _lease = PipeLease::acquire(pool.as_ref()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let (in_use, idle) = pool.stats();
        assert_eq!(in_use, 0);
        assert!(idle >= 1 && idle <= 8);
        pool.clear();
        assert_eq!(pool.stats(), (0, 0));
    }
}
