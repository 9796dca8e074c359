//! Delivery of responses to the kernel channel.
//!
//! Each response is sent with one kernel-visible write: a plain `write` for a
//! bare header, a splice out of a staging pipe when that is worthwhile, or a
//! `writev` of header and payload otherwise. A failed splice is logged and
//! the response goes out through `writev` instead.

use super::mount::Channel;
use super::options::MountOptions;
use super::pipe::{max_pipe_size, page_size, splice_supported, PipeSource};
use super::response::{OutgoingResponse, Payload, Status};
use super::splice;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::uio;
use nix::unistd;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;

/// Writes responses to one channel. Safe to share between threads.
pub struct ChannelWriter {
    channel: Arc<Channel>,
    pool: Arc<dyn PipeSource>,
    can_splice: bool,
    min_splice_size: usize,
    max_pipe_size: usize,
}

impl ChannelWriter {
    /// Creates a writer for `channel`, splicing when the platform allows it.
    pub fn new(channel: Arc<Channel>, pool: Arc<dyn PipeSource>, options: &MountOptions) -> Self {
        Self {
            channel,
            pool,
            can_splice: splice_supported(),
            min_splice_size: options.min_splice_size,
            max_pipe_size: max_pipe_size(),
        }
    }

    /// Overrides whether the splice path may be used.
    pub fn with_splice(mut self, enabled: bool) -> Self {
        self.can_splice = enabled;
        self
    }

    /// Whether the splice path may be used.
    pub fn can_splice(&self) -> bool {
        self.can_splice
    }

    /// The channel this writer targets.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Encodes the header from the response and writes it.
    pub fn send(&self, response: &mut OutgoingResponse) -> Status {
        let header = response.encode_header();
        self.write(response, &header)
    }

    fn should_splice(&self, payload: &Payload) -> bool {
        let size = payload.len();
        self.can_splice
            && size < self.max_pipe_size.saturating_sub(2 * page_size())
            && (payload.is_file() || (self.min_splice_size > 0 && size >= self.min_splice_size))
    }

    /// Writes `header` and the response payload to the channel and marks the
    /// response done.
    pub fn write(&self, response: &mut OutgoingResponse, header: &[u8]) -> Status {
        let fd = self.channel.as_fd();

        if response.payload.is_empty() {
            let status = loop {
                match unistd::write(fd.as_raw_fd(), header) {
                    Err(Errno::EINTR) => continue,
                    Err(e) => break Status::from(e),
                    Ok(_) => break Status::OK,
                }
            };
            response.mark_done();
            return status;
        }

        if self.should_splice(&response.payload) {
            match splice::transfer(self.pool.as_ref(), fd, header, &response.payload) {
                Ok(()) => {
                    response.mark_done();
                    return Status::OK;
                }
                Err(e) => warn!("splice: {}", e),
            }
        }

        let materialized = match &response.payload {
            Payload::File(data) => {
                let mut buf = vec![0u8; data.size()];
                let (n, status) = data.read_into(&mut buf);
                // An error reply carries no body.
                buf.truncate(if status.is_ok() { n } else { 0 });
                Some((buf, status))
            }
            Payload::Slices(_) | Payload::Flat(_) => None,
        };

        let result = match materialized {
            Some((buf, status)) => {
                debug!("materialized {} of {} file bytes", buf.len(), response.payload.len());
                response.status = status;
                response.payload = Payload::Flat(buf);
                let header = response.encode_header();
                uio::writev(fd.as_raw_fd(), &response.payload.io_slices(&header))
            }
            None => uio::writev(fd.as_raw_fd(), &response.payload.io_slices(header)),
        };

        response.mark_done();
        match result {
            Ok(_) => Status::OK,
            Err(e) => Status::from(e),
        }
    }
}
