//! Session lifecycle: mount, write responses, unmount.
//!
//! A `Session` owns the kernel channel for one mountpoint together with the
//! `ChannelWriter` bound to it. Sessions are identified by a random UUID that
//! shows up in every log line they produce.

use super::mount::{self, Channel, MountStrategy};
use super::options::MountOptions;
use super::pipe::PipeSource;
use super::response::{OutgoingResponse, Status};
use super::unmount;
use super::writer::ChannelWriter;
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Serialisable snapshot of a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique identifier for the session
    pub id: String,
    /// Process ID owning the channel
    pub pid: i32,
    /// Where the filesystem is mounted
    pub mount_point: PathBuf,
    /// How the channel was obtained
    pub strategy: MountStrategy,
    /// Channel descriptor number
    pub fd: i32,
}

/// A mounted filesystem and the writer that answers the kernel.
///
/// # Example
///
/// ```no_run
/// use fusewire::{MountOptions, PipePool, Session};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// # fn main() -> anyhow::Result<()> {
/// let session = Session::mount(
///     Path::new("/tmp/mnt"),
///     MountOptions::default(),
///     Arc::new(PipePool::new()),
/// )?;
/// println!("{}", serde_json::to_string(&session.info())?);
/// session.unmount()?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    id: Uuid,
    options: MountOptions,
    channel: Arc<Channel>,
    writer: Arc<ChannelWriter>,
    owns_mount: bool,
}

impl Session {
    /// Establishes the channel for `mount_point` and binds a writer to it.
    ///
    /// # Errors
    ///
    /// Returns an error if none of the mount strategies produced a channel.
    pub fn mount(
        mount_point: &Path,
        options: MountOptions,
        pool: Arc<dyn PipeSource>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let channel = mount::establish(mount_point, &options, || {
            info!("[{}] Channel ready at {}", id, mount_point.display());
        })
        .with_context(|| format!("mounting {}", mount_point.display()))?;

        let mut session = Self::with_id(id, channel, options, pool);
        session.owns_mount = true;
        Ok(session)
    }

    /// Wraps a channel that was established elsewhere. Dropping such a
    /// session closes the channel but never unmounts.
    pub fn from_channel(channel: Channel, options: MountOptions, pool: Arc<dyn PipeSource>) -> Self {
        Self::with_id(Uuid::new_v4(), channel, options, pool)
    }

    fn with_id(id: Uuid, channel: Channel, options: MountOptions, pool: Arc<dyn PipeSource>) -> Self {
        let channel = Arc::new(channel);
        let writer = Arc::new(ChannelWriter::new(Arc::clone(&channel), pool, &options));
        info!(
            "[{}] Session started on {} (splice: {})",
            id,
            channel.mount_point().display(),
            writer.can_splice()
        );
        Self {
            id,
            options,
            channel,
            writer,
            owns_mount: false,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Options the session was created with.
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// The kernel channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// A handle to the writer, for use from worker threads.
    pub fn writer(&self) -> Arc<ChannelWriter> {
        Arc::clone(&self.writer)
    }

    /// Sends one response on this session's channel.
    pub fn send(&self, response: &mut OutgoingResponse) -> Status {
        self.writer.send(response)
    }

    /// Snapshot for display or persistence.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.to_string(),
            pid: std::process::id() as i32,
            mount_point: self.channel.mount_point().to_path_buf(),
            strategy: self.channel.strategy(),
            fd: self.channel.as_raw_fd(),
        }
    }

    /// Blocks until SIGINT or SIGTERM arrives and returns the signal number.
    pub fn wait_for_signal(&self) -> Result<i32> {
        let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
        info!("[{}] Waiting for shutdown signal...", self.id);
        let sig = signals
            .forever()
            .next()
            .ok_or_else(|| anyhow!("signal stream closed"))?;
        info!("[{}] Received signal {}", self.id, sig);
        Ok(sig)
    }

    /// Unmounts the filesystem and closes the channel.
    pub fn unmount(mut self) -> Result<()> {
        let mount_point = self.channel.mount_point().to_path_buf();
        unmount::unmount(&mount_point, &self.options)
            .with_context(|| format!("unmounting {}", mount_point.display()))?;
        self.owns_mount = false;
        info!("[{}] Unmounted {}", self.id, mount_point.display());
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.owns_mount {
            warn!(
                "[{}] Session dropped while {} is still mounted",
                self.id,
                self.channel.mount_point().display()
            );
        }
    }
}
