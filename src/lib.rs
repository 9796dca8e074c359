#![doc(html_root_url = "https://docs.rs/fusewire/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! fusewire: the kernel-facing plumbing of a FUSE server
//!
//! Establishes the `/dev/fuse` channel for a mountpoint, delivers replies to
//! the kernel with as few copies as the platform allows, and tears the mount
//! down again. Linux only.
//!
//! ## Features
//!
//! - Direct `mount(2)`, `/dev/fd/N` magic mountpoints and the setuid
//!   `fusermount` helper, tried in that order
//! - Descriptor passing over `SCM_RIGHTS` with a bounds-checked decoder
//! - Zero-copy replies through pooled pipes and `splice(2)`, falling back to
//!   `writev(2)` whenever splicing does not work out
//! - JSON-loadable mount options
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fusewire::{MountOptions, OutHeader, OutgoingResponse, Payload, PipePool, Session};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let session = Session::mount(
//!     Path::new("/tmp/mnt"),
//!     MountOptions::default(),
//!     Arc::new(PipePool::new()),
//! )?;
//!
//! // Answer request 42 with four bytes
//! let mut reply = OutgoingResponse::new(OutHeader { unique: 42 }, Payload::Flat(b"pong".to_vec()));
//! let status = session.send(&mut reply);
//! assert!(status.is_ok());
//!
//! session.unmount()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Mount strategies
//!
//! - `Direct`: opt-in through `MountOptions::direct_mount`, needs privileges
//! - `MagicFd`: the mountpoint is `/dev/fd/N` and the caller already mounted `N`
//! - `Fusermount`: the helper mounts and passes the descriptor back

pub mod modules;

pub use modules::error::{AncillaryError, HelperError, MountError, TransferError, UnmountError};
pub use modules::mount::{establish, Channel, MountStrategy};
pub use modules::options::MountOptions;
pub use modules::pipe::{PipePair, PipePool, PipeSource};
pub use modules::response::{
    Completion, FileData, FileRange, HeaderEncoder, OutHeader, OutgoingResponse, Payload, Status,
};
pub use modules::session::{Session, SessionInfo};
pub use modules::unmount::unmount;
pub use modules::writer::ChannelWriter;
