//! Core channel modules.
//! 
//! This module provides the main components of the userspace side of a FUSE
//! mount:
//! 
//! - `constants`: Paths, helper names and protocol constants
//! - `mount`: Establishing the kernel channel
//! - `fusermount`: Mounting through the setuid helper
//! - `unmount`: Tearing a mount down
//! - `pipe`, `splice`, `writer`: Delivering responses to the kernel
//! - `session`: Tying the pieces together for one mountpoint

pub mod ancillary;
pub mod constants;
pub mod error;
pub mod fusermount;
pub mod mount;
pub mod options;
/// Reusable pipe pairs and platform probing for the splice path.
pub mod pipe;
pub mod response;
pub mod session;
pub mod splice;
pub mod unmount;
pub mod writer;
