//! Paths, helper names and protocol constants.

// Kernel device and mount table
/// Kernel device node the channel is opened on.
pub const FUSE_DEVICE: &str = "/dev/fuse";
/// System mount table updated after a direct mount.
pub const MTAB_PATH: &str = "/etc/mtab";
/// Prefix of mountpoints naming an already open descriptor.
pub const MAGIC_FD_DIR: &str = "/dev/fd/";

// Direct mount data
/// Mode of the mount root, a directory.
pub const ROOT_MODE: &str = "rootmode=40000";
/// Owner of the mount as seen by the kernel.
pub const ROOT_USER_ID: &str = "user_id=0";
/// Group of the mount as seen by the kernel.
pub const ROOT_GROUP_ID: &str = "group_id=0";
/// Prepended to the filesystem name to form the mount type.
pub const FS_TYPE_PREFIX: &str = "fuse.";
/// Options that only make sense to the setuid helper.
pub const HELPER_ONLY_OPTIONS: &[&str] = &["nonempty", "allow_root"];

// Helper binaries
/// Helper names, in lookup order.
pub const FUSERMOUNT_BINARIES: &[&str] = &["fusermount3", "fusermount"];
/// Searched when the helper is not on `PATH`.
pub const HELPER_FALLBACK_DIR: &str = "/bin";
/// Runs the mount table update.
pub const MOUNT_BINARY: &str = "/bin/mount";

/// Descriptor slot the helper finds its socket end on.
pub const COMM_FD: i32 = 3;
/// Environment variable naming [`COMM_FD`] to the helper.
pub const COMM_FD_ENV: &str = "_FUSE_COMMFD";

// Splice
/// Kernel limit on unprivileged pipe capacity.
pub const PIPE_MAX_SIZE_PATH: &str = "/proc/sys/fs/pipe-max-size";
/// Used when [`PIPE_MAX_SIZE_PATH`] cannot be read.
pub const DEFAULT_PIPE_MAX_SIZE: usize = 1 << 20;
/// Used when the page size cannot be queried.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Size of `struct fuse_out_header`.
pub const OUT_HEADER_LEN: usize = 16;

/// Filesystem name when none is configured.
pub const DEFAULT_FS_NAME: &str = "fusewire";
