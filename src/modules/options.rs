//! Mount configuration.
//!
//! `MountOptions` is read-only once a session starts. It can be built in code
//! or loaded from a JSON file; every field has a default so a file only needs
//! to name what it changes.

use super::constants::DEFAULT_FS_NAME;
use anyhow::{Context, Result};
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Options controlling how the kernel channel is established and used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Filesystem subtype; the kernel sees `fuse.<name>`.
    pub name: String,
    /// Source shown in the mount table. Falls back to `name` when empty.
    pub fs_name: String,
    /// Raw `-o` style option strings.
    pub options: Vec<String>,
    /// Let users other than the mounting user access the filesystem.
    pub allow_other: bool,
    /// Try `mount(2)` directly before using the helper.
    pub direct_mount: bool,
    /// Do not fall back to the helper when the direct mount fails.
    pub direct_mount_strict: bool,
    /// Raw `MS_*` flags for the direct mount; `0` means `MS_NOSUID | MS_NODEV`.
    pub direct_mount_flags: u64,
    /// Smallest in-memory payload worth splicing; `0` disables splicing for
    /// in-memory payloads.
    pub min_splice_size: usize,
    /// Log the mount calls and helper command lines.
    pub debug: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_FS_NAME.to_string(),
            fs_name: String::new(),
            options: Vec::new(),
            allow_other: false,
            direct_mount: false,
            direct_mount_strict: false,
            direct_mount_flags: 0,
            min_splice_size: 0,
            debug: false,
        }
    }
}

impl MountOptions {
    /// Loads options from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading mount options from {}", path.display()))?;
        let options = serde_json::from_str(&content)
            .with_context(|| format!("parsing mount options in {}", path.display()))?;
        Ok(options)
    }

    /// Source string for the mount table.
    pub fn source(&self) -> &str {
        if self.fs_name.is_empty() {
            &self.name
        } else {
            &self.fs_name
        }
    }

    /// Filesystem type passed to `mount(2)`.
    pub fn fs_type(&self) -> String {
        format!("{}{}", super::constants::FS_TYPE_PREFIX, self.name)
    }

    /// Flags for the direct mount.
    pub fn mount_flags(&self) -> MsFlags {
        if self.direct_mount_flags != 0 {
            MsFlags::from_bits_truncate(self.direct_mount_flags as _)
        } else {
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV
        }
    }

    /// Options handed to the setuid helper after `-o`.
    pub fn options_strings(&self) -> Vec<String> {
        let mut r = self.options.clone();
        if self.allow_other {
            r.push("allow_other".to_string());
        }
        if !self.fs_name.is_empty() {
            r.push(format!("fsname={}", escape_option(&self.fs_name)));
        }
        if !self.name.is_empty() {
            r.push(format!("subtype={}", escape_option(&self.name)));
        }
        r
    }
}

/// Escapes the separators the helper splits option lists on.
fn escape_option(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_flags_are_nosuid_nodev() {
        let opts = MountOptions::default();
        assert_eq!(opts.mount_flags(), MsFlags::MS_NOSUID | MsFlags::MS_NODEV);

        let opts = MountOptions {
            direct_mount_flags: MsFlags::MS_RDONLY.bits() as u64,
            ..Default::default()
        };
        assert_eq!(opts.mount_flags(), MsFlags::MS_RDONLY);
    }

    #[test]
    fn test_source_falls_back_to_name() {
        let mut opts = MountOptions::default();
        assert_eq!(opts.source(), DEFAULT_FS_NAME);
        opts.fs_name = "backing".to_string();
        assert_eq!(opts.source(), "backing");
        assert_eq!(opts.fs_type(), "fuse.fusewire");
    }

    #[test]
    fn test_options_strings() {
        let opts = MountOptions {
            name: "demo".to_string(),
            fs_name: "a,b\\c".to_string(),
            options: vec!["ro".to_string()],
            allow_other: true,
            ..Default::default()
        };
        assert_eq!(
            opts.options_strings(),
            vec!["ro", "allow_other", "fsname=a\\,b\\\\c", "subtype=demo"]
        );
    }

    #[test]
    fn test_load_partial_json() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(file, r#"{{"name": "cfg", "min_splice_size": 4096, "direct_mount": true}}"#)?;

        let opts = MountOptions::from_json_file(file.path())?;
        assert_eq!(opts.name, "cfg");
        assert_eq!(opts.min_splice_size, 4096);
        assert!(opts.direct_mount);
        assert!(!opts.allow_other);
        assert!(opts.options.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_rejects_garbage() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(file, "not json")?;
        assert!(MountOptions::from_json_file(file.path()).is_err());
        Ok(())
    }
}
