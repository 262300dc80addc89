//! Resolving a device node to the place its filesystem is mounted.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::trace;

const PROC_MOUNTS: &str = "/proc/self/mounts";

pub trait MountResolver: Send + Sync {
    /// Current mount point of `devnode`, or `None` if it is not mounted.
    fn mount_point(&self, devnode: &Path) -> Result<Option<PathBuf>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: String,
}

/// Looks devices up in the kernel mount table.
pub struct ProcMounts {
    table: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self {
            table: PathBuf::from(PROC_MOUNTS),
        }
    }
}

impl ProcMounts {
    pub fn with_table(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn entries(&self) -> Result<Vec<MountEntry>> {
        let content = fs::read_to_string(&self.table)
            .with_context(|| format!("Failed to read mount table {}", self.table.display()))?;
        Ok(parse_mount_table(&content))
    }
}

impl MountResolver for ProcMounts {
    fn mount_point(&self, devnode: &Path) -> Result<Option<PathBuf>> {
        let canonical = fs::canonicalize(devnode).ok();

        for entry in self.entries()? {
            // Mount tables may list /dev/disk/by-uuid/... symlinks instead of the node
            let matches = entry.source == devnode
                || canonical
                    .as_deref()
                    .is_some_and(|c| resolves_to(&entry.source, c));

            if matches && is_mount_point(&entry.target) {
                trace!(
                    devnode = %devnode.display(),
                    target = %entry.target.display(),
                    "Found mount"
                );
                return Ok(Some(entry.target));
            }
        }

        Ok(None)
    }
}

/// Pseudo sources like `proc` or `tmpfs` are not paths and never match.
fn resolves_to(source: &Path, canonical: &Path) -> bool {
    source.is_absolute() && fs::canonicalize(source).is_ok_and(|p| p == canonical)
}

/// Treats the device node itself as its mount point when it is a directory.
/// Used by the simulator, where "devices" are plain directories.
pub struct DirectoryMounts;

impl MountResolver for DirectoryMounts {
    fn mount_point(&self, devnode: &Path) -> Result<Option<PathBuf>> {
        Ok(devnode.is_dir().then(|| devnode.to_path_buf()))
    }
}

/// True if `path` is a directory on a different device than its parent,
/// or is the filesystem root.
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    let Ok(parent) = fs::symlink_metadata(path.join("..")) else {
        return false;
    };

    meta.dev() != parent.dev() || meta.ino() == parent.ino()
}

pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: PathBuf::from(unescape(source)),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Decode the octal escapes (`\040` for space etc.) the kernel uses in mount tables.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
