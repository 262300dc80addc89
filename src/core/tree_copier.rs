use crate::logging::LogThrottle;
use filetime::FileTime;
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Source is not a readable directory: {0}")]
    SourceNotDirectory(PathBuf),

    #[error("Device appears to have been removed at {path}: {source}")]
    DeviceRemoved {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CopyError {
    fn at(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        if is_device_removed_error(&source) {
            Self::DeviceRemoved { path, source }
        } else {
            Self::Io { path, source }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self { sync_files: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    /// Subdirectories created or merged, not counting the destination root
    pub directories: u64,
    pub bytes: u64,
    /// Symlinked directories and special files left out of the mirror
    pub skipped: u64,
}

/// Mirror every file and subdirectory of `source` into `destination`.
///
/// `destination` and its parents are created when missing, an existing tree
/// is merged into and existing files are overwritten. File and directory
/// permissions and timestamps are carried over (best effort, failures are
/// logged at debug level). Symlinks to files are copied as their target's
/// contents; symlinks to directories and special files are skipped.
///
/// The first I/O error aborts the whole copy. Whatever was written up to that
/// point stays in `destination`.
pub fn copy_tree(
    source: &Path,
    destination: &Path,
    options: &CopyOptions,
) -> Result<CopyStats, CopyError> {
    if !source.is_dir() {
        return Err(CopyError::SourceNotDirectory(source.to_path_buf()));
    }

    let span = info_span!(
        "tree_copy",
        source = %source.display(),
        destination = %destination.display()
    );
    let _enter = span.enter();

    info!("Starting tree copy");
    let start_time = Instant::now();

    fs::create_dir_all(destination).map_err(|e| CopyError::at(destination, e))?;

    let mut copier = TreeCopier {
        options,
        stats: CopyStats::default(),
        throttle: LogThrottle::new(PROGRESS_LOG_INTERVAL),
    };
    copier.copy_dir_contents(source, destination)?;

    let stats = copier.stats;
    info!(
        files = stats.files,
        directories = stats.directories,
        bytes = stats.bytes,
        skipped = stats.skipped,
        duration_ms = start_time.elapsed().as_millis() as u64,
        "Tree copy complete"
    );

    Ok(stats)
}

struct TreeCopier<'a> {
    options: &'a CopyOptions,
    stats: CopyStats,
    throttle: LogThrottle,
}

impl TreeCopier<'_> {
    fn copy_dir_contents(&mut self, source: &Path, destination: &Path) -> Result<(), CopyError> {
        let entries = fs::read_dir(source).map_err(|e| CopyError::at(source, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| CopyError::at(source, e))?;
            let path = entry.path();
            let target = destination.join(entry.file_name());

            // Do not follow symlinks yet, they are classified below
            let metadata = fs::symlink_metadata(&path).map_err(|e| CopyError::at(&path, e))?;
            let file_type = metadata.file_type();

            if file_type.is_dir() {
                self.copy_subtree(&path, &target, &metadata)?;
            } else if file_type.is_file() {
                self.copy_file(&path, &target, &metadata)?;
            } else if file_type.is_symlink() {
                self.copy_symlink(&path, &target)?;
            } else {
                warn!(path = %path.display(), "Skipping special file");
                self.stats.skipped += 1;
            }
        }

        Ok(())
    }

    fn copy_subtree(
        &mut self,
        source: &Path,
        destination: &Path,
        metadata: &Metadata,
    ) -> Result<(), CopyError> {
        fs::create_dir_all(destination).map_err(|e| CopyError::at(destination, e))?;
        self.stats.directories += 1;

        self.copy_dir_contents(source, destination)?;

        // Applied last: writing children bumps mtime, and a read-only
        // source directory would otherwise block its own contents
        apply_metadata(destination, metadata);
        Ok(())
    }

    fn copy_symlink(&mut self, link: &Path, destination: &Path) -> Result<(), CopyError> {
        match fs::metadata(link) {
            Ok(target) if target.is_file() => self.copy_file(link, destination, &target),
            Ok(target) if target.is_dir() => {
                warn!(path = %link.display(), "Skipping symlinked directory");
                self.stats.skipped += 1;
                Ok(())
            }
            Ok(_) => {
                warn!(path = %link.display(), "Skipping symlink to special file");
                self.stats.skipped += 1;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %link.display(), "Skipping dangling symlink");
                self.stats.skipped += 1;
                Ok(())
            }
            Err(e) => Err(CopyError::at(link, e)),
        }
    }

    fn copy_file(
        &mut self,
        source: &Path,
        destination: &Path,
        metadata: &Metadata,
    ) -> Result<(), CopyError> {
        let bytes = copy_file_contents(source, destination, self.options.sync_files)?;
        apply_metadata(destination, metadata);

        self.stats.files += 1;
        self.stats.bytes += bytes;

        if self.throttle.should_log() {
            debug!(
                files = self.stats.files,
                bytes = self.stats.bytes,
                current_file = %source.display(),
                "Copy progress"
            );
        }
        Ok(())
    }
}

/// Copy file contents with large buffers, returning the number of bytes written.
fn copy_file_contents(source: &Path, dest: &Path, sync_file: bool) -> Result<u64, CopyError> {
    let source_file = File::open(source).map_err(|e| CopyError::at(source, e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file = create_destination_file(dest).map_err(|e| CopyError::at(dest, e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::at(source, e)),
        };

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| CopyError::at(dest, e))?;

        bytes_written += bytes_read as u64;
    }

    let inner = writer
        .into_inner()
        .map_err(|e| CopyError::at(dest, e.into_error()))?;

    if sync_file {
        inner.sync_all().map_err(|e| CopyError::at(dest, e))?;
    }

    Ok(bytes_written)
}

/// Open `dest` for writing, truncating it.
///
/// A read-only file left by an earlier copy is made owner-writable first;
/// `apply_metadata` puts the source mode back afterwards.
fn create_destination_file(dest: &Path) -> io::Result<File> {
    match File::create(dest) {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            let Ok(existing) = fs::symlink_metadata(dest) else {
                return Err(e);
            };
            if !existing.is_file() {
                return Err(e);
            }

            let mut permissions = existing.permissions();
            permissions.set_mode(permissions.mode() | 0o200);
            fs::set_permissions(dest, permissions)?;
            File::create(dest)
        }
        result => result,
    }
}

/// Preserve permissions and access/modification timestamps.
fn apply_metadata(dest: &Path, source_metadata: &Metadata) {
    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        // Some destination filesystems reject mode changes
        debug!(dest = %dest.display(), error = %e, "Failed to set permissions");
    }

    let atime = FileTime::from_last_access_time(source_metadata);
    let mtime = FileTime::from_last_modification_time(source_metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve timestamps");
    }
}

/// Check if an I/O error indicates the device has been removed
fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound => true,
        ErrorKind::PermissionDenied => false,
        _ => matches!(
            error.raw_os_error(),
            Some(libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::EMEDIUMTYPE)
        ),
    }
}
