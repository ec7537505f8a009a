//! Materialization sinks: where extracted entries land.

use std::fs::{self, File, Permissions};
use std::future::Future;
use std::io::{self, IoSlice, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use crate::cpio::FileEntry;

/// Capability set for materializing extracted entries.
///
/// The scheduler is generic over this, so alternative sinks (dry runs,
/// recording test doubles, the decmpfs-compressing writer) slot in without
/// dynamic dispatch. Methods run inside extraction tasks, which are free to
/// block on synchronous syscalls.
pub trait Sink: Send + Sync + 'static {
    /// Create the directory at `entry.name` with its permission bits.
    fn create_dir(&self, entry: &FileEntry) -> impl Future<Output = io::Result<()>> + Send;

    /// Create the regular file at `entry.name` with its full mode and write
    /// the payload. Returns the number of payload bytes written.
    fn create_file(&self, entry: &FileEntry) -> impl Future<Output = io::Result<u64>> + Send;

    /// Hardlink `entry.name` to the previously created `original`.
    fn hardlink(
        &self,
        original: &str,
        entry: &FileEntry,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Create a symlink at `entry.name` pointing at `target`.
    fn symlink(
        &self,
        target: &str,
        entry: &FileEntry,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Set permission bits exactly, without following a final symlink.
    fn chmod(&self, entry: &FileEntry, mode: u32) -> impl Future<Output = io::Result<()>> + Send;
}

/// Plain POSIX materialization under an output root.
pub struct DefaultSink {
    root: PathBuf,
}

impl DefaultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DefaultSink { root: root.into() }
    }

    pub(crate) fn target(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Sink for DefaultSink {
    async fn create_dir(&self, entry: &FileEntry) -> io::Result<()> {
        fs::DirBuilder::new()
            .mode(entry.permissions() & 0o777)
            .create(self.target(&entry.name))
    }

    async fn create_file(&self, entry: &FileEntry) -> io::Result<u64> {
        write_plain(&self.target(&entry.name), entry)
    }

    async fn hardlink(&self, original: &str, entry: &FileEntry) -> io::Result<()> {
        fs::hard_link(self.target(original), self.target(&entry.name))
    }

    async fn symlink(&self, target: &str, entry: &FileEntry) -> io::Result<()> {
        symlink(target, self.target(&entry.name))
    }

    async fn chmod(&self, entry: &FileEntry, mode: u32) -> io::Result<()> {
        chmod_nofollow(&self.target(&entry.name), mode)
    }
}

/// Counts what would be materialized without touching the filesystem.
pub struct DryRunSink;

impl Sink for DryRunSink {
    async fn create_dir(&self, _entry: &FileEntry) -> io::Result<()> {
        Ok(())
    }

    async fn create_file(&self, entry: &FileEntry) -> io::Result<u64> {
        Ok(entry.size())
    }

    async fn hardlink(&self, _original: &str, _entry: &FileEntry) -> io::Result<()> {
        Ok(())
    }

    async fn symlink(&self, _target: &str, _entry: &FileEntry) -> io::Result<()> {
        Ok(())
    }

    async fn chmod(&self, _entry: &FileEntry, _mode: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Create a file, apply its full mode, and write the payload extents.
pub(crate) fn write_plain(path: &Path, entry: &FileEntry) -> io::Result<u64> {
    let mut file = File::create(path)?;
    // fchmod rather than open(2) mode bits: the umask must not strip
    // setuid/setgid/sticky from the archive's modes.
    file.set_permissions(Permissions::from_mode(entry.permissions()))?;
    write_extents(&mut file, entry)
}

/// Scatter-write the payload, extents in stream order.
pub(crate) fn write_extents<W: Write>(writer: &mut W, entry: &FileEntry) -> io::Result<u64> {
    let mut slices: Vec<IoSlice<'_>> = entry
        .data
        .iter()
        .map(|extent| IoSlice::new(extent.bytes()))
        .collect();
    let total = entry.size();
    let mut rest = &mut slices[..];
    while !rest.is_empty() {
        let written = writer.write_vectored(rest)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write payload",
            ));
        }
        IoSlice::advance_slices(&mut rest, written);
    }
    Ok(total)
}

/// chmod that does not follow a final symlink, for sticky-bit fixups.
///
/// Directories and files take the portable path; symlinks need
/// `fchmodat(AT_SYMLINK_NOFOLLOW)`, which some platforms refuse with
/// ENOTSUP (the caller swallows that).
pub(crate) fn chmod_nofollow(path: &Path, mode: u32) -> io::Result<()> {
    if !fs::symlink_metadata(path)?.file_type().is_symlink() {
        return fs::set_permissions(path, Permissions::from_mode(mode));
    }
    let path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let rc = unsafe {
        libc::fchmodat(
            libc::AT_FDCWD,
            path.as_ptr(),
            mode as libc::mode_t,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
