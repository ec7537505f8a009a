//! decmpfs output: per-block LZFSE encoding laid out for HFS+/APFS
//! resource-fork storage.
//!
//! The blob format is an array of little-endian u32 offsets (entry 0 is the
//! table size, entry `i + 1` the end of block `i`) followed by the encoded
//! blocks back to back. The filesystem's decompressor reads it from the
//! resource fork, steered by a 16-byte `com.apple.decmpfs` attribute.

use std::sync::Arc;

use crate::queue::work_queue;

/// Encoding block size (64 KiB), fixed by decmpfs compression type 12.
pub const BLOCK_SIZE: usize = 0x1_0000;

/// `com.apple.decmpfs` magic: "cmpf" stored reversed.
const DECMPFS_MAGIC: [u8; 4] = *b"fpmc";
/// Compression type 12: LZFSE, 64 KiB blocks, payload in the resource fork.
const DECMPFS_TYPE_LZFSE_RSRC: u32 = 0x0000_000C;

/// Extended attribute holding the decmpfs header.
pub const DECMPFS_XATTR: &str = "com.apple.decmpfs";
/// The resource fork, addressed as an extended attribute.
pub const RESOURCE_FORK_XATTR: &str = "com.apple.ResourceFork";

/// The 16-byte `com.apple.decmpfs` attribute for a payload of `size` bytes.
pub fn decmpfs_header(size: u64) -> [u8; 16] {
    let mut header = [0u8; 16];
    header[0..4].copy_from_slice(&DECMPFS_MAGIC);
    header[4..8].copy_from_slice(&DECMPFS_TYPE_LZFSE_RSRC.to_le_bytes());
    header[8..16].copy_from_slice(&size.to_le_bytes());
    header
}

/// Encode `payload` into a decmpfs resource-fork blob.
///
/// Blocks are encoded in parallel, at most `batch` at a time, and assembled
/// in positional order. Returns `None` when compression does not pay: the
/// encoder refused some block, or the table-plus-blocks layout would be no
/// smaller than the payload itself. The caller then stores the payload
/// plain.
pub async fn encode_resource_fork(payload: Arc<Vec<u8>>, batch: usize) -> Option<Vec<u8>> {
    if payload.is_empty() {
        return None;
    }

    let (queue, mut results) = work_queue::<Option<Vec<u8>>>(batch.max(1));
    let source = payload.clone();
    let submitter = tokio::spawn(async move {
        let mut start = 0usize;
        while start < source.len() {
            let end = (start + BLOCK_SIZE).min(source.len());
            let block_source = source.clone();
            let submitted = queue
                .submit_blocking(move || encode_block(&block_source[start..end]))
                .await;
            if submitted.is_err() {
                // The consumer bailed out after an incompressible block.
                break;
            }
            start = end;
        }
    });

    let mut blocks: Vec<Vec<u8>> = Vec::new();
    let mut gave_up = false;
    while let Some(block) = results.next().await {
        match block {
            Some(block) => blocks.push(block),
            None => {
                gave_up = true;
                break;
            }
        }
    }
    drop(results);
    let _ = submitter.await;
    if gave_up {
        return None;
    }

    let table_size = (blocks.len() + 1) * 4;
    let total = table_size + blocks.iter().map(Vec::len).sum::<usize>();
    if total >= payload.len() {
        return None;
    }

    let mut out = Vec::with_capacity(total);
    let mut offset = table_size as u32;
    out.extend_from_slice(&offset.to_le_bytes());
    for block in &blocks {
        offset += block.len() as u32;
        out.extend_from_slice(&offset.to_le_bytes());
    }
    for block in &blocks {
        out.extend_from_slice(block);
    }
    Some(out)
}

/// LZFSE-encode one block, or `None` when the encoder gives up (the output
/// would not fit the slack buffer).
fn encode_block(block: &[u8]) -> Option<Vec<u8>> {
    let mut out = vec![0u8; block.len() + block.len() / 16];
    match lzfse::encode_buffer(block, &mut out) {
        Ok(encoded) if encoded > 0 && encoded < out.len() => {
            out.truncate(encoded);
            Some(out)
        }
        _ => None,
    }
}

#[cfg(target_os = "macos")]
pub use compressed::CompressedSink;

#[cfg(target_os = "macos")]
mod compressed {
    use std::fs::{File, Permissions};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::{DECMPFS_XATTR, RESOURCE_FORK_XATTR, decmpfs_header, encode_resource_fork};
    use crate::cpio::FileEntry;
    use crate::sink::{DefaultSink, Sink};

    /// Sink that stores regular files decmpfs-compressed, falling back to a
    /// plain write whenever compression does not pay or any step fails.
    pub struct CompressedSink {
        plain: DefaultSink,
        batch: usize,
    }

    impl CompressedSink {
        pub fn new(root: impl Into<PathBuf>, batch: usize) -> Self {
            CompressedSink {
                plain: DefaultSink::new(root),
                batch,
            }
        }

        fn write_compressed(&self, path: &Path, entry: &FileEntry, fork: &[u8]) -> io::Result<()> {
            // Data fork stays empty; the payload lives in the resource fork.
            let file = File::create(path)?;
            file.set_permissions(Permissions::from_mode(entry.permissions()))?;
            drop(file);
            xattr::set(path, DECMPFS_XATTR, &decmpfs_header(entry.size()))?;
            xattr::set(path, RESOURCE_FORK_XATTR, fork)?;
            chflags_compressed(path)
        }
    }

    impl Sink for CompressedSink {
        async fn create_dir(&self, entry: &FileEntry) -> io::Result<()> {
            self.plain.create_dir(entry).await
        }

        async fn create_file(&self, entry: &FileEntry) -> io::Result<u64> {
            let payload = Arc::new(entry.payload());
            if let Some(fork) = encode_resource_fork(payload, self.batch).await {
                let path = self.plain.target(&entry.name);
                match self.write_compressed(&path, entry, &fork) {
                    Ok(()) => return Ok(entry.size()),
                    Err(err) => {
                        tracing::warn!(name = %entry.name, %err, "decmpfs write failed, storing plain");
                        let _ = xattr::remove(&path, DECMPFS_XATTR);
                        let _ = xattr::remove(&path, RESOURCE_FORK_XATTR);
                    }
                }
            }
            self.plain.create_file(entry).await
        }

        async fn hardlink(&self, original: &str, entry: &FileEntry) -> io::Result<()> {
            self.plain.hardlink(original, entry).await
        }

        async fn symlink(&self, target: &str, entry: &FileEntry) -> io::Result<()> {
            self.plain.symlink(target, entry).await
        }

        async fn chmod(&self, entry: &FileEntry, mode: u32) -> io::Result<()> {
            self.plain.chmod(entry, mode).await
        }
    }

    fn chflags_compressed(path: &Path) -> io::Result<()> {
        let path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let rc = unsafe { libc::chflags(path.as_ptr(), libc::UF_COMPRESSED) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
