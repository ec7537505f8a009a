//! CPIO (odc) parsing over the ordered chunk stream.
//!
//! The odc flavour is all ASCII: a 76-byte header of fixed-width octal
//! fields, a NUL-terminated name, then the raw payload. Entries arrive in
//! tree order, directories before their contents and hardlink originals
//! before their aliases; the scheduler leans on that.

use std::ops::Range;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::pbzx::{Chunk, ChunkStream};

const MAGIC: &[u8; 6] = b"070707";
const HEADER_LEN: usize = 76;
const TRAILER: &str = "TRAILER!!!";

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_ISVTX: u32 = 0o001000;

/// A contiguous view into one chunk's buffer.
///
/// Extents keep their chunk alive; a payload that spans a chunk boundary
/// holds one extent per chunk involved, in stream order.
#[derive(Clone)]
pub struct Extent {
    chunk: Arc<Chunk>,
    range: Range<usize>,
}

impl Extent {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.chunk.bytes()[self.range.clone()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// The chunk backing this extent.
    #[inline]
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }
}

/// One parsed CPIO entry.
pub struct FileEntry {
    pub dev: u64,
    pub ino: u64,
    /// File-type bits, permission bits and sticky, as stored.
    pub mode: u32,
    /// Path relative to the extraction root, no trailing slash.
    pub name: String,
    /// Payload as zero-copy slices into the decoded chunks.
    pub data: Vec<Extent>,
}

impl FileEntry {
    /// File type bits of `mode`.
    #[inline]
    pub fn kind(&self) -> u32 {
        self.mode & S_IFMT
    }

    /// Permission bits, including setuid/setgid/sticky.
    #[inline]
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Total payload length.
    pub fn size(&self) -> u64 {
        self.data.iter().map(|extent| extent.len() as u64).sum()
    }

    /// The payload, concatenated. Symlink targets and the compression
    /// encoder need it contiguous; plain writes go through the extents.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for extent in &self.data {
            out.extend_from_slice(extent.bytes());
        }
        out
    }

    /// Hardlink identity key.
    #[inline]
    pub fn identifier(&self) -> (u64, u64) {
        (self.dev, self.ino)
    }
}

/// Parse the chunk stream as odc CPIO and emit entries in archive order.
///
/// The returned channel is bounded at `capacity`; the parser suspends when
/// the scheduler falls behind. A fatal parse error is delivered in-band and
/// terminates the stream.
pub fn parse_entries(chunks: ChunkStream, capacity: usize) -> mpsc::Receiver<Result<FileEntry>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let mut source = ByteSource::new(chunks);
        loop {
            match next_entry(&mut source).await {
                Ok(Some(entry)) => {
                    if tx.send(Ok(entry)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });
    rx
}

async fn next_entry(source: &mut ByteSource) -> Result<Option<FileEntry>> {
    let header = source.read(HEADER_LEN).await?;
    if &header[..6] != MAGIC {
        return Err(Error::MalformedArchive("bad cpio entry magic"));
    }
    let dev = octal(&header[6..12])?;
    let ino = octal(&header[12..18])?;
    let mode = octal(&header[18..24])? as u32;
    // uid, gid, nlink, rdev (24..48) and mtime (48..59) are dropped:
    // extracted entries belong to the invoking user.
    let namesize = usize::try_from(octal(&header[59..65])?)
        .map_err(|_| Error::MalformedArchive("cpio name size overflows this platform"))?;
    let filesize = usize::try_from(octal(&header[65..76])?)
        .map_err(|_| Error::MalformedArchive("cpio file size overflows this platform"))?;

    if namesize == 0 {
        return Err(Error::MalformedArchive("cpio entry has an empty name"));
    }
    let raw_name = source.read(namesize).await?;
    // C-string semantics: the stored name ends at the first NUL.
    let end = raw_name
        .iter()
        .position(|&byte| byte == 0)
        .ok_or(Error::MalformedArchive("cpio name is not NUL-terminated"))?;
    let name = std::str::from_utf8(&raw_name[..end])
        .map_err(|_| Error::MalformedArchive("cpio name is not UTF-8"))?
        .to_string();

    if name == TRAILER {
        return Ok(None);
    }

    let data = source.extents(filesize).await?;
    Ok(Some(FileEntry {
        dev,
        ino,
        mode,
        name,
        data,
    }))
}

fn octal(field: &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for &byte in field {
        if !byte.is_ascii_digit() || byte > b'7' {
            return Err(Error::MalformedArchive("non-octal digit in cpio header"));
        }
        value = value * 8 + u64::from(byte - b'0');
    }
    Ok(value)
}

/// Pull-based byte source over the ordered chunk stream, carrying a
/// position across chunk boundaries.
struct ByteSource {
    chunks: ChunkStream,
    current: Option<Arc<Chunk>>,
    pos: usize,
}

impl ByteSource {
    fn new(chunks: ChunkStream) -> Self {
        ByteSource {
            chunks,
            current: None,
            pos: 0,
        }
    }

    /// The chunk the position currently points into, pulling the next chunk
    /// as needed. `None` on clean end of stream.
    async fn ensure(&mut self) -> Result<Option<Arc<Chunk>>> {
        loop {
            if let Some(chunk) = &self.current
                && self.pos < chunk.len()
            {
                return Ok(Some(chunk.clone()));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => {
                    self.current = Some(chunk);
                    self.pos = 0;
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(None),
            }
        }
    }

    /// Read exactly `len` bytes into a fresh buffer.
    async fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let Some(chunk) = self.ensure().await? else {
                return Err(Error::MalformedArchive("cpio stream ended inside an entry"));
            };
            let take = (len - out.len()).min(chunk.len() - self.pos);
            out.extend_from_slice(&chunk.bytes()[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    /// Capture exactly `len` bytes as zero-copy extents.
    async fn extents(&mut self, len: usize) -> Result<Vec<Extent>> {
        let mut out = Vec::new();
        let mut remaining = len;
        while remaining > 0 {
            let Some(chunk) = self.ensure().await? else {
                return Err(Error::MalformedArchive("cpio stream ended inside an entry"));
            };
            let take = remaining.min(chunk.len() - self.pos);
            out.push(Extent {
                chunk,
                range: self.pos..self.pos + take,
            });
            self.pos += take;
            remaining -= take;
        }
        Ok(out)
    }
}
