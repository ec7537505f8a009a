//! PBZX chunk stream: Apple's chunked LZMA framing.
//!
//! After the 4-byte magic and a big-endian reference chunk size, the stream
//! is a run of `(decompressed size, compressed size, payload)` records. A
//! record whose compressed size equals the reference chunk size is stored
//! uncompressed; everything else is a complete XZ frame. The final record
//! is the first one whose decompressed size falls short of the reference.

use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::input::MappedArchive;
use crate::lzma;
use crate::queue::{Results, WorkQueue, work_queue};

/// First bytes of every compressed chunk payload (the XZ frame magic).
const XZ_MAGIC: [u8; 4] = [0xFD, b'7', b'z', b'X'];

/// One decoded PBZX chunk.
///
/// Chunks stored uncompressed borrow the mapped archive and cost nothing to
/// release; decompressed chunks own their buffer. Files keep chunks alive
/// through the `Arc`s in their payload extents.
pub enum Chunk {
    Mapped {
        archive: Arc<MappedArchive>,
        range: Range<usize>,
    },
    Owned(Box<[u8]>),
}

impl Chunk {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Chunk::Mapped { archive, range } => &archive.bytes()[range.clone()],
            Chunk::Owned(buffer) => buffer,
        }
    }

    /// True when the chunk owns a decompressed buffer rather than borrowing
    /// the archive map.
    #[inline]
    pub fn owned(&self) -> bool {
        matches!(self, Chunk::Owned(_))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered stream of decoded chunks.
pub struct ChunkStream {
    results: Results<Result<Arc<Chunk>>>,
}

impl ChunkStream {
    /// Next chunk in archive order; `None` after the final chunk.
    pub async fn next(&mut self) -> Option<Result<Arc<Chunk>>> {
        self.results.next().await
    }

    #[cfg(test)]
    pub(crate) fn from_buffers(buffers: Vec<Vec<u8>>) -> ChunkStream {
        let (queue, results) = work_queue(buffers.len().max(1));
        tokio::spawn(async move {
            for buffer in buffers {
                let chunk = Arc::new(Chunk::Owned(buffer.into_boxed_slice()));
                if queue.submit(async move { Ok(chunk) }).await.is_err() {
                    break;
                }
            }
        });
        ChunkStream { results }
    }
}

/// Split the `content` range into PBZX records and decode them in parallel.
///
/// At most `batch` decodes run concurrently and chunks are yielded in
/// submission order, so the CPIO parser downstream sees bytes in archive
/// order. Malformed framing is reported in-band, in order, as the stream's
/// final item.
pub fn decode_chunks(
    archive: Arc<MappedArchive>,
    content: Range<usize>,
    batch: usize,
) -> ChunkStream {
    let (queue, results) = work_queue(batch);
    tokio::spawn(async move {
        if let Err(err) = walk_records(&archive, content, &queue).await {
            let _ = queue.submit(async move { Err(err) }).await;
        }
    });
    ChunkStream { results }
}

async fn walk_records(
    archive: &Arc<MappedArchive>,
    content: Range<usize>,
    queue: &WorkQueue<Result<Arc<Chunk>>>,
) -> Result<()> {
    let bytes = &archive.bytes()[content.clone()];
    if bytes.len() < 12 {
        return Err(Error::MalformedArchive("pbzx stream shorter than its header"));
    }
    // The locator verified the magic; next is the reference chunk size.
    let chunk_size = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
    if chunk_size == 0 {
        return Err(Error::MalformedArchive("pbzx chunk size is zero"));
    }

    let mut pos = 12usize;
    loop {
        if pos == bytes.len() {
            // Payload was an exact multiple of the chunk size.
            break;
        }
        if bytes.len() - pos < 16 {
            return Err(Error::MalformedArchive("truncated pbzx record header"));
        }
        let decompressed_size = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
        let compressed_size = u64::from_be_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
        pos += 16;

        if decompressed_size > chunk_size {
            return Err(Error::MalformedArchive(
                "pbzx record larger than the reference chunk size",
            ));
        }
        let payload_len = usize::try_from(compressed_size)
            .map_err(|_| Error::MalformedArchive("pbzx record size overflows this platform"))?;
        if bytes.len() - pos < payload_len {
            return Err(Error::MalformedArchive(
                "pbzx record payload extends past the stream",
            ));
        }
        let payload = content.start + pos..content.start + pos + payload_len;
        pos += payload_len;

        let archive = archive.clone();
        queue
            .submit_blocking(move || decode_record(archive, payload, decompressed_size, chunk_size))
            .await?;

        if decompressed_size != chunk_size {
            // The short chunk is the last one.
            break;
        }
    }
    Ok(())
}

fn decode_record(
    archive: Arc<MappedArchive>,
    payload: Range<usize>,
    decompressed_size: u64,
    chunk_size: u64,
) -> Result<Arc<Chunk>> {
    if payload.len() as u64 == chunk_size {
        // Stored chunk: borrow the map, no allocation.
        return Ok(Arc::new(Chunk::Mapped {
            archive,
            range: payload,
        }));
    }

    let bytes = &archive.bytes()[payload.clone()];
    if bytes.len() < 4 || bytes[..4] != XZ_MAGIC {
        return Err(Error::MalformedArchive(
            "compressed pbzx chunk is not an XZ stream",
        ));
    }
    let size = usize::try_from(decompressed_size)
        .map_err(|_| Error::MalformedArchive("pbzx record size overflows this platform"))?;
    let buffer = lzma::decompress_chunk(bytes, size)?;
    Ok(Arc::new(Chunk::Owned(buffer)))
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    const CHUNK: usize = 256;

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        xz2::read::XzEncoder::new(data, 6)
            .read_to_end(&mut encoded)
            .unwrap();
        encoded
    }

    /// A pbzx stream from `pieces`, each at most `CHUNK` long; only the
    /// last piece may fall short. `compress[i]` selects XZ framing for
    /// piece `i`, otherwise it is stored (which requires a full chunk).
    fn pbzx(pieces: &[&[u8]], compress: &[bool]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"pbzx");
        out.extend_from_slice(&(CHUNK as u64).to_be_bytes());
        for (piece, &compress) in pieces.iter().zip(compress) {
            let payload = if compress { xz(piece) } else { piece.to_vec() };
            out.extend_from_slice(&(piece.len() as u64).to_be_bytes());
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }

    fn mapped(stream: &[u8]) -> (tempfile::NamedTempFile, Arc<MappedArchive>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(stream).unwrap();
        file.flush().unwrap();
        let archive = MappedArchive::open(file.path()).unwrap();
        (file, archive)
    }

    async fn collect(mut stream: ChunkStream) -> Result<Vec<Arc<Chunk>>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stored_chunks_borrow_the_map() {
        let full = [0xABu8; CHUNK];
        let stream = pbzx(&[&full, b"tail"], &[false, true]);
        let (_file, archive) = mapped(&stream);
        let chunks = collect(decode_chunks(archive, 0..stream.len(), 4))
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].owned());
        assert_eq!(chunks[0].bytes(), &full);
        assert!(chunks[1].owned());
        assert_eq!(chunks[1].bytes(), b"tail");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chunks_arrive_in_archive_order() {
        let pieces: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; CHUNK]).collect();
        let mut refs: Vec<&[u8]> = pieces.iter().map(Vec::as_slice).collect();
        let last = b"short".to_vec();
        refs.push(&last);
        let compress = vec![true; refs.len()];

        let stream = pbzx(&refs, &compress);
        let (_file, archive) = mapped(&stream);
        let chunks = collect(decode_chunks(archive, 0..stream.len(), 3))
            .await
            .unwrap();

        let decoded: Vec<u8> = chunks.iter().flat_map(|c| c.bytes().to_vec()).collect();
        let expected: Vec<u8> = refs.iter().flat_map(|p| p.to_vec()).collect();
        assert_eq!(decoded, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn truncated_record_header_is_fatal() {
        let mut stream = pbzx(&[b"short"], &[true]);
        stream.truncate(20);
        let (_file, archive) = mapped(&stream);
        let mut chunks = decode_chunks(archive, 0..20, 2);
        assert!(matches!(
            chunks.next().await,
            Some(Err(Error::MalformedArchive(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compressed_chunk_without_xz_magic_is_fatal() {
        let mut out = Vec::new();
        out.extend_from_slice(b"pbzx");
        out.extend_from_slice(&(CHUNK as u64).to_be_bytes());
        out.extend_from_slice(&8u64.to_be_bytes());
        out.extend_from_slice(&8u64.to_be_bytes());
        out.extend_from_slice(b"not-lzma");

        let (_file, archive) = mapped(&out);
        let mut chunks = decode_chunks(archive, 0..out.len(), 2);
        assert!(matches!(
            chunks.next().await,
            Some(Err(Error::MalformedArchive(_)))
        ));
    }
}
