//! Parallel extractor for Xcode `.xip` archives.
//!
//! A `.xip` is an onion: a XAR container whose `Content` entry is a PBZX
//! stream of LZMA-compressed chunks, which decode into a CPIO byte stream
//! describing the actual tree. Every layer is embarrassingly parallel
//! except for the strict byte order the CPIO parser needs, so the pipeline
//! decodes chunks in parallel while preserving order, parses entries with
//! zero-copy payload slices into the chunk buffers, and materializes each
//! entry as soon as its parent directory (and, for hardlinks, its origin)
//! exists.
//!
//! Use [`extract_with_sink`] with a [`DefaultSink`] for plain extraction,
//! [`DryRunSink`] to schedule without touching the filesystem, or (on
//! macOS) [`CompressedSink`] for transparently decmpfs-compressed output.

pub mod cpio;
pub mod decmpfs;
mod error;
mod extract;
mod input;
mod lzma;
pub mod pbzx;
mod queue;
mod sink;
mod xar;

pub use cpio::{Extent, FileEntry};
#[cfg(target_os = "macos")]
pub use decmpfs::CompressedSink;
pub use decmpfs::{BLOCK_SIZE, decmpfs_header, encode_resource_fork};
pub use error::{Error, Result};
pub use extract::{ExtractOptions, ExtractProgress, ExtractStats, extract_with_sink};
pub use input::MappedArchive;
pub use pbzx::{Chunk, ChunkStream};
pub use queue::{Completion, CompletionGuard, Results, WorkQueue, completion, work_queue};
pub use sink::{DefaultSink, DryRunSink, Sink};
