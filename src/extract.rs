//! The pipeline driver and per-file extraction scheduler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::cpio::{self, FileEntry, S_IFDIR, S_IFLNK, S_IFREG, S_ISVTX};
use crate::error::{Error, Result};
use crate::input::MappedArchive;
use crate::pbzx;
use crate::queue::{Completion, WorkQueue, completion, work_queue};
use crate::sink::Sink;
use crate::xar;

/// Per-file jobs admitted at once. CPIO order puts parents before children,
/// so a deeper pool only adds memory pressure, not speed.
const EXTRACT_BATCH: usize = 64;

/// Options for a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Parallelism for chunk decoding and stream buffering. Defaults to the
    /// CPU count.
    pub concurrency: Option<usize>,
    /// Optional progress feed; entries are reported as they are scheduled.
    pub progress: Option<mpsc::UnboundedSender<ExtractProgress>>,
}

/// Progress updates from a pipeline run.
#[derive(Debug, Clone)]
pub enum ExtractProgress {
    /// An entry's job was submitted.
    Entry { name: String },
    /// The input stream finished and every job has drained.
    Finished,
}

/// Statistics from a pipeline run.
///
/// Entries whose materialization failed are not counted; those failures are
/// logged and extraction continues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub dirs_created: u64,
    pub files_created: u64,
    pub symlinks_created: u64,
    pub hardlinks_created: u64,
    /// Payload bytes handed to the sink by successful file writes.
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    dirs: AtomicU64,
    files: AtomicU64,
    symlinks: AtomicU64,
    hardlinks: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ExtractStats {
        ExtractStats {
            dirs_created: self.dirs.load(Ordering::Relaxed),
            files_created: self.files.load(Ordering::Relaxed),
            symlinks_created: self.symlinks.load(Ordering::Relaxed),
            hardlinks_created: self.hardlinks.load(Ordering::Relaxed),
            bytes_written: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Extract `archive` through `sink`.
///
/// Format and decode failures abort the run; per-file sink failures are
/// swallowed so one unwritable path does not sink the remaining entries.
pub async fn extract_with_sink<S: Sink>(
    archive: &Path,
    sink: Arc<S>,
    options: ExtractOptions,
) -> Result<ExtractStats> {
    let concurrency = options.concurrency.unwrap_or_else(num_cpus::get).max(1);

    let mapped = MappedArchive::open(archive)?;
    let content = xar::locate_content(&mapped)?;
    tracing::debug!(start = content.start, len = content.len(), "located pbzx content stream");

    let chunks = pbzx::decode_chunks(mapped, content, concurrency);
    let entries = cpio::parse_entries(chunks, concurrency);
    schedule(entries, sink, &options).await
}

/// Consume entries in archive order and dispatch one job per entry.
///
/// `DirTask` maps a directory path to the completion of its creation job;
/// `LinkOrigin` maps a `(dev, ino)` identity to the first regular file that
/// carried it. Both are written only here; jobs clone the handles they wait
/// on, so siblings materialize in parallel with no locks.
async fn schedule<S: Sink>(
    mut entries: mpsc::Receiver<Result<FileEntry>>,
    sink: Arc<S>,
    options: &ExtractOptions,
) -> Result<ExtractStats> {
    let (pool, mut done) = work_queue::<()>(EXTRACT_BATCH);
    // Job results carry nothing; draining them releases pool slots.
    let drain = tokio::spawn(async move { while done.next().await.is_some() {} });

    let counters = Arc::new(Counters::default());
    let mut dir_tasks: HashMap<String, Completion> = HashMap::new();
    let mut link_origins: HashMap<(u64, u64), (String, Completion)> = HashMap::new();

    let mut outcome = Ok(());
    while let Some(next) = entries.recv().await {
        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                outcome = Err(err);
                break;
            }
        };
        if entry.name == "." {
            continue;
        }
        if let Some(progress) = &options.progress {
            let _ = progress.send(ExtractProgress::Entry {
                name: entry.name.clone(),
            });
        }
        if let Err(err) = submit_entry(
            &pool,
            &sink,
            &counters,
            &mut dir_tasks,
            &mut link_origins,
            entry,
        )
        .await
        {
            outcome = Err(err);
            break;
        }
    }

    // No more submissions; wait for in-flight jobs to finish.
    drop(pool);
    drain.await.map_err(|_| Error::Cancelled)?;

    if let Some(progress) = &options.progress {
        let _ = progress.send(ExtractProgress::Finished);
    }
    outcome.map(|()| counters.snapshot())
}

async fn submit_entry<S: Sink>(
    pool: &WorkQueue<()>,
    sink: &Arc<S>,
    counters: &Arc<Counters>,
    dir_tasks: &mut HashMap<String, Completion>,
    link_origins: &mut HashMap<(u64, u64), (String, Completion)>,
    entry: FileEntry,
) -> Result<()> {
    let parent = parent_task(dir_tasks, &entry.name)?;

    // An identity seen before makes this entry a hardlink to the first
    // occurrence, whatever its own mode claims.
    if let Some((original, origin)) = link_origins.get(&entry.identifier()).cloned() {
        let sink = sink.clone();
        let counters = counters.clone();
        return pool
            .submit(async move {
                origin.wait().await;
                if let Some(parent) = parent {
                    parent.wait().await;
                }
                match sink.hardlink(&original, &entry).await {
                    Ok(()) => {
                        counters.hardlinks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => tracing::warn!(name = %entry.name, %err, "hardlink failed"),
                }
            })
            .await;
    }

    match entry.kind() {
        S_IFDIR => {
            let (handle, guard) = completion();
            dir_tasks.insert(entry.name.clone(), handle);
            let sink = sink.clone();
            let counters = counters.clone();
            pool.submit(async move {
                if let Some(parent) = parent {
                    parent.wait().await;
                }
                match sink.create_dir(&entry).await {
                    Ok(()) => {
                        counters.dirs.fetch_add(1, Ordering::Relaxed);
                        if entry.mode & S_ISVTX != 0 {
                            if let Err(err) = sink.chmod(&entry, entry.permissions()).await {
                                tracing::warn!(name = %entry.name, %err, "sticky chmod failed");
                            }
                        }
                    }
                    Err(err) => tracing::warn!(name = %entry.name, %err, "mkdir failed"),
                }
                drop(guard);
            })
            .await
        }
        S_IFREG => {
            let (handle, guard) = completion();
            link_origins.insert(entry.identifier(), (entry.name.clone(), handle));
            let sink = sink.clone();
            let counters = counters.clone();
            pool.submit(async move {
                if let Some(parent) = parent {
                    parent.wait().await;
                }
                match sink.create_file(&entry).await {
                    Ok(written) => {
                        counters.files.fetch_add(1, Ordering::Relaxed);
                        counters.bytes.fetch_add(written, Ordering::Relaxed);
                    }
                    Err(err) => tracing::warn!(name = %entry.name, %err, "file write failed"),
                }
                drop(guard);
            })
            .await
        }
        S_IFLNK => {
            let sink = sink.clone();
            let counters = counters.clone();
            pool.submit(async move {
                if let Some(parent) = parent {
                    parent.wait().await;
                }
                match String::from_utf8(entry.payload()) {
                    Ok(target) => match sink.symlink(&target, &entry).await {
                        Ok(()) => {
                            counters.symlinks.fetch_add(1, Ordering::Relaxed);
                            if entry.mode & S_ISVTX != 0 {
                                if let Err(err) = sink.chmod(&entry, entry.permissions()).await {
                                    tracing::warn!(name = %entry.name, %err, "sticky chmod failed");
                                }
                            }
                        }
                        Err(err) => tracing::warn!(name = %entry.name, %err, "symlink failed"),
                    },
                    Err(_) => tracing::warn!(name = %entry.name, "symlink target is not UTF-8"),
                }
            })
            .await
        }
        _ => Err(Error::MalformedArchive("unsupported cpio entry type")),
    }
}

/// The completion handle of `name`'s parent directory.
///
/// CPIO emits directories before their contents, so a missing handle is
/// only legitimate for entries directly under the implicit root `.`.
fn parent_task(dir_tasks: &HashMap<String, Completion>, name: &str) -> Result<Option<Completion>> {
    let Some((parent, _)) = name.rsplit_once('/') else {
        return Ok(None);
    };
    match dir_tasks.get(parent) {
        Some(handle) => Ok(Some(handle.clone())),
        None if parent == "." => Ok(None),
        None => Err(Error::MalformedArchive(
            "cpio entry precedes its parent directory",
        )),
    }
}
