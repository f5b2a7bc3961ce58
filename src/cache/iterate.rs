//! C9: enumerating the objects stored in a stripe, serially or with a
//! load-average-bounded worker pool.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cache::directory::DirEntry;
use crate::cache::doc::Doc;
use crate::cache::stripe::Stripe;
use crate::error::{CacheError, Result};
use crate::primitives::FipsMode;

/// One enumerated object: its request URL and the total length recorded on
/// its first fragment.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub url: String,
    pub total_length: u64,
}

/// Enumerates every head-of-object directory row in `stripe`, fetching each
/// Doc and (if it carries alternates) yielding one entry per alternate.
/// Reads the directory in if it isn't already resident, releasing it again
/// afterward unless the caller had preloaded it.
pub fn stored_objects(stripe: &mut Stripe, path: &Path, fips: FipsMode) -> Result<Vec<ObjectEntry>> {
    let preloaded = stripe.directory.is_some();
    if !preloaded {
        stripe.read_directory()?;
    }

    let heads = stripe
        .directory
        .as_ref()
        .expect("just ensured directory residency")
        .heads(stripe.phase)?;

    let mut f = File::open(path)?;
    let result = enumerate_heads(&mut f, stripe.content_offset, &heads, fips);

    if !preloaded {
        stripe.release_directory();
    }

    result
}

fn enumerate_heads(
    file: &mut File,
    content_offset: u64,
    heads: &[DirEntry],
    fips: FipsMode,
) -> Result<Vec<ObjectEntry>> {
    let mut out = Vec::new();
    for head in heads {
        let Some(entries) = fetch_entries(file, content_offset, head, fips)? else {
            continue;
        };
        out.extend(entries);
    }
    Ok(out)
}

fn fetch_entries(
    file: &mut File,
    content_offset: u64,
    head: &DirEntry,
    fips: FipsMode,
) -> Result<Option<Vec<ObjectEntry>>> {
    let doc = match Doc::fetch(file, content_offset, head, fips) {
        Ok(doc) => doc,
        Err(CacheError::EntryCorrupt(msg)) => {
            tracing::warn!(error = %msg, "skipping corrupt Doc");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if !doc.has_alternates() {
        return Ok(None);
    }

    let alternates = doc.alternates().unwrap_or_default();
    Ok(Some(
        alternates
            .iter()
            .map(|alt| ObjectEntry {
                url: alt.request_url(),
                total_length: doc.total_length,
            })
            .collect(),
    ))
}

enum Msg {
    Item(ObjectEntry),
    Error(CacheError),
    Done,
}

/// A streaming consumer over the worker pool's results. Dropping it sets the
/// shared cancellation flag; workers check it between Docs and exit once
/// their current Doc finishes.
pub struct StoredObjectsStream {
    rx: Receiver<Msg>,
    cancel: Arc<AtomicBool>,
    remaining_sentinels: usize,
    failed: bool,
    _handle: Option<JoinHandle<()>>,
}

impl Drop for StoredObjectsStream {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl Iterator for StoredObjectsStream {
    type Item = Result<ObjectEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.remaining_sentinels == 0 {
                return None;
            }
            match self.rx.recv() {
                Ok(Msg::Item(entry)) => return Some(Ok(entry)),
                Ok(Msg::Error(e)) => {
                    self.failed = true;
                    self.cancel.store(true, Ordering::SeqCst);
                    return Some(Err(e));
                }
                Ok(Msg::Done) => {
                    self.remaining_sentinels -= 1;
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

/// Partitions the stripe's head rows across `worker_count` threads, each
/// opening its own read-only file handle, and streams results back through
/// a bounded channel with one done-sentinel per worker.
pub fn stored_objects_parallel(
    stripe: &mut Stripe,
    path: &Path,
    fips: FipsMode,
    worker_count: usize,
) -> Result<StoredObjectsStream> {
    let preloaded = stripe.directory.is_some();
    if !preloaded {
        stripe.read_directory()?;
    }
    let heads = stripe
        .directory
        .as_ref()
        .expect("just ensured directory residency")
        .heads(stripe.phase)?;
    if !preloaded {
        stripe.release_directory();
    }

    let worker_count = worker_count.max(1).min(heads.len().max(1));
    let chunk_size = heads.len().div_ceil(worker_count).max(1);
    let chunks: Vec<Vec<DirEntry>> = heads
        .chunks(chunk_size)
        .map(|c| c.to_vec())
        .collect();
    let worker_count = chunks.len().max(1);

    let (tx, rx) = sync_channel(256);
    let cancel = Arc::new(AtomicBool::new(false));
    let content_offset = stripe.content_offset;
    let path: PathBuf = path.to_path_buf();

    let cancel_for_thread = Arc::clone(&cancel);
    let handle = std::thread::spawn(move || {
        rayon::scope(|s| {
            for chunk in chunks {
                let tx = tx.clone();
                let cancel = Arc::clone(&cancel_for_thread);
                let path = path.clone();
                s.spawn(move |_| {
                    let mut file = match File::open(&path) {
                        Ok(f) => f,
                        Err(e) => {
                            let _ = tx.send(Msg::Error(CacheError::Io(e)));
                            let _ = tx.send(Msg::Done);
                            return;
                        }
                    };
                    for head in &chunk {
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }
                        match fetch_entries(&mut file, content_offset, head, fips) {
                            Ok(Some(entries)) => {
                                for entry in entries {
                                    if tx.send(Msg::Item(entry)).is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                let _ = tx.send(Msg::Error(e));
                                break;
                            }
                        }
                    }
                    let _ = tx.send(Msg::Done);
                });
            }
        });
    });

    Ok(StoredObjectsStream {
        rx,
        cancel,
        remaining_sentinels: worker_count,
        failed: false,
        _handle: Some(handle),
    })
}
