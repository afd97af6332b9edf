//! Reduce phase: sorted spill files -> posting lists in the byte store.
//!
//! One shuffle thread streams each spill file into a bounded channel; a
//! k-way merge over the channel heads yields entries in global
//! `(key, uid)` order. Contiguous entries for one key become one posting
//! list; batches of complete lists go to a reduce pool that encodes them
//! and writes through unsynced batches. A count indexer tallies postings
//! per predicate and per value type and lands as synthetic index keys
//! before the phase returns.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bulk::map::MapEntry;
use crate::codec::{ListBuilder, Posting};
use crate::error::{Result, TernError};
use crate::keys;
use crate::store::ByteStore;

const SHUFFLE_CHANNEL_CAP: usize = 1_000;
/// Each element is a whole batch of keys' postings, so keep this small.
const REDUCE_CHANNEL_CAP: usize = 3;
const BATCH_KEYS: usize = 1_000;

/// Tallies postings per predicate and per value type.
#[derive(Default)]
pub struct CountIndexer {
    per_pred: Mutex<HashMap<String, u64>>,
    per_type: Mutex<HashMap<u8, u64>>,
}

impl CountIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn tally(&self, attribute: &str, postings: &[&Posting]) {
        let n = postings.len() as u64;
        *self
            .per_pred
            .lock()
            .entry(attribute.to_string())
            .or_insert(0) += n;
        let mut per_type = self.per_type.lock();
        for posting in postings {
            *per_type.entry(posting.vtype.to_byte()).or_insert(0) += 1;
        }
    }

    /// Materializes the tallies as index-namespace keys.
    pub fn write(&self, store: &dyn ByteStore) -> Result<()> {
        let mut batch = Vec::new();
        for (attr, count) in self.per_pred.lock().iter() {
            batch.push((keys::count_pred_key(attr), count.to_le_bytes().to_vec()));
        }
        for (vtype, count) in self.per_type.lock().iter() {
            batch.push((keys::count_type_key(*vtype), count.to_le_bytes().to_vec()));
        }
        store.write_batch(&batch)
    }
}

struct HeapItem {
    entry: MapEntry,
    src: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.entry
            .cmp(&other.entry)
            .then(self.src.cmp(&other.src))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub(crate) fn find_map_files(shard_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !shard_dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(shard_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("map") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

type KeyGroup = (Vec<u8>, Vec<Posting>);

/// One key's sorted postings with duplicated uids folded down to the
/// last entry. The map output ordered ties by input position, so the
/// survivor is the last-occurring write, matching a sequential replay.
fn dedup_last(postings: &[Posting]) -> Vec<&Posting> {
    let mut kept = Vec::with_capacity(postings.len());
    let mut i = 0;
    while i < postings.len() {
        let mut last = i;
        while last + 1 < postings.len() && postings[last + 1].uid == postings[i].uid {
            last += 1;
        }
        kept.push(&postings[last]);
        i = last + 1;
    }
    kept
}

/// Merges every spill file of one shard into the byte store. Returns the
/// number of posting-list keys written. Re-running against intact spill
/// files and a fresh store reproduces the same contents.
pub fn reduce_shard(
    shard_dir: &Path,
    store: &(dyn ByteStore),
    num_threads: usize,
    counts: &CountIndexer,
) -> Result<u64> {
    let files = find_map_files(shard_dir)?;
    if files.is_empty() {
        info!(dir = %shard_dir.display(), "no map output for shard");
        return Ok(0);
    }
    info!(files = files.len(), "starting reduce");

    let first_err: Mutex<Option<TernError>> = Mutex::new(None);
    let mut keys_written = 0u64;

    thread::scope(|scope| {
        // Shuffle: one reader per spill file.
        let mut heads: Vec<Receiver<MapEntry>> = Vec::with_capacity(files.len());
        for path in &files {
            let (tx, rx) = sync_channel::<MapEntry>(SHUFFLE_CHANNEL_CAP);
            heads.push(rx);
            let first_err = &first_err;
            scope.spawn(move || {
                let result = (|| -> Result<()> {
                    let mut r = BufReader::new(File::open(path)?);
                    while let Some(entry) = MapEntry::read_from(&mut r)? {
                        if tx.send(entry).is_err() {
                            break;
                        }
                    }
                    Ok(())
                })();
                if let Err(err) = result {
                    let mut slot = first_err.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            });
        }

        // Reduce pool.
        let (batch_tx, batch_rx) = sync_channel::<Vec<KeyGroup>>(REDUCE_CHANNEL_CAP);
        let batch_rx = Arc::new(Mutex::new(batch_rx));
        for _ in 0..num_threads.max(1) {
            let batch_rx = Arc::clone(&batch_rx);
            let first_err = &first_err;
            scope.spawn(move || loop {
                let batch = {
                    let rx = batch_rx.lock();
                    match rx.recv() {
                        Ok(batch) => batch,
                        Err(_) => return,
                    }
                };
                let result = (|| -> Result<()> {
                    let mut writes = Vec::with_capacity(batch.len());
                    for (key, postings) in &batch {
                        let (attribute, _) = keys::parse_data_key(key)?;
                        let kept = dedup_last(postings);
                        counts.tally(&attribute, &kept);
                        let mut builder = ListBuilder::new();
                        for posting in kept {
                            builder.push(posting);
                        }
                        writes.push((key.clone(), builder.finish()));
                    }
                    store.write_batch(&writes)
                })();
                if let Err(err) = result {
                    let mut slot = first_err.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    return;
                }
            });
        }
        drop(batch_rx);

        // K-way merge over the channel heads, grouping by key.
        let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
        for (src, rx) in heads.iter().enumerate() {
            if let Ok(entry) = rx.recv() {
                heap.push(Reverse(HeapItem { entry, src }));
            }
        }

        let mut batch: Vec<KeyGroup> = Vec::new();
        let mut current: Option<KeyGroup> = None;
        while let Some(Reverse(HeapItem { entry, src })) = heap.pop() {
            if let Ok(next) = heads[src].recv() {
                heap.push(Reverse(HeapItem { entry: next, src }));
            }
            match &mut current {
                Some((key, postings)) if *key == entry.key => postings.push(entry.posting),
                _ => {
                    if let Some(group) = current.take() {
                        keys_written += 1;
                        batch.push(group);
                        if batch.len() >= BATCH_KEYS {
                            if batch_tx.send(std::mem::take(&mut batch)).is_err() {
                                break;
                            }
                        }
                    }
                    current = Some((entry.key, vec![entry.posting]));
                }
            }
        }
        if let Some(group) = current.take() {
            keys_written += 1;
            batch.push(group);
        }
        if !batch.is_empty() {
            let _ = batch_tx.send(batch);
        }
        drop(batch_tx);
    });

    if let Some(err) = first_err.into_inner() {
        return Err(err);
    }
    debug!(keys = keys_written, "reduce merge drained");
    Ok(keys_written)
}
