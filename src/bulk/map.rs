//! Map phase: RDF files -> per-shard sorted spill files.
//!
//! One reader per input file chunks lines into ~10 MiB buffers under a
//! concurrency cap; a mapper pool parses each chunk, resolves xids
//! through the run's [`XidMap`], and pushes `(key, posting)` entries into
//! per-shard heaps. A heap that outgrows its byte budget drains to a
//! fresh `.map` file in ascending `(key, uid)` order.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

use flate2::read::GzDecoder;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bulk::xidmap::XidMap;
use crate::bulk::BulkOptions;
use crate::codec::Posting;
use crate::error::{Result, TernError};
use crate::keys;
use crate::model::{NQuad, Op, TypedValue, ASSIGNER_SOURCE, XID_ATTR};
use crate::rdf;
use crate::schema::SchemaStore;
use crate::shard::fingerprint64;

const CHUNK_BYTES: usize = 10 << 20;
const CHUNK_LINES: usize = 100_000;

/// One record emitted by a mapper and consumed by the reducer. `seq` is
/// the input line number the entry came from; it never reaches the byte
/// store, but it is what makes "last write" mean last-in-the-input once
/// the entries have been heap-sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub key: Vec<u8>,
    pub seq: u64,
    pub posting: Posting,
}

impl Eq for MapEntry {}

impl Ord for MapEntry {
    /// Global spill order: `(key, uid, seq)`. Two Sets on the same uid
    /// sort by input position, so the reducer's keep-the-last rule
    /// agrees with a sequential replay of the same lines.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .cmp(&other.key)
            .then(self.posting.uid.cmp(&other.posting.uid))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for MapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl MapEntry {
    pub fn encoded_len(&self) -> usize {
        4 + 2 + self.key.len() + 8 + self.posting.encoded_len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let body_len = 2 + self.key.len() + 8 + self.posting.encoded_len();
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.seq.to_le_bytes());
        self.posting.encode_into(out);
    }

    /// Reads the next length-prefixed entry, or `None` at a clean end of
    /// file.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<MapEntry>> {
        let mut len_buf = [0u8; 4];
        match r.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let body_len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; body_len];
        r.read_exact(&mut body)?;
        if body.len() < 2 {
            return Err(TernError::Corruption("map entry truncated".into()));
        }
        let key_len = u16::from_le_bytes(body[0..2].try_into().expect("2 bytes")) as usize;
        if body.len() < 2 + key_len + 8 {
            return Err(TernError::Corruption("map entry key truncated".into()));
        }
        let key = body[2..2 + key_len].to_vec();
        let seq = u64::from_le_bytes(
            body[2 + key_len..2 + key_len + 8]
                .try_into()
                .expect("8 bytes"),
        );
        let posting = Posting::decode(&body[2 + key_len + 8..])?;
        Ok(Some(MapEntry { key, seq, posting }))
    }
}

pub(crate) fn find_input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".rdf") || name.ends_with(".rdf.gz") {
                    files.push(path);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::with_capacity(1 << 20, file)))
    }
}

/// One buffered run of input lines plus the input position of its first
/// line, so mappers can number every line they parse.
struct Chunk {
    base_seq: u64,
    text: String,
}

/// Reads up to [`CHUNK_LINES`] newline-terminated lines or roughly
/// [`CHUNK_BYTES`] bytes, whichever comes first. Returns the text and
/// the number of lines read; `None` at end of input.
fn read_chunk<R: BufRead + ?Sized>(r: &mut R) -> Result<Option<(String, u64)>> {
    let mut chunk = String::with_capacity(CHUNK_BYTES.min(1 << 16));
    let mut lines = 0u64;
    for _ in 0..CHUNK_LINES {
        if r.read_line(&mut chunk)? == 0 {
            break;
        }
        lines += 1;
        if chunk.len() >= CHUNK_BYTES {
            break;
        }
    }
    if chunk.is_empty() {
        Ok(None)
    } else {
        Ok(Some((chunk, lines)))
    }
}

struct MapState {
    opts: BulkOptions,
    xidmap: Arc<XidMap>,
    schema: Arc<SchemaStore>,
    file_seq: AtomicU32,
}

impl MapState {
    fn spill_path(&self, shard: u64) -> Result<PathBuf> {
        let dir = self.opts.tmp_dir.join(format!("shard_{shard}"));
        fs::create_dir_all(&dir)?;
        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        Ok(dir.join(format!("{seq:06}.map")))
    }
}

struct Mapper<'a> {
    state: &'a MapState,
    heaps: Vec<BinaryHeap<Reverse<MapEntry>>>,
    heap_bytes: Vec<usize>,
    xid_shard: usize,
}

impl<'a> Mapper<'a> {
    fn new(state: &'a MapState) -> Self {
        let shards = state.opts.num_shards as usize;
        let xid_shard = (fingerprint64(XID_ATTR.as_bytes()) % state.opts.num_shards) as usize;
        Mapper {
            state,
            heaps: (0..shards).map(|_| BinaryHeap::new()).collect(),
            heap_bytes: vec![0; shards],
            xid_shard,
        }
    }

    fn emit(&mut self, shard: usize, entry: MapEntry) -> Result<()> {
        self.heap_bytes[shard] += entry.encoded_len();
        self.heaps[shard].push(Reverse(entry));
        if self.heap_bytes[shard] > self.state.opts.map_buf_size {
            self.flush_shard(shard)?;
        }
        Ok(())
    }

    /// Drains one shard's heap as a sorted run into a fresh spill file.
    fn flush_shard(&mut self, shard: usize) -> Result<()> {
        if self.heaps[shard].is_empty() {
            return Ok(());
        }
        let path = self.state.spill_path(shard as u64)?;
        let mut w = BufWriter::new(File::create(&path)?);
        let mut buf = Vec::new();
        let mut entries = 0usize;
        while let Some(Reverse(entry)) = self.heaps[shard].pop() {
            buf.clear();
            entry.encode_into(&mut buf);
            w.write_all(&buf)?;
            entries += 1;
        }
        w.flush()?;
        self.heap_bytes[shard] = 0;
        debug!(path = %path.display(), entries, "wrote sorted map run");
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        for shard in 0..self.heaps.len() {
            self.flush_shard(shard)?;
        }
        Ok(())
    }

    fn resolve(&mut self, xid: &str, ts: i64, seq: u64) -> Result<u64> {
        let (uid, fresh) = self.state.xidmap.assign(xid);
        if fresh {
            // Materialize the reverse edge alongside the data.
            let posting = Posting {
                uid: crate::model::MAX_UID,
                ts,
                op: Op::Set,
                vtype: TypedValue::Str(xid.to_string()).value_type(),
                source: ASSIGNER_SOURCE.to_string(),
                value: xid.as_bytes().to_vec(),
            };
            self.emit(
                self.xid_shard,
                MapEntry {
                    key: keys::data_key(uid, XID_ATTR),
                    seq,
                    posting,
                },
            )?;
        }
        Ok(uid)
    }

    fn handle_nquad(&mut self, nq: &NQuad, seq: u64) -> Result<()> {
        // Bulk postings carry a zero timestamp: load time is not
        // provenance, and identical inputs must produce identical bytes.
        // Input order lives in `seq`, not in the stored posting.
        let ts = 0;
        if let Some(value) = &nq.object_value {
            self.state.schema.check_value(&nq.predicate, value)?;
        }
        let subject_uid = self.resolve(&nq.subject, ts, seq)?;
        let object_uid = if nq.has_uid_object() {
            self.resolve(&nq.object_id, ts, seq)?
        } else {
            0
        };
        let edge = nq.to_edge(subject_uid, object_uid, ts)?;
        let shard = (fingerprint64(edge.attribute.as_bytes()) % self.state.opts.num_shards) as usize;
        self.emit(
            shard,
            MapEntry {
                key: keys::data_key(edge.entity, &edge.attribute),
                seq,
                posting: Posting::from_edge(&edge, Op::Set),
            },
        )
    }

    fn run(&mut self, chunks: &Arc<Mutex<Receiver<Chunk>>>) -> Result<()> {
        loop {
            let chunk = {
                let rx = chunks.lock();
                match rx.recv() {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                }
            };
            for (offset, line) in chunk.text.lines().enumerate() {
                if let Some(nq) = rdf::parse(line)? {
                    self.handle_nquad(&nq, chunk.base_seq + offset as u64)?;
                }
            }
        }
        self.flush_all()
    }
}

/// Runs the whole map stage: chunk readers under a concurrency cap feed
/// a bounded channel drained by `num_threads` mappers. Ends by writing
/// the lease file atomically.
pub fn map_stage(
    opts: &BulkOptions,
    xidmap: &Arc<XidMap>,
    schema: &Arc<SchemaStore>,
) -> Result<()> {
    let files = find_input_files(&opts.rdf_dir)?;
    if files.is_empty() {
        return Err(TernError::NotFound("rdf input files"));
    }
    info!(files = files.len(), "starting map stage");

    let state = MapState {
        opts: opts.clone(),
        xidmap: Arc::clone(xidmap),
        schema: Arc::clone(schema),
        file_seq: AtomicU32::new(0),
    };

    let (chunk_tx, chunk_rx) = sync_channel::<Chunk>(opts.num_threads);
    let chunk_rx = Arc::new(Mutex::new(chunk_rx));
    let first_err: Mutex<Option<TernError>> = Mutex::new(None);
    // Hands every input line a position; the mappers carry it into the
    // spill entries so duplicate Sets keep their arrival order.
    let line_seq = AtomicU64::new(0);

    thread::scope(|scope| {
        // Readers: one per file, capped by a slot channel.
        let (slot_tx, slot_rx) = sync_channel::<()>(opts.num_threads);
        let slot_rx = Arc::new(Mutex::new(slot_rx));
        let reader_errs: &Mutex<Option<TernError>> = &first_err;
        let line_seq = &line_seq;
        scope.spawn({
            let chunk_tx = chunk_tx.clone();
            move || {
                thread::scope(|readers| {
                    for path in &files {
                        slot_tx.send(()).expect("slot channel open");
                        let chunk_tx = chunk_tx.clone();
                        let slot_rx = Arc::clone(&slot_rx);
                        readers.spawn(move || {
                            let result = (|| -> Result<()> {
                                let mut r = open_reader(path)?;
                                while let Some((text, lines)) = read_chunk(r.as_mut())? {
                                    let base_seq = line_seq.fetch_add(lines, Ordering::Relaxed);
                                    if chunk_tx.send(Chunk { base_seq, text }).is_err() {
                                        break;
                                    }
                                }
                                Ok(())
                            })();
                            if let Err(err) = result {
                                let mut slot = reader_errs.lock();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                            }
                            let _ = slot_rx.lock().recv();
                        });
                    }
                });
            }
        });
        drop(chunk_tx);

        // Mappers.
        for _ in 0..opts.num_threads {
            let chunk_rx = Arc::clone(&chunk_rx);
            let state = &state;
            let first_err = &first_err;
            scope.spawn(move || {
                let mut mapper = Mapper::new(state);
                if let Err(err) = mapper.run(&chunk_rx) {
                    let mut slot = first_err.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            });
        }
        drop(chunk_rx);
    });

    if let Some(err) = first_err.into_inner() {
        return Err(err);
    }

    xidmap.write_lease_file(&opts.lease_file)?;
    info!(
        assigned = xidmap.assigned(),
        lease = xidmap.lease(),
        "map stage done"
    );
    Ok(())
}
