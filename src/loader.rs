//! Live loading: streams N-Quads into the posting engine through the
//! normal mutation path.
//!
//! Two passes exist. `assign_uids` walks the input and assigns uids for
//! every xid this shard owns; `load_edges` converts lines to edges and
//! applies `Set` mutations for every predicate this shard owns. Both use
//! the same bounded pipeline: one reader, a parser pool, a handler pool.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{retry_temp, Result, TernError};
use crate::keys;
use crate::model::{now_nanos, NQuad, Op};
use crate::posting::Postings;
use crate::rdf;
use crate::shard::ShardRouter;
use crate::uid::UidAssigner;

const LINE_CHANNEL_CAP: usize = 10_000;
const NQUAD_CHANNEL_CAP: usize = 10_000;
const SHUFFLE_WINDOW: usize = 1_000;

/// Resolves an xid to a uid. The live loader is parameterized over this
/// so a clustered caller can plug in network-backed resolution.
pub trait UidResolver: Send + Sync {
    fn resolve(&self, xid: &str) -> Result<u64>;
}

/// Local resolution: `_uid_:N` literals parse directly, anything else is
/// assigned on this shard.
pub struct LocalResolver {
    pub assigner: Arc<UidAssigner>,
    pub router: ShardRouter,
}

impl UidResolver for LocalResolver {
    fn resolve(&self, xid: &str) -> Result<u64> {
        if let Some(num) = xid.strip_prefix("_uid_:") {
            return num
                .parse::<u64>()
                .map_err(|_| TernError::InvalidOp(format!("bad uid literal {xid:?}")));
        }
        retry_temp(|| {
            self.assigner
                .get_or_assign(xid, self.router.shard(), self.router.num_shards())
        })
    }
}

#[derive(Default)]
pub struct Counters {
    pub read: AtomicU64,
    pub parsed: AtomicU64,
    pub processed: AtomicU64,
    pub ignored: AtomicU64,
}

impl Counters {
    fn report(&self) {
        let parsed = self.parsed.load(Ordering::Relaxed);
        let processed = self.processed.load(Ordering::Relaxed);
        let ignored = self.ignored.load(Ordering::Relaxed);
        info!(
            read = self.read.load(Ordering::Relaxed),
            parsed,
            processed,
            ignored,
            pending = parsed.saturating_sub(processed + ignored),
            "loader counters"
        );
    }
}

#[derive(Clone)]
struct Pipeline {
    counters: Arc<Counters>,
    abort: Arc<AtomicBool>,
    first_err: Arc<Mutex<Option<TernError>>>,
}

impl Pipeline {
    fn fail(&self, err: TernError) {
        let mut slot = self.first_err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// Runs the read -> parse -> handle pipeline over `reader`. The handler
/// returns whether the quad was processed (vs ignored as foreign).
fn run_pipeline<R, H>(reader: R, cancel: &CancelToken, handler: H) -> Result<u64>
where
    R: BufRead + Send + 'static,
    H: Fn(&NQuad) -> Result<bool> + Send + Sync,
{
    let counters = Arc::new(Counters::default());
    let abort = Arc::new(AtomicBool::new(false));
    let pipeline = Pipeline {
        counters: Arc::clone(&counters),
        abort: Arc::clone(&abort),
        first_err: Arc::new(Mutex::new(None)),
    };

    let (line_tx, line_rx) = sync_channel::<String>(LINE_CHANNEL_CAP);
    let line_rx = Arc::new(Mutex::new(line_rx));
    let (nq_tx, nq_rx) = sync_channel::<NQuad>(NQUAD_CHANNEL_CAP);
    let nq_rx = Arc::new(Mutex::new(nq_rx));

    // Ticker: one counters line per second while work is in flight.
    let ticker = {
        let counters = Arc::clone(&counters);
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let handle = thread::spawn(move || {
            while !done_flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                counters.report();
            }
        });
        (done, handle)
    };

    let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    thread::scope(|scope| {
        // Reader with a small shuffle window to spread hot subjects.
        {
            let counters = Arc::clone(&counters);
            let abort = Arc::clone(&abort);
            scope.spawn(move || {
                let mut window: Vec<String> = Vec::with_capacity(SHUFFLE_WINDOW);
                let mut rng = rand::thread_rng();
                for line in reader.lines() {
                    if abort.load(Ordering::SeqCst) {
                        return;
                    }
                    let line = match line {
                        Ok(line) => line,
                        Err(_) => return,
                    };
                    counters.read.fetch_add(1, Ordering::Relaxed);
                    if window.len() < SHUFFLE_WINDOW {
                        window.push(line);
                        continue;
                    }
                    let at = rng.gen_range(0..window.len());
                    let out = std::mem::replace(&mut window[at], line);
                    if line_tx.send(out).is_err() {
                        return;
                    }
                }
                for line in window {
                    if line_tx.send(line).is_err() {
                        return;
                    }
                }
                // line_tx drops here, closing the channel.
            });
        }

        // Parser pool: lines -> NQuads.
        for _ in 0..workers {
            let line_rx = Arc::clone(&line_rx);
            let nq_tx = nq_tx.clone();
            scope.spawn({
                let pipeline = pipeline.clone();
                move || loop {
                    if pipeline.abort.load(Ordering::SeqCst) {
                        return;
                    }
                    let line = match recv_next(&line_rx) {
                        Some(line) => line,
                        None => return,
                    };
                    match rdf::parse(&line) {
                        Ok(Some(nq)) => {
                            pipeline.counters.parsed.fetch_add(1, Ordering::Relaxed);
                            if nq_tx.send(nq).is_err() {
                                return;
                            }
                        }
                        Ok(None) => debug!("skipping empty line"),
                        Err(err) => {
                            pipeline.fail(err);
                            return;
                        }
                    }
                }
            });
        }
        drop(nq_tx);
        drop(line_rx);

        // Handler pool: NQuads -> posting mutations.
        for _ in 0..workers {
            let nq_rx = Arc::clone(&nq_rx);
            let handler = &handler;
            let cancel = cancel.clone();
            let pipeline = pipeline.clone();
            scope.spawn(move || loop {
                if pipeline.abort.load(Ordering::SeqCst) {
                    return;
                }
                if cancel.is_cancelled() {
                    pipeline.fail(TernError::Cancelled);
                    return;
                }
                let nq = match recv_next(&nq_rx) {
                    Some(nq) => nq,
                    None => return,
                };
                match handler(&nq) {
                    Ok(true) => {
                        pipeline.counters.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        pipeline.counters.ignored.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        pipeline.fail(err);
                        return;
                    }
                }
            });
        }
        drop(nq_rx);
    });

    ticker.0.store(true, Ordering::Relaxed);
    let _ = ticker.1.join();
    counters.report();

    if let Some(err) = pipeline.first_err.lock().take() {
        return Err(err);
    }
    Ok(counters.processed.load(Ordering::Relaxed))
}

fn recv_next<T>(rx: &Arc<Mutex<Receiver<T>>>) -> Option<T> {
    let guard = rx.lock();
    guard.recv().ok()
}

/// Streams edges into the posting engine. Only edges whose predicate
/// this shard owns are applied; the rest count as ignored. Returns the
/// number of processed edges.
pub fn load_edges<R: BufRead + Send + 'static>(
    reader: R,
    postings: &Arc<Postings>,
    resolver: &dyn UidResolver,
    router: ShardRouter,
    cancel: &CancelToken,
) -> Result<u64> {
    run_pipeline(reader, cancel, |nq| {
        if !router.is_local_attr(&nq.predicate) {
            return Ok(false);
        }
        let subject_uid = resolver.resolve(&nq.subject)?;
        let object_uid = if nq.has_uid_object() {
            resolver.resolve(&nq.object_id)?
        } else {
            0
        };
        let edge = nq.to_edge(subject_uid, object_uid, now_nanos())?;
        let list = postings.get_or_create(&keys::data_key(edge.entity, &edge.attribute));
        retry_temp(|| list.add_mutation(&edge, Op::Set))?;
        Ok(true)
    })
}

/// The uid-distribution pass: assigns uids for every subject and uid
/// object whose xid this shard owns, without storing any edges.
pub fn assign_uids<R: BufRead + Send + 'static>(
    reader: R,
    assigner: &Arc<UidAssigner>,
    router: ShardRouter,
    cancel: &CancelToken,
) -> Result<u64> {
    run_pipeline(reader, cancel, |nq| {
        let mut touched = false;
        if router.is_local_xid(&nq.subject) {
            retry_temp(|| {
                assigner.get_or_assign(&nq.subject, router.shard(), router.num_shards())
            })?;
            touched = true;
        }
        if nq.has_uid_object() && router.is_local_xid(&nq.object_id) {
            retry_temp(|| {
                assigner.get_or_assign(&nq.object_id, router.shard(), router.num_shards())
            })?;
            touched = true;
        }
        Ok(touched)
    })
}
