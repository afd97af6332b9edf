//! The worker RPC surface: posting-list reads, uid assignment, liveness.
//!
//! Methods: `Worker.Hello`, `Worker.GetOrAssign`, `Worker.ServeTask`,
//! `Worker.CheckVersion`. One thread serves each accepted connection, so
//! responses on a connection come back in request order with matching
//! sequence numbers.

mod assign;
pub mod proto;

use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::conn::{encode_reply_err, encode_reply_ok, read_frame, write_frame, Pool};
use crate::error::{Result, TernError};
use crate::keys;
use crate::posting::Postings;
use crate::shard::ShardRouter;
use crate::uid::UidAssigner;
use proto::{TaskQuery, TaskResult};

pub struct Worker {
    postings: Arc<Postings>,
    assigner: Arc<UidAssigner>,
    router: ShardRouter,
    pools: HashMap<u64, Arc<Pool>>,
}

impl Worker {
    pub fn new(postings: Arc<Postings>, assigner: Arc<UidAssigner>, router: ShardRouter) -> Self {
        Worker {
            postings,
            assigner,
            router,
            pools: HashMap::new(),
        }
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    /// Dials every peer and checks liveness. `addrs` is indexed by shard;
    /// the local shard's slot is skipped.
    pub fn connect(&mut self, addrs: &[String], cancel: &CancelToken) -> Result<()> {
        for (shard, addr) in addrs.iter().enumerate() {
            let shard = shard as u64;
            if shard == self.router.shard() || addr.is_empty() {
                continue;
            }
            let pool = Arc::new(Pool::new(addr));
            pool.hello(cancel)?;
            info!(shard, addr = %addr, "connected to peer worker");
            self.pools.insert(shard, pool);
        }
        Ok(())
    }

    fn pool_for(&self, shard: u64) -> Result<&Arc<Pool>> {
        self.pools
            .get(&shard)
            .ok_or(TernError::NotFound("pool for shard"))
    }

    /// Materializes posting lists for every `(uid, attr)` pair locally.
    /// The result aligns by index with the input uids.
    pub fn process_task(&self, query: &TaskQuery) -> Result<TaskResult> {
        let mut result = TaskResult::default();
        for &uid in &query.uids {
            let list = self.postings.get_or_create(&keys::data_key(uid, &query.attr));
            let value = match list.value() {
                Ok(value) => value,
                Err(TernError::NotFound(_)) => Vec::new(),
                Err(err) => return Err(err),
            };
            result.values.push(value);
            result.uid_matrix.push(list.uids()?);
        }
        Ok(result)
    }

    /// Answers a task query, forwarding it to the shard owning the
    /// attribute when that is not us.
    pub fn serve_task(&self, query: &TaskQuery, cancel: &CancelToken) -> Result<TaskResult> {
        let owner = self.router.owner_of(&query.attr);
        if owner == self.router.shard() {
            return self.process_task(query);
        }
        debug!(attr = %query.attr, owner, "routing task to owning shard");
        let reply = self.pool_for(owner)?.call(
            "Worker.ServeTask",
            &proto::encode_task_query(query),
            cancel,
        )?;
        proto::decode_task_result(&reply)
    }

    /// Assigns a batch of xids on this shard, fanning out across a small
    /// thread pool. Order is preserved.
    fn assign_batch(&self, xids: &[String]) -> Result<Vec<u64>> {
        if xids.is_empty() {
            return Ok(Vec::new());
        }
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(xids.len().max(1));
        let chunk = xids.len().div_ceil(workers);
        let mut uids = vec![0u64; xids.len()];
        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::new();
            for (slot, input) in uids.chunks_mut(chunk).zip(xids.chunks(chunk)) {
                handles.push(scope.spawn(move || -> Result<()> {
                    for (out, xid) in slot.iter_mut().zip(input) {
                        *out = self.assigner.get_or_assign(
                            xid,
                            self.router.shard(),
                            self.router.num_shards(),
                        )?;
                    }
                    Ok(())
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| TernError::FatalStore("assign worker panicked".into()))??;
            }
            Ok(())
        })?;
        Ok(uids)
    }

    fn dispatch(&self, method: &str, payload: &[u8], cancel: &CancelToken) -> Vec<u8> {
        let reply = match method {
            "Worker.Hello" => Ok(payload.to_vec()),
            "Worker.CheckVersion" => Ok(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
            "Worker.GetOrAssign" => proto::decode_xid_list(payload)
                .and_then(|xids| self.assign_batch(&xids))
                .map(|uids| proto::encode_uid_list(&uids)),
            "Worker.ServeTask" => proto::decode_task_query(payload)
                .and_then(|query| self.serve_task(&query, cancel))
                .map(|result| proto::encode_task_result(&result)),
            other => Err(TernError::InvalidOp(format!("unknown method {other:?}"))),
        };
        match reply {
            Ok(body) => encode_reply_ok(&body),
            Err(err) => {
                warn!(method, error = %err, "rpc handler failed");
                encode_reply_err(&err)
            }
        }
    }

    fn serve_conn(&self, mut conn: TcpStream, cancel: &CancelToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let frame = match read_frame(&mut conn) {
                Ok(frame) => frame,
                Err(TernError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("peer closed connection");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "dropping connection after bad frame");
                    return;
                }
            };
            let reply = self.dispatch(&frame.method, &frame.payload, cancel);
            if let Err(err) = write_frame(&mut conn, frame.seq, &frame.method, &reply) {
                warn!(error = %err, "failed to write reply");
                return;
            }
        }
    }

    /// Runs the accept loop on its own thread. Each connection gets a
    /// handler thread; the loop exits when the token cancels and the
    /// listener errors out or the next connection arrives.
    pub fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancelToken) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "worker listening");
            }
            for incoming in listener.incoming() {
                if cancel.is_cancelled() {
                    return;
                }
                match incoming {
                    Ok(conn) => {
                        let worker = Arc::clone(&self);
                        let cancel = cancel.clone();
                        thread::spawn(move || worker.serve_conn(conn, &cancel));
                    }
                    Err(err) => {
                        error!(error = %err, "accept failed");
                        return;
                    }
                }
            }
        })
    }
}
