use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::conn::{decode_reply, read_frame, write_frame};
use crate::error::{Result, TernError};

const POOL_CAP: usize = 5;
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed-capacity connection pool for one remote worker. A call checks a
/// connection out for its request/response pair; a connection that errors
/// is dropped and a replacement dialed lazily on the next call.
pub struct Pool {
    addr: String,
    conns: Mutex<Vec<TcpStream>>,
    next_seq: AtomicU64,
}

impl Pool {
    pub fn new(addr: &str) -> Self {
        Pool {
            addr: addr.to_string(),
            conns: Mutex::new(Vec::with_capacity(POOL_CAP)),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn dial(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        debug!(addr = %self.addr, "dialed worker");
        Ok(stream)
    }

    fn checkout(&self) -> Result<TcpStream> {
        if let Some(conn) = self.conns.lock().pop() {
            return Ok(conn);
        }
        self.dial()
    }

    fn checkin(&self, conn: TcpStream) {
        let mut conns = self.conns.lock();
        if conns.len() < POOL_CAP {
            conns.push(conn);
        }
    }

    /// One request/response exchange. Sequence numbers must match; a
    /// mismatch means the stream is desynchronized and the connection is
    /// discarded.
    pub fn call(&self, method: &str, payload: &[u8], cancel: &CancelToken) -> Result<Vec<u8>> {
        cancel.check()?;
        let mut conn = self.checkout()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let exchange = (|| -> Result<Vec<u8>> {
            write_frame(&mut conn, seq, method, payload)?;
            cancel.check()?;
            let frame = read_frame(&mut conn)?;
            if frame.seq != seq {
                return Err(TernError::Corruption(format!(
                    "reply seq {} does not match request seq {seq}",
                    frame.seq
                )));
            }
            Ok(frame.payload)
        })();

        match exchange {
            Ok(reply) => {
                self.checkin(conn);
                decode_reply(&reply)
            }
            Err(err) => {
                // Connection state is unknown; let it drop.
                warn!(addr = %self.addr, method, error = %err, "rpc failed, discarding connection");
                if cancel.is_cancelled() && is_io_err(&err) {
                    Err(TernError::Cancelled)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Liveness probe: the peer echoes the payload.
    pub fn hello(&self, cancel: &CancelToken) -> Result<()> {
        let reply = self.call("Worker.Hello", b"hello", cancel)?;
        if reply == b"hello" {
            Ok(())
        } else {
            Err(TernError::Corruption("hello reply did not echo".into()))
        }
    }
}

fn is_io_err(err: &TernError) -> bool {
    matches!(
        err,
        TernError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof
        )
    )
}
