//! Length-delimited RPC framing over stream sockets.
//!
//! Both directions use the same framer; payloads are opaque to this
//! layer. Header fields are big-endian:
//!
//! ```text
//! seq: u64 | method_len: u16 | method bytes | payload_len: i32 | payload
//! ```
//!
//! Replies additionally wrap their payload in a one-byte status
//! envelope: `0x00 | body` on success, `kind | utf8 message` on error,
//! with `kind` the error discriminator from [`TernError::kind_byte`].

mod pool;

pub use pool::Pool;

use std::io::{Read, Write};

use crate::error::{Result, TernError};

const MAX_METHOD_LEN: usize = 256;
const MAX_PAYLOAD_LEN: i32 = 1 << 30;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub method: String,
    pub payload: Vec<u8>,
}

pub fn write_frame<W: Write>(w: &mut W, seq: u64, method: &str, payload: &[u8]) -> Result<()> {
    if method.len() > MAX_METHOD_LEN {
        return Err(TernError::InvalidOp(format!(
            "method name too long: {}",
            method.len()
        )));
    }
    w.write_all(&seq.to_be_bytes())?;
    w.write_all(&(method.len() as u16).to_be_bytes())?;
    w.write_all(method.as_bytes())?;
    w.write_all(&(payload.len() as i32).to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame> {
    let mut seq_buf = [0u8; 8];
    r.read_exact(&mut seq_buf)?;
    let seq = u64::from_be_bytes(seq_buf);

    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let method_len = u16::from_be_bytes(len_buf) as usize;
    if method_len == 0 || method_len > MAX_METHOD_LEN {
        return Err(TernError::Corruption(format!(
            "implausible method length {method_len}"
        )));
    }
    let mut method_buf = vec![0u8; method_len];
    r.read_exact(&mut method_buf)?;
    let method = String::from_utf8(method_buf)
        .map_err(|_| TernError::Corruption("non-utf8 method name".into()))?;

    let mut plen_buf = [0u8; 4];
    r.read_exact(&mut plen_buf)?;
    let payload_len = i32::from_be_bytes(plen_buf);
    if !(0..=MAX_PAYLOAD_LEN).contains(&payload_len) {
        return Err(TernError::Corruption(format!(
            "implausible payload length {payload_len}"
        )));
    }
    let mut payload = vec![0u8; payload_len as usize];
    r.read_exact(&mut payload)?;
    Ok(Frame {
        seq,
        method,
        payload,
    })
}

pub fn encode_reply_ok(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(0);
    out.extend_from_slice(body);
    out
}

pub fn encode_reply_err(err: &TernError) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(err.kind_byte());
    out.extend_from_slice(err.to_string().as_bytes());
    out
}

/// Unwraps a status envelope into the reply body or the remote error.
pub fn decode_reply(payload: &[u8]) -> Result<Vec<u8>> {
    match payload.split_first() {
        Some((0, body)) => Ok(body.to_vec()),
        Some((&kind, msg)) => Err(TernError::from_kind_byte(
            kind,
            String::from_utf8_lossy(msg).into_owned(),
        )),
        None => Err(TernError::Corruption("empty reply envelope".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, 11, "Worker.Hello", b"oh hey").unwrap();
        let frame = read_frame(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(frame.seq, 11);
        assert_eq!(frame.method, "Worker.Hello");
        assert_eq!(frame.payload, b"oh hey");
    }

    #[test]
    fn frames_stream_back_to_back() {
        let mut wire = Vec::new();
        write_frame(&mut wire, 1, "Worker.Hello", b"a").unwrap();
        write_frame(&mut wire, 2, "Worker.ServeTask", b"bb").unwrap();
        let mut cursor = Cursor::new(&wire);
        assert_eq!(read_frame(&mut cursor).unwrap().seq, 1);
        let second = read_frame(&mut cursor).unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.payload, b"bb");
    }

    #[test]
    fn empty_payload_is_fine() {
        let mut wire = Vec::new();
        write_frame(&mut wire, 3, "Worker.CheckVersion", b"").unwrap();
        let frame = read_frame(&mut Cursor::new(&wire)).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn implausible_lengths_are_corruption() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&7u64.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        assert!(matches!(
            read_frame(&mut Cursor::new(&wire)),
            Err(TernError::Corruption(_))
        ));

        let mut wire = Vec::new();
        wire.extend_from_slice(&7u64.to_be_bytes());
        wire.extend_from_slice(&5u16.to_be_bytes());
        wire.extend_from_slice(b"Hello");
        wire.extend_from_slice(&(-1i32).to_be_bytes());
        assert!(matches!(
            read_frame(&mut Cursor::new(&wire)),
            Err(TernError::Corruption(_))
        ));
    }

    #[test]
    fn reply_envelope_roundtrip() {
        assert_eq!(decode_reply(&encode_reply_ok(b"body")).unwrap(), b"body");
        let err = decode_reply(&encode_reply_err(&TernError::WrongShard("xid x".into())));
        assert!(matches!(err, Err(TernError::WrongShard(_))));
    }
}
