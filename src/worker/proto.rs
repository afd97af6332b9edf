//! Payload schemas for the worker methods. Counts and lengths are
//! big-endian, matching the frame header; bodies are opaque bytes.

use crate::error::{Result, TernError};

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(TernError::Corruption("rpc payload truncated".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn done(&self) -> Result<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(TernError::Corruption("trailing bytes in rpc payload".into()))
        }
    }
}

pub fn encode_xid_list(xids: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(xids.len() as u32).to_be_bytes());
    for xid in xids {
        out.extend_from_slice(&(xid.len() as u16).to_be_bytes());
        out.extend_from_slice(xid.as_bytes());
    }
    out
}

pub fn decode_xid_list(payload: &[u8]) -> Result<Vec<String>> {
    let mut c = Cursor::new(payload);
    let count = c.u32()? as usize;
    let mut xids = Vec::with_capacity(count);
    for _ in 0..count {
        let len = c.u16()? as usize;
        let bytes = c.take(len)?;
        xids.push(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| TernError::Corruption("non-utf8 xid on wire".into()))?,
        );
    }
    c.done()?;
    Ok(xids)
}

pub fn encode_uid_list(uids: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + uids.len() * 8);
    out.extend_from_slice(&(uids.len() as u32).to_be_bytes());
    for uid in uids {
        out.extend_from_slice(&uid.to_be_bytes());
    }
    out
}

pub fn decode_uid_list(payload: &[u8]) -> Result<Vec<u64>> {
    let mut c = Cursor::new(payload);
    let count = c.u32()? as usize;
    let mut uids = Vec::with_capacity(count);
    for _ in 0..count {
        uids.push(c.u64()?);
    }
    c.done()?;
    Ok(uids)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskQuery {
    pub attr: String,
    pub uids: Vec<u64>,
}

pub fn encode_task_query(query: &TaskQuery) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(query.attr.len() as u16).to_be_bytes());
    out.extend_from_slice(query.attr.as_bytes());
    out.extend_from_slice(&(query.uids.len() as u32).to_be_bytes());
    for uid in &query.uids {
        out.extend_from_slice(&uid.to_be_bytes());
    }
    out
}

pub fn decode_task_query(payload: &[u8]) -> Result<TaskQuery> {
    let mut c = Cursor::new(payload);
    let attr_len = c.u16()? as usize;
    let attr = String::from_utf8(c.take(attr_len)?.to_vec())
        .map_err(|_| TernError::Corruption("non-utf8 attribute on wire".into()))?;
    let count = c.u32()? as usize;
    let mut uids = Vec::with_capacity(count);
    for _ in 0..count {
        uids.push(c.u64()?);
    }
    c.done()?;
    Ok(TaskQuery { attr, uids })
}

/// Per input uid: its scalar value (or empty) and its uid list, aligned
/// by index with the query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResult {
    pub values: Vec<Vec<u8>>,
    pub uid_matrix: Vec<Vec<u64>>,
}

pub fn encode_task_result(result: &TaskResult) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(result.values.len() as u32).to_be_bytes());
    for value in &result.values {
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out.extend_from_slice(&(result.uid_matrix.len() as u32).to_be_bytes());
    for row in &result.uid_matrix {
        out.extend_from_slice(&(row.len() as u32).to_be_bytes());
        for uid in row {
            out.extend_from_slice(&uid.to_be_bytes());
        }
    }
    out
}

pub fn decode_task_result(payload: &[u8]) -> Result<TaskResult> {
    let mut c = Cursor::new(payload);
    let value_count = c.u32()? as usize;
    let mut values = Vec::with_capacity(value_count);
    for _ in 0..value_count {
        let len = c.u32()? as usize;
        values.push(c.take(len)?.to_vec());
    }
    let row_count = c.u32()? as usize;
    let mut uid_matrix = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let len = c.u32()? as usize;
        let mut row = Vec::with_capacity(len);
        for _ in 0..len {
            row.push(c.u64()?);
        }
        uid_matrix.push(row);
    }
    c.done()?;
    Ok(TaskResult { values, uid_matrix })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_list_roundtrip() {
        let xids = vec!["alice".to_string(), "_:b".to_string(), "".to_string()];
        assert_eq!(decode_xid_list(&encode_xid_list(&xids)).unwrap(), xids);
    }

    #[test]
    fn uid_list_roundtrip() {
        let uids = vec![1u64, u64::MAX, 0];
        assert_eq!(decode_uid_list(&encode_uid_list(&uids)).unwrap(), uids);
    }

    #[test]
    fn task_query_roundtrip() {
        let query = TaskQuery {
            attr: "friend".into(),
            uids: vec![3, 1, 4],
        };
        assert_eq!(
            decode_task_query(&encode_task_query(&query)).unwrap(),
            query
        );
    }

    #[test]
    fn task_result_roundtrip() {
        let result = TaskResult {
            values: vec![b"Alice".to_vec(), Vec::new()],
            uid_matrix: vec![vec![], vec![5, 7]],
        };
        assert_eq!(
            decode_task_result(&encode_task_result(&result)).unwrap(),
            result
        );
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let mut bytes = encode_uid_list(&[1, 2, 3]);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            decode_uid_list(&bytes),
            Err(TernError::Corruption(_))
        ));
    }
}
