//! Flat encoding for postings and posting lists.
//!
//! Records are position-indexed so a reader never allocates: every field
//! of a posting is read straight out of the backing slice, and appending
//! a posting to a new list is a single copy of its record bytes.
//!
//! Record layout (little-endian):
//!
//! ```text
//! uid: u64 | ts: i64 | op: u8 | vtype: u8 | source_len: u16 | value_len: u32
//! | source bytes | value bytes
//! ```
//!
//! List layout: `count: u32 | offset[count]: u32 | records...` with
//! offsets absolute from the start of the list. The canonical empty list
//! is four zero bytes.

use crate::error::{Result, TernError};
use crate::model::{DirectedEdge, Op, TypedValue, ValueType};

pub const RECORD_HEADER_SIZE: usize = 24;

/// The canonical encoding of an empty posting list.
pub fn empty_list() -> Vec<u8> {
    vec![0, 0, 0, 0]
}

/// One posting, owned. The flat representation is the source of truth;
/// this form exists for the mutation index and merge paths.
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub uid: u64,
    pub ts: i64,
    pub op: Op,
    pub vtype: ValueType,
    pub source: String,
    pub value: Vec<u8>,
}

impl Posting {
    pub fn from_edge(edge: &DirectedEdge, op: Op) -> Self {
        let (vtype, value) = match &edge.value {
            Some(v) => (v.value_type(), v.encode()),
            None => (ValueType::None, Vec::new()),
        };
        Posting {
            uid: edge.posting_uid(),
            ts: edge.ts,
            op,
            vtype,
            source: edge.source.clone(),
            value,
        }
    }

    pub fn typed_value(&self) -> Result<TypedValue> {
        TypedValue::decode(self.vtype, &self.value)
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.source.len() + self.value.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.push(self.op.to_byte());
        out.push(self.vtype.to_byte());
        out.extend_from_slice(&(self.source.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(&self.value);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        PostingRef::new(bytes)?.to_owned()
    }
}

/// Zero-copy view of one encoded posting record.
#[derive(Copy, Clone)]
pub struct PostingRef<'a> {
    data: &'a [u8],
}

impl<'a> PostingRef<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(TernError::Corruption("posting record truncated".into()));
        }
        let r = PostingRef { data };
        let want = RECORD_HEADER_SIZE + r.source_len() + r.value_len();
        if data.len() < want {
            return Err(TernError::Corruption(
                "posting record shorter than header claims".into(),
            ));
        }
        Ok(r)
    }

    pub fn uid(&self) -> u64 {
        u64::from_le_bytes(self.data[0..8].try_into().expect("8-byte slice"))
    }

    pub fn ts(&self) -> i64 {
        i64::from_le_bytes(self.data[8..16].try_into().expect("8-byte slice"))
    }

    pub fn op_byte(&self) -> u8 {
        self.data[16]
    }

    pub fn vtype_byte(&self) -> u8 {
        self.data[17]
    }

    fn source_len(&self) -> usize {
        u16::from_le_bytes(self.data[18..20].try_into().expect("2-byte slice")) as usize
    }

    fn value_len(&self) -> usize {
        u32::from_le_bytes(self.data[20..24].try_into().expect("4-byte slice")) as usize
    }

    pub fn source(&self) -> &'a [u8] {
        &self.data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + self.source_len()]
    }

    pub fn value(&self) -> &'a [u8] {
        let start = RECORD_HEADER_SIZE + self.source_len();
        &self.data[start..start + self.value_len()]
    }

    /// The exact record bytes, for append-by-copy.
    pub fn record_bytes(&self) -> &'a [u8] {
        &self.data[..RECORD_HEADER_SIZE + self.source_len() + self.value_len()]
    }

    pub fn to_owned(&self) -> Result<Posting> {
        Ok(Posting {
            uid: self.uid(),
            ts: self.ts(),
            op: Op::from_byte(self.op_byte())?,
            vtype: ValueType::from_byte(self.vtype_byte())?,
            source: String::from_utf8(self.source().to_vec())
                .map_err(|_| TernError::Corruption("non-utf8 posting source".into()))?,
            value: self.value().to_vec(),
        })
    }
}

/// Read-only view over an encoded posting list.
pub struct ListReader<'a> {
    data: &'a [u8],
    count: usize,
}

impl<'a> ListReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TernError::Corruption("posting list truncated".into()));
        }
        let count = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice")) as usize;
        if data.len() < 4 + count * 4 {
            return Err(TernError::Corruption(
                "posting list offset table truncated".into(),
            ));
        }
        Ok(ListReader { data, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, i: usize) -> Result<PostingRef<'a>> {
        if i >= self.count {
            return Err(TernError::Corruption(format!(
                "posting index {i} out of bounds ({})",
                self.count
            )));
        }
        let at = 4 + i * 4;
        let off = u32::from_le_bytes(self.data[at..at + 4].try_into().expect("4-byte slice"))
            as usize;
        if off > self.data.len() {
            return Err(TernError::Corruption(
                "posting offset beyond list bounds".into(),
            ));
        }
        PostingRef::new(&self.data[off..])
    }

    pub fn iter(&self) -> ListIter<'a, '_> {
        ListIter {
            reader: self,
            next: 0,
        }
    }
}

pub struct ListIter<'a, 'r> {
    reader: &'r ListReader<'a>,
    next: usize,
}

impl<'a> Iterator for ListIter<'a, '_> {
    type Item = Result<PostingRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.reader.len() {
            return None;
        }
        let item = self.reader.get(self.next);
        self.next += 1;
        Some(item)
    }
}

/// Builds an encoded posting list by appending records.
#[derive(Default)]
pub struct ListBuilder {
    offsets: Vec<u32>,
    records: Vec<u8>,
}

impl ListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn push(&mut self, posting: &Posting) {
        self.offsets.push(self.records.len() as u32);
        posting.encode_into(&mut self.records);
    }

    /// Appends an already-encoded record without decoding it.
    pub fn push_ref(&mut self, posting: &PostingRef<'_>) {
        self.offsets.push(self.records.len() as u32);
        self.records.extend_from_slice(posting.record_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        let count = self.offsets.len();
        let header = 4 + count * 4;
        let mut out = Vec::with_capacity(header + self.records.len());
        out.extend_from_slice(&(count as u32).to_le_bytes());
        for off in &self.offsets {
            out.extend_from_slice(&(off + header as u32).to_le_bytes());
        }
        out.extend_from_slice(&self.records);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(uid: u64, value: &[u8]) -> Posting {
        Posting {
            uid,
            ts: 42,
            op: Op::Set,
            vtype: if value.is_empty() {
                ValueType::None
            } else {
                ValueType::Str
            },
            source: "test".into(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn record_roundtrip() {
        let p = sample(7, b"hello");
        let mut buf = Vec::new();
        p.encode_into(&mut buf);
        let r = PostingRef::new(&buf).unwrap();
        assert_eq!(r.uid(), 7);
        assert_eq!(r.ts(), 42);
        assert_eq!(r.source(), b"test");
        assert_eq!(r.value(), b"hello");
        assert_eq!(r.to_owned().unwrap(), p);
    }

    #[test]
    fn list_roundtrip() {
        let mut b = ListBuilder::new();
        for uid in [1u64, 5, 9] {
            b.push(&sample(uid, b"v"));
        }
        let bytes = b.finish();
        let reader = ListReader::new(&bytes).unwrap();
        assert_eq!(reader.len(), 3);
        let uids: Vec<u64> = reader.iter().map(|p| p.unwrap().uid()).collect();
        assert_eq!(uids, vec![1, 5, 9]);
    }

    #[test]
    fn empty_list_is_canonical() {
        let empty = empty_list();
        let reader = ListReader::new(&empty).unwrap();
        assert_eq!(reader.len(), 0);
        assert_eq!(ListBuilder::new().finish(), empty_list());
    }

    #[test]
    fn append_by_copy_preserves_bytes() {
        let p = sample(3, b"payload");
        let mut buf = Vec::new();
        p.encode_into(&mut buf);
        let r = PostingRef::new(&buf).unwrap();

        let mut b = ListBuilder::new();
        b.push_ref(&r);
        let bytes = b.finish();
        let reader = ListReader::new(&bytes).unwrap();
        assert_eq!(reader.get(0).unwrap().record_bytes(), &buf[..]);
    }

    #[test]
    fn truncated_list_is_corruption() {
        assert!(matches!(
            ListReader::new(&[1, 0]),
            Err(TernError::Corruption(_))
        ));
        // Count claims one entry but the offset table is missing.
        assert!(matches!(
            ListReader::new(&[1, 0, 0, 0]),
            Err(TernError::Corruption(_))
        ));
    }

    #[test]
    fn garbage_record_is_corruption() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(b"nonsense");
        let reader = ListReader::new(&bytes).unwrap();
        assert!(matches!(reader.get(0), Err(TernError::Corruption(_))));
    }
}
