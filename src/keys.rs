//! Key encoding for the byte store.
//!
//! One tag byte selects the namespace. Within the data, index, and
//! reverse namespaces the predicate sorts before the entity, so every key
//! of one predicate is contiguous in ordered traversal:
//!
//! ```text
//! data:    0x00 | plen: u16 BE | predicate | 0x00 | entity: u64 BE
//! xid:     0x01 | xid bytes                          (xid -> uid)
//! index:   0x02 | plen: u16 BE | predicate | sub_tag | payload
//! reverse: 0x03 | plen: u16 BE | predicate | 0x00 | entity: u64 BE
//! schema:  0x04 | predicate
//! ```

use crate::error::{Result, TernError};

pub const DATA_TAG: u8 = 0x00;
pub const XID_TAG: u8 = 0x01;
pub const INDEX_TAG: u8 = 0x02;
pub const REVERSE_TAG: u8 = 0x03;
pub const SCHEMA_TAG: u8 = 0x04;

/// Sub-tag under the index namespace for postings-per-predicate counts.
pub const COUNT_PRED_SUB: u8 = 0x01;
/// Synthetic predicate under which per-value-type counts are stored.
pub const COUNT_TYPE_PRED: &str = "_vtype_";

fn tagged(tag: u8, attribute: &str, sub_tag: u8, entity: u64) -> Vec<u8> {
    let pred = attribute.as_bytes();
    let mut key = Vec::with_capacity(1 + 2 + pred.len() + 1 + 8);
    key.push(tag);
    key.extend_from_slice(&(pred.len() as u16).to_be_bytes());
    key.extend_from_slice(pred);
    key.push(sub_tag);
    key.extend_from_slice(&entity.to_be_bytes());
    key
}

/// The posting-list key for `(entity, attribute)`.
pub fn data_key(entity: u64, attribute: &str) -> Vec<u8> {
    tagged(DATA_TAG, attribute, 0x00, entity)
}

pub fn reverse_key(entity: u64, attribute: &str) -> Vec<u8> {
    tagged(REVERSE_TAG, attribute, 0x00, entity)
}

/// Forward lookup key: xid -> uid.
pub fn xid_key(xid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + xid.len());
    key.push(XID_TAG);
    key.extend_from_slice(xid.as_bytes());
    key
}

/// Count-index key for one predicate's posting tally.
pub fn count_pred_key(attribute: &str) -> Vec<u8> {
    let pred = attribute.as_bytes();
    let mut key = Vec::with_capacity(1 + 2 + pred.len() + 1);
    key.push(INDEX_TAG);
    key.extend_from_slice(&(pred.len() as u16).to_be_bytes());
    key.extend_from_slice(pred);
    key.push(COUNT_PRED_SUB);
    key
}

/// Count-index key for one value type's posting tally.
pub fn count_type_key(vtype: u8) -> Vec<u8> {
    let pred = COUNT_TYPE_PRED.as_bytes();
    let mut key = Vec::with_capacity(1 + 2 + pred.len() + 1);
    key.push(INDEX_TAG);
    key.extend_from_slice(&(pred.len() as u16).to_be_bytes());
    key.extend_from_slice(pred);
    key.push(vtype);
    key
}

pub fn schema_key(attribute: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + attribute.len());
    key.push(SCHEMA_TAG);
    key.extend_from_slice(attribute.as_bytes());
    key
}

/// Decodes a data-namespace key back into `(attribute, entity)`.
pub fn parse_data_key(key: &[u8]) -> Result<(String, u64)> {
    if key.len() < 4 || key[0] != DATA_TAG {
        return Err(TernError::Corruption("not a data key".into()));
    }
    let plen = u16::from_be_bytes(key[1..3].try_into().expect("2-byte slice")) as usize;
    let want = 1 + 2 + plen + 1 + 8;
    if key.len() != want {
        return Err(TernError::Corruption("data key has wrong length".into()));
    }
    let attribute = String::from_utf8(key[3..3 + plen].to_vec())
        .map_err(|_| TernError::Corruption("non-utf8 predicate in key".into()))?;
    let entity = u64::from_be_bytes(key[4 + plen..].try_into().expect("8-byte slice"));
    Ok((attribute, entity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_key_roundtrip() {
        let key = data_key(42, "friend");
        let (attr, uid) = parse_data_key(&key).unwrap();
        assert_eq!(attr, "friend");
        assert_eq!(uid, 42);
    }

    #[test]
    fn one_predicate_is_contiguous() {
        // All "name" keys sort between the lowest "name" key and the
        // lowest key of the next predicate.
        let a = data_key(0, "name");
        let b = data_key(u64::MAX, "name");
        let other = data_key(1, "namf");
        assert!(a < b);
        assert!(b < other);
    }

    #[test]
    fn entities_sort_numerically_within_predicate() {
        let mut keys = vec![data_key(300, "p"), data_key(2, "p"), data_key(10, "p")];
        keys.sort();
        let uids: Vec<u64> = keys
            .iter()
            .map(|k| parse_data_key(k).unwrap().1)
            .collect();
        assert_eq!(uids, vec![2, 10, 300]);
    }

    #[test]
    fn namespaces_are_disjoint() {
        assert_ne!(data_key(1, "x")[0], xid_key("x")[0]);
        assert_ne!(data_key(1, "x")[0], schema_key("x")[0]);
        assert_ne!(count_pred_key("x")[0], schema_key("x")[0]);
    }
}
