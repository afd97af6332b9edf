use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TernError};

/// Wall-clock nanoseconds, the timestamp recorded on postings.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Sentinel uid marking a scalar-valued posting. Never assigned to an
/// entity; the uid assigner rehashes on collision.
pub const MAX_UID: u64 = u64::MAX;

/// Reserved attribute storing the uid -> xid reverse edge.
pub const XID_ATTR: &str = "_xid_";

/// Source recorded on postings written by the uid assigner.
pub const ASSIGNER_SOURCE: &str = "_assigner_";

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Set = 0x01,
    Del = 0x02,
}

impl Op {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Op::Set),
            0x02 => Ok(Op::Del),
            other => Err(TernError::Corruption(format!(
                "unknown mutation op: 0x{other:02X}"
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValueType {
    None = 0x00,
    Str = 0x01,
    Int = 0x02,
    Float = 0x03,
    Bool = 0x04,
    DateTime = 0x05,
    Geo = 0x06,
    Bytes = 0x07,
}

impl ValueType {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Str),
            0x02 => Ok(Self::Int),
            0x03 => Ok(Self::Float),
            0x04 => Ok(Self::Bool),
            0x05 => Ok(Self::DateTime),
            0x06 => Ok(Self::Geo),
            0x07 => Ok(Self::Bytes),
            other => Err(TernError::Corruption(format!(
                "unknown value type: 0x{other:02X}"
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A typed scalar object value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// RFC 3339 text, kept verbatim.
    DateTime(String),
    /// WKT or GeoJSON text, kept verbatim.
    Geo(String),
    Bytes(Vec<u8>),
}

impl TypedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TypedValue::Str(_) => ValueType::Str,
            TypedValue::Int(_) => ValueType::Int,
            TypedValue::Float(_) => ValueType::Float,
            TypedValue::Bool(_) => ValueType::Bool,
            TypedValue::DateTime(_) => ValueType::DateTime,
            TypedValue::Geo(_) => ValueType::Geo,
            TypedValue::Bytes(_) => ValueType::Bytes,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            TypedValue::Str(s) | TypedValue::DateTime(s) | TypedValue::Geo(s) => {
                s.as_bytes().to_vec()
            }
            TypedValue::Int(n) => n.to_le_bytes().to_vec(),
            TypedValue::Float(f) => f.to_le_bytes().to_vec(),
            TypedValue::Bool(b) => vec![u8::from(*b)],
            TypedValue::Bytes(b) => b.clone(),
        }
    }

    pub fn decode(vtype: ValueType, bytes: &[u8]) -> Result<Self> {
        let utf8 = |bytes: &[u8]| {
            String::from_utf8(bytes.to_vec())
                .map_err(|_| TernError::Corruption("non-utf8 string value".into()))
        };
        match vtype {
            ValueType::Str => Ok(TypedValue::Str(utf8(bytes)?)),
            ValueType::DateTime => Ok(TypedValue::DateTime(utf8(bytes)?)),
            ValueType::Geo => Ok(TypedValue::Geo(utf8(bytes)?)),
            ValueType::Int => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| TernError::Corruption("int value is not 8 bytes".into()))?;
                Ok(TypedValue::Int(i64::from_le_bytes(arr)))
            }
            ValueType::Float => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| TernError::Corruption("float value is not 8 bytes".into()))?;
                Ok(TypedValue::Float(f64::from_le_bytes(arr)))
            }
            ValueType::Bool => match bytes {
                [0] => Ok(TypedValue::Bool(false)),
                [1] => Ok(TypedValue::Bool(true)),
                _ => Err(TernError::Corruption("bool value is not one byte".into())),
            },
            ValueType::Bytes => Ok(TypedValue::Bytes(bytes.to_vec())),
            ValueType::None => Err(TernError::Corruption("decode of None value type".into())),
        }
    }
}

/// The normalized form consumed by the posting engine. Exactly one of
/// `value_id` and `value` is meaningful: an edge either points at another
/// entity or carries a typed scalar.
#[derive(Debug, Clone)]
pub struct DirectedEdge {
    pub entity: u64,
    pub attribute: String,
    pub value_id: u64,
    pub value: Option<TypedValue>,
    pub source: String,
    pub ts: i64,
}

impl DirectedEdge {
    pub fn to_uid(entity: u64, attribute: &str, value_id: u64, source: &str, ts: i64) -> Self {
        Self {
            entity,
            attribute: attribute.to_string(),
            value_id,
            value: None,
            source: source.to_string(),
            ts,
        }
    }

    pub fn to_value(
        entity: u64,
        attribute: &str,
        value: TypedValue,
        source: &str,
        ts: i64,
    ) -> Self {
        Self {
            entity,
            attribute: attribute.to_string(),
            value_id: 0,
            value: Some(value),
            source: source.to_string(),
            ts,
        }
    }

    /// The uid recorded in the posting for this edge.
    pub fn posting_uid(&self) -> u64 {
        if self.value.is_some() {
            MAX_UID
        } else {
            self.value_id
        }
    }
}

/// One parsed N-Quads line. Blank nodes stay in `subject` / `object_id`
/// as `_:name` xids until uid resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NQuad {
    pub subject: String,
    pub predicate: String,
    pub object_id: String,
    pub object_value: Option<TypedValue>,
    pub label: String,
    pub lang: String,
}

impl NQuad {
    pub fn has_uid_object(&self) -> bool {
        !self.object_id.is_empty()
    }

    /// Builds the edge once the subject (and object, for uid edges) have
    /// been resolved to uids.
    pub fn to_edge(&self, subject_uid: u64, object_uid: u64, ts: i64) -> Result<DirectedEdge> {
        let source = if self.label.is_empty() {
            "rdf"
        } else {
            self.label.as_str()
        };
        if self.has_uid_object() {
            return Ok(DirectedEdge::to_uid(
                subject_uid,
                &self.predicate,
                object_uid,
                source,
                ts,
            ));
        }
        let value = self
            .object_value
            .clone()
            .ok_or_else(|| TernError::InvalidOp("nquad has neither object id nor value".into()))?;
        Ok(DirectedEdge::to_value(
            subject_uid,
            &self.predicate,
            value,
            source,
            ts,
        ))
    }
}
