//! Schema directives: typed predicates plus `@index`, `@reverse` and
//! `@count` hints, parsed from a schema file and persisted as a side
//! table under the schema namespace at the end of a bulk load.
//!
//! ```text
//! name: string @index(exact, term) .
//! age: int @index(int) .
//! friend: uid @reverse @count .
//! ```

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, TernError};
use crate::keys;
use crate::model::{TypedValue, ValueType};
use crate::store::ByteStore;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SchemaType {
    Default,
    Uid,
    Str,
    Int,
    Float,
    Bool,
    DateTime,
    Geo,
}

impl SchemaType {
    fn parse(token: &str) -> Result<Self> {
        match token {
            "default" => Ok(Self::Default),
            "uid" => Ok(Self::Uid),
            "string" => Ok(Self::Str),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" => Ok(Self::Bool),
            "datetime" | "dateTime" => Ok(Self::DateTime),
            "geo" => Ok(Self::Geo),
            other => Err(TernError::SchemaViolation(format!(
                "unknown schema type {other:?}"
            ))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Uid => 1,
            Self::Str => 2,
            Self::Int => 3,
            Self::Float => 4,
            Self::Bool => 5,
            Self::DateTime => 6,
            Self::Geo => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    pub value_type: SchemaType,
    pub indexes: Vec<String>,
    pub reverse: bool,
    pub count: bool,
}

impl SchemaEntry {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.value_type.to_byte());
        out.push(u8::from(self.reverse) | (u8::from(self.count) << 1));
        out.extend_from_slice(self.indexes.join(",").as_bytes());
        out
    }
}

/// Parses a whole schema file. Lines are `pred: type [directives] .`;
/// blank lines and `#` comments are skipped.
pub fn parse(text: &str) -> Result<Vec<(String, SchemaEntry)>> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_suffix('.').map(str::trim).ok_or_else(|| {
            TernError::SchemaViolation(format!("schema line missing '.': {raw:?}"))
        })?;
        let (pred, rest) = line.split_once(':').ok_or_else(|| {
            TernError::SchemaViolation(format!("schema line missing ':': {raw:?}"))
        })?;
        let pred = pred.trim();
        if pred.is_empty() {
            return Err(TernError::SchemaViolation(format!(
                "empty predicate in schema line {raw:?}"
            )));
        }

        let mut tokens = rest.split_whitespace();
        let type_token = tokens.next().ok_or_else(|| {
            TernError::SchemaViolation(format!("schema line missing type: {raw:?}"))
        })?;
        let mut entry = SchemaEntry {
            value_type: SchemaType::parse(type_token)?,
            indexes: Vec::new(),
            reverse: false,
            count: false,
        };
        for token in tokens {
            if let Some(args) = token
                .strip_prefix("@index(")
                .and_then(|t| t.strip_suffix(')'))
            {
                entry
                    .indexes
                    .extend(args.split(',').map(|t| t.trim().to_string()));
            } else if token == "@reverse" {
                entry.reverse = true;
            } else if token == "@count" {
                entry.count = true;
            } else {
                return Err(TernError::SchemaViolation(format!(
                    "unknown schema directive {token:?}"
                )));
            }
        }
        out.push((pred.to_string(), entry));
    }
    Ok(out)
}

/// The in-process schema table.
pub struct SchemaStore {
    entries: RwLock<HashMap<String, SchemaEntry>>,
}

impl SchemaStore {
    pub fn new(initial: Vec<(String, SchemaEntry)>) -> Self {
        SchemaStore {
            entries: RwLock::new(initial.into_iter().collect()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn get(&self, predicate: &str) -> Option<SchemaEntry> {
        self.entries.read().get(predicate).cloned()
    }

    /// Checks an object value against the predicate's declared type.
    /// Untyped predicates accept anything.
    pub fn check_value(&self, predicate: &str, value: &TypedValue) -> Result<()> {
        let Some(entry) = self.get(predicate) else {
            return Ok(());
        };
        let ok = matches!(
            (entry.value_type, value.value_type()),
            (SchemaType::Default, _)
                | (SchemaType::Str, ValueType::Str)
                | (SchemaType::Int, ValueType::Int)
                | (SchemaType::Float, ValueType::Float)
                | (SchemaType::Bool, ValueType::Bool)
                | (SchemaType::DateTime, ValueType::DateTime)
                | (SchemaType::Geo, ValueType::Geo)
        );
        if ok {
            Ok(())
        } else {
            Err(TernError::SchemaViolation(format!(
                "predicate {predicate:?} declared {:?} but got {:?}",
                entry.value_type,
                value.value_type()
            )))
        }
    }

    /// Persists every entry under the schema namespace.
    pub fn write(&self, store: &dyn ByteStore) -> Result<()> {
        let entries = self.entries.read();
        let batch: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(pred, entry)| (keys::schema_key(pred), entry.encode()))
            .collect();
        store.write_batch(&batch)
    }
}
