use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KiraError;

/// A semi-structured document body: attribute group name -> value.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

/// Name of an identifier namespace (`entrez`, `ensembl`, `swissprot`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scheme(String);

impl Scheme {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Scheme {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let is_valid = !value.trim().is_empty()
            && value
                .trim()
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(KiraError::UnknownScheme(value.to_string()));
        }
        Ok(Self::new(value))
    }
}

impl From<&str> for Scheme {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A document identifier. Numeric ids (Entrez) and string ids (Ensembl, UniProt)
/// arrive from different parsers; both are kept distinct and totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocKey {
    Int(i64),
    Str(String),
}

impl DocKey {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(DocKey::Int),
            Value::String(text) if !text.trim().is_empty() => Some(DocKey::Str(text.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocKey::Int(value) => Value::from(*value),
            DocKey::Str(value) => Value::String(value.clone()),
        }
    }

    /// Numeric strings become `Int`; anything else is returned unchanged.
    pub fn to_integer(&self) -> Self {
        match self {
            DocKey::Str(text) => text
                .trim()
                .parse::<i64>()
                .map(DocKey::Int)
                .unwrap_or_else(|_| self.clone()),
            DocKey::Int(_) => self.clone(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DocKey::Int(value) => Some(*value),
            DocKey::Str(_) => None,
        }
    }
}

impl Ord for DocKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DocKey::Int(a), DocKey::Int(b)) => a.cmp(b),
            (DocKey::Str(a), DocKey::Str(b)) => a.cmp(b),
            (DocKey::Int(_), DocKey::Str(_)) => Ordering::Less,
            (DocKey::Str(_), DocKey::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for DocKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Int(value) => write!(f, "{value}"),
            DocKey::Str(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for DocKey {
    fn from(value: i64) -> Self {
        DocKey::Int(value)
    }
}

impl From<&str> for DocKey {
    fn from(value: &str) -> Self {
        DocKey::Str(value.to_string())
    }
}

impl From<String> for DocKey {
    fn from(value: String) -> Self {
        DocKey::Str(value)
    }
}

/// One partial document as produced by a source parser.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub key: DocKey,
    pub payload: Document,
}

impl RawRecord {
    pub fn new(key: impl Into<DocKey>, payload: Document) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Splits a JSON object carrying `_id` into key and payload.
    pub fn from_json(mut object: Document) -> Result<Self, String> {
        let id = object
            .remove(ID_FIELD)
            .ok_or_else(|| "record has no _id".to_string())?;
        let key = DocKey::from_value(&id).ok_or_else(|| format!("unsupported _id value: {id}"))?;
        Ok(Self {
            key,
            payload: object,
        })
    }

    /// Reads a field by dotted path; `_id` addresses the native key.
    pub fn field(&self, path: &str) -> Option<Value> {
        if path == ID_FIELD {
            return Some(self.key.to_value());
        }
        lookup_path(&self.payload, path).cloned()
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert(ID_FIELD.to_string(), self.key.to_value());
        for (name, value) in &self.payload {
            object.insert(name.clone(), value.clone());
        }
        Value::Object(object)
    }
}

/// A merged document ready for the target sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetDocument {
    #[serde(rename = "_id")]
    pub id: DocKey,
    #[serde(flatten)]
    pub groups: Document,
}

impl TargetDocument {
    pub fn new(id: DocKey) -> Self {
        Self {
            id,
            groups: Document::new(),
        }
    }

    pub fn group(&self, name: &str) -> Option<&Value> {
        self.groups.get(name)
    }
}

/// Walks a dotted path (`pantherdb.uniprot_kb`) through nested objects.
pub fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = document.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}
