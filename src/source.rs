use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{RawRecord, Scheme};
use crate::error::{KiraError, RecordError};
use crate::graph::InputHint;
use crate::mapper::KeyConvert;

pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<RawRecord, RecordError>> + Send + 'a>;

/// How a source's records are keyed and translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSchema {
    /// Upstream data release the collection was uploaded from, e.g. `ensembl`
    /// for `ensembl_interpro`.
    pub main_source: Option<String>,
    pub key_scheme: Scheme,
    /// Translation hints; defaults to the native key in `key_scheme`.
    pub key_lookup: Vec<InputHint>,
    pub skip_on_failure: bool,
    /// Applied to every native key as it is read, e.g. `"1017"` to `1017`.
    pub convert: KeyConvert,
}

impl SourceSchema {
    pub fn new(key_scheme: impl Into<Scheme>) -> Self {
        Self {
            main_source: None,
            key_scheme: key_scheme.into(),
            key_lookup: Vec::new(),
            skip_on_failure: false,
            convert: KeyConvert::AsIs,
        }
    }

    pub fn with_main_source(mut self, main_source: impl Into<String>) -> Self {
        self.main_source = Some(main_source.into());
        self
    }

    pub fn with_key_lookup(mut self, hints: Vec<InputHint>) -> Self {
        self.key_lookup = hints;
        self
    }

    pub fn skip_on_failure(mut self, skip: bool) -> Self {
        self.skip_on_failure = skip;
        self
    }

    pub fn with_convert(mut self, convert: KeyConvert) -> Self {
        self.convert = convert;
        self
    }

    pub fn input_hints(&self) -> Vec<InputHint> {
        if self.key_lookup.is_empty() {
            vec![InputHint::new(self.key_scheme.clone(), crate::domain::ID_FIELD)]
        } else {
            self.key_lookup.clone()
        }
    }
}

/// A read-only collection of partial documents keyed in its native scheme.
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> &SourceSchema;

    /// Streams records in source order. Failing to open the stream is fatal;
    /// individual bad records come back as `RecordError` items.
    fn stream(&self) -> Result<RecordStream<'_>, KiraError>;
}

/// Sources available to builds, addressed by collection name.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn SourceAdapter>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SourceAdapter>, KiraError> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| KiraError::UnknownSource(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.sources.keys()).finish()
    }
}

/// Records held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    schema: SourceSchema,
    records: Vec<Result<RawRecord, RecordError>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, schema: SourceSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            records: Vec::new(),
        }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item = RawRecord>) -> Self {
        self.records.extend(records.into_iter().map(Ok));
        self
    }

    /// Parses JSON objects carrying `_id`; objects that fail become record errors.
    pub fn with_json(mut self, objects: impl IntoIterator<Item = Value>) -> Self {
        for (index, object) in objects.into_iter().enumerate() {
            let record = match object {
                Value::Object(map) => RawRecord::from_json(map)
                    .map_err(|reason| RecordError::new(&self.name, Some(index + 1), reason)),
                other => Err(RecordError::new(
                    &self.name,
                    Some(index + 1),
                    format!("expected object, found {other}"),
                )),
            };
            self.records.push(record);
        }
        self
    }

    pub fn push_error(&mut self, error: RecordError) {
        self.records.push(Err(error));
    }
}

impl SourceAdapter for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn stream(&self) -> Result<RecordStream<'_>, KiraError> {
        Ok(Box::new(self.records.iter().cloned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Jsonl,
    Panther,
}

/// One JSON object per line, `_id` holding the native key. `.gz` files are
/// decompressed on the fly.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    name: String,
    schema: SourceSchema,
    path: Utf8PathBuf,
}

impl JsonLinesSource {
    pub fn new(
        name: impl Into<String>,
        schema: SourceSchema,
        path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl SourceAdapter for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn stream(&self) -> Result<RecordStream<'_>, KiraError> {
        let lines = open_lines(&self.name, &self.path)?;
        let name = self.name.as_str();
        Ok(Box::new(lines.filter_map(move |(line_no, line)| {
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(RecordError::new(name, Some(line_no), err))),
            };
            if line.trim().is_empty() {
                return None;
            }
            let parsed = match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(object)) => RawRecord::from_json(object)
                    .map_err(|reason| RecordError::new(name, Some(line_no), reason)),
                Ok(other) => Err(RecordError::new(
                    name,
                    Some(line_no),
                    format!("expected object, found {other}"),
                )),
                Err(err) => Err(RecordError::new(name, Some(line_no), err.to_string())),
            };
            Some(parsed)
        })))
    }
}

pub type NumberedLines = Box<dyn Iterator<Item = (usize, Result<String, String>)> + Send>;

/// Opens a possibly gzip-compressed text file as numbered lines (1-based).
pub fn open_lines(source_name: &str, path: &Utf8Path) -> Result<NumberedLines, KiraError> {
    let file = File::open(path.as_std_path()).map_err(|err| KiraError::SourceRead {
        source_name: source_name.to_string(),
        reason: format!("open {path}: {err}"),
    })?;
    let reader: Box<dyn Read + Send> = if path.extension() == Some("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    debug!(source = source_name, path = %path, "streaming source file");
    Ok(Box::new(
        BufReader::new(reader)
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.map_err(|err| err.to_string()))),
    ))
}
