use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::info;

use crate::domain::{DocKey, Document, RawRecord, TargetDocument};
use crate::error::KiraError;
use crate::store::Store;

/// Write side of one target collection. Writes are staged and only become
/// visible when the sink is committed.
pub trait TargetSink {
    fn name(&self) -> &str;

    /// Whether the collection already holds a document for `key`.
    fn contains(&self, key: &DocKey) -> bool;

    /// Makes sure a document exists for `key`, even one without groups.
    fn ensure_document(&mut self, key: &DocKey) -> Result<(), KiraError>;

    /// Sets one attribute group of a document, leaving its other groups alone.
    fn upsert_group(&mut self, key: &DocKey, group: &str, value: Value) -> Result<(), KiraError>;

    /// Publishes the staged collection and returns its document count.
    fn commit(self: Box<Self>) -> Result<usize, KiraError>;
}

/// Factory for target collections.
pub trait TargetBackend: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool, KiraError>;

    /// A new, empty collection. Fails if `name` is already taken.
    fn create(&self, name: &str) -> Result<Box<dyn TargetSink + '_>, KiraError>;

    /// An existing collection, for incremental merges.
    fn open(&self, name: &str) -> Result<Box<dyn TargetSink + '_>, KiraError>;
}

type Collections = BTreeMap<String, BTreeMap<DocKey, Document>>;

/// Collections kept in memory and shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryTargetBackend {
    collections: Arc<Mutex<Collections>>,
}

impl MemoryTargetBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Option<Vec<TargetDocument>> {
        let guard = self.collections.lock().ok()?;
        guard.get(name).map(|documents| to_target_documents(documents))
    }

    pub fn names(&self) -> Vec<String> {
        self.collections
            .lock()
            .map(|guard| guard.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self, name: &str) -> Result<Option<BTreeMap<DocKey, Document>>, KiraError> {
        let guard = self.collections.lock().map_err(|_| KiraError::TargetWrite {
            target: name.to_string(),
            reason: "target lock poisoned".to_string(),
        })?;
        Ok(guard.get(name).cloned())
    }
}

impl TargetBackend for MemoryTargetBackend {
    fn exists(&self, name: &str) -> Result<bool, KiraError> {
        Ok(self.snapshot(name)?.is_some())
    }

    fn create(&self, name: &str) -> Result<Box<dyn TargetSink + '_>, KiraError> {
        if self.exists(name)? {
            return Err(KiraError::TargetExists(name.to_string()));
        }
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            staged: BTreeMap::new(),
            backend: self,
        }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn TargetSink + '_>, KiraError> {
        let staged = self
            .snapshot(name)?
            .ok_or_else(|| KiraError::TargetNotFound(name.to_string()))?;
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            staged,
            backend: self,
        }))
    }
}

struct MemorySink<'a> {
    name: String,
    staged: BTreeMap<DocKey, Document>,
    backend: &'a MemoryTargetBackend,
}

impl TargetSink for MemorySink<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn contains(&self, key: &DocKey) -> bool {
        self.staged.contains_key(key)
    }

    fn ensure_document(&mut self, key: &DocKey) -> Result<(), KiraError> {
        self.staged.entry(key.clone()).or_default();
        Ok(())
    }

    fn upsert_group(&mut self, key: &DocKey, group: &str, value: Value) -> Result<(), KiraError> {
        stage(&mut self.staged, key, group, value);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<usize, KiraError> {
        let count = self.staged.len();
        let mut guard = self
            .backend
            .collections
            .lock()
            .map_err(|_| KiraError::TargetWrite {
                target: self.name.clone(),
                reason: "target lock poisoned".to_string(),
            })?;
        guard.insert(self.name, self.staged);
        Ok(count)
    }
}

/// Collections stored as JSON-lines files under the project store's
/// `targets/` directory, one document per line in key order.
#[derive(Debug, Clone)]
pub struct JsonTargetBackend {
    store: Store,
}

impl JsonTargetBackend {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn read_collection(&self, name: &str) -> Result<Vec<TargetDocument>, KiraError> {
        Ok(to_target_documents(&self.load(name)?))
    }

    fn load(&self, name: &str) -> Result<BTreeMap<DocKey, Document>, KiraError> {
        let path = self.store.target_path(name);
        let file = fs::File::open(path.as_std_path()).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => KiraError::TargetNotFound(name.to_string()),
            _ => KiraError::Filesystem(format!("open {path}: {err}")),
        })?;
        let mut documents = BTreeMap::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let corrupt = |reason: String| KiraError::TargetWrite {
                target: name.to_string(),
                reason: format!("{path} line {}: {reason}", index + 1),
            };
            let value =
                serde_json::from_str::<Value>(&line).map_err(|err| corrupt(err.to_string()))?;
            let Value::Object(object) = value else {
                return Err(corrupt("expected a JSON object".to_string()));
            };
            let record = RawRecord::from_json(object).map_err(corrupt)?;
            documents.insert(record.key, record.payload);
        }
        Ok(documents)
    }
}

impl TargetBackend for JsonTargetBackend {
    fn exists(&self, name: &str) -> Result<bool, KiraError> {
        Ok(self.store.target_path(name).as_std_path().exists())
    }

    fn create(&self, name: &str) -> Result<Box<dyn TargetSink + '_>, KiraError> {
        if self.exists(name)? {
            return Err(KiraError::TargetExists(name.to_string()));
        }
        Ok(Box::new(JsonSink {
            name: name.to_string(),
            staged: BTreeMap::new(),
            store: &self.store,
        }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn TargetSink + '_>, KiraError> {
        Ok(Box::new(JsonSink {
            name: name.to_string(),
            staged: self.load(name)?,
            store: &self.store,
        }))
    }
}

struct JsonSink<'a> {
    name: String,
    staged: BTreeMap<DocKey, Document>,
    store: &'a Store,
}

impl TargetSink for JsonSink<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn contains(&self, key: &DocKey) -> bool {
        self.staged.contains_key(key)
    }

    fn ensure_document(&mut self, key: &DocKey) -> Result<(), KiraError> {
        self.staged.entry(key.clone()).or_default();
        Ok(())
    }

    fn upsert_group(&mut self, key: &DocKey, group: &str, value: Value) -> Result<(), KiraError> {
        stage(&mut self.staged, key, group, value);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<usize, KiraError> {
        let path = self.store.target_path(&self.name);
        let documents = to_target_documents(&self.staged);
        Store::write_atomic(&path, |out| {
            for document in &documents {
                serde_json::to_writer(&mut *out, document)?;
                out.write_all(b"\n")?;
            }
            Ok(())
        })
        .map_err(|err| KiraError::TargetWrite {
            target: self.name.clone(),
            reason: err.to_string(),
        })?;
        info!(target = %self.name, path = %path, documents = documents.len(), "target committed");
        Ok(documents.len())
    }
}

fn stage(staged: &mut BTreeMap<DocKey, Document>, key: &DocKey, group: &str, value: Value) {
    staged
        .entry(key.clone())
        .or_default()
        .insert(group.to_string(), value);
}

fn to_target_documents(documents: &BTreeMap<DocKey, Document>) -> Vec<TargetDocument> {
    documents
        .iter()
        .map(|(key, groups)| TargetDocument {
            id: key.clone(),
            groups: groups.clone(),
        })
        .collect()
}
