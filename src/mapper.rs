use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::DocKey;
use crate::error::KiraError;

/// Normalization applied to keys before they are stored or looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyConvert {
    #[default]
    #[serde(alias = "string")]
    AsIs,
    #[serde(alias = "integer")]
    Int,
}

impl KeyConvert {
    pub fn apply(self, key: &DocKey) -> DocKey {
        match self {
            KeyConvert::AsIs => key.clone(),
            KeyConvert::Int => key.to_integer(),
        }
    }
}

/// Backing store of an identifier mapping table.
pub trait MappingLoader: Send + Sync {
    fn load_pairs(&self) -> Result<Vec<(DocKey, DocKey)>, String>;

    fn describe(&self) -> String;
}

/// Two tab-separated columns per line, optionally gzip-compressed.
#[derive(Debug, Clone)]
pub struct TsvMappingFile {
    path: Utf8PathBuf,
}

impl TsvMappingFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl MappingLoader for TsvMappingFile {
    fn load_pairs(&self) -> Result<Vec<(DocKey, DocKey)>, String> {
        let file = File::open(self.path.as_std_path())
            .map_err(|err| format!("open {}: {err}", self.path))?;
        let reader: Box<dyn Read> = if self.path.extension() == Some("gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut pairs = Vec::new();
        for (index, line) in BufReader::new(reader).lines().enumerate() {
            let line = line.map_err(|err| format!("read {}: {err}", self.path))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut columns = trimmed.split('\t');
            match (columns.next(), columns.next()) {
                (Some(from), Some(to)) if !from.is_empty() && !to.is_empty() => {
                    pairs.push((DocKey::from(from.trim()), DocKey::from(to.trim())));
                }
                _ => {
                    return Err(format!(
                        "{} line {}: expected two tab-separated columns",
                        self.path,
                        index + 1
                    ));
                }
            }
        }
        Ok(pairs)
    }

    fn describe(&self) -> String {
        self.path.to_string()
    }
}

/// In-memory pairs, handy for embedding small tables and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticMapping {
    pairs: Vec<(DocKey, DocKey)>,
}

impl StaticMapping {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<DocKey>,
        V: Into<DocKey>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(from, to)| (from.into(), to.into()))
                .collect(),
        }
    }
}

impl MappingLoader for StaticMapping {
    fn load_pairs(&self) -> Result<Vec<(DocKey, DocKey)>, String> {
        Ok(self.pairs.clone())
    }

    fn describe(&self) -> String {
        format!("static({} pairs)", self.pairs.len())
    }
}

/// Identifier translation table, loaded once per build run.
pub struct IdMapper {
    name: String,
    loader: Box<dyn MappingLoader>,
    convert: KeyConvert,
    through: Option<Arc<IdMapper>>,
    map: RwLock<Option<HashMap<DocKey, DocKey>>>,
}

impl IdMapper {
    pub fn new(name: impl Into<String>, loader: impl MappingLoader + 'static) -> Self {
        Self {
            name: name.into(),
            loader: Box::new(loader),
            convert: KeyConvert::AsIs,
            through: None,
            map: RwLock::new(None),
        }
    }

    pub fn with_convert(mut self, convert: KeyConvert) -> Self {
        self.convert = convert;
        self
    }

    /// Normalizes mapped values through another mapper. Values unknown to it
    /// are discarded, e.g. Ensembl pairs pointing at withdrawn Entrez ids.
    pub fn through(mut self, mapper: Arc<IdMapper>) -> Self {
        self.through = Some(mapper);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.table().is_some()
    }

    pub fn len(&self) -> usize {
        self.table().as_ref().map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populates the table from its loader. Later calls are no-ops until
    /// [`IdMapper::reset`].
    pub fn load(&self) -> Result<(), KiraError> {
        let mut slot = self.map.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        if let Some(through) = &self.through {
            through.load()?;
        }

        let pairs = self
            .loader
            .load_pairs()
            .map_err(|reason| self.load_error(reason))?;
        let total = pairs.len();
        let mut map = HashMap::with_capacity(total);
        for (from, to) in pairs {
            let from = self.convert.apply(&from);
            let to = match &self.through {
                Some(through) => match through.translate(&self.convert.apply(&to)) {
                    Some(current) => current,
                    None => continue,
                },
                None => self.convert.apply(&to),
            };
            map.insert(from, to);
        }
        info!(
            mapper = %self.name,
            source = %self.loader.describe(),
            pairs = total,
            kept = map.len(),
            "mapping table loaded"
        );
        *slot = Some(map);
        Ok(())
    }

    /// Forgets the loaded table, including the one of a `through` mapper.
    pub fn reset(&self) {
        *self.map.write().unwrap_or_else(PoisonError::into_inner) = None;
        if let Some(through) = &self.through {
            through.reset();
        }
    }

    /// Non-transparent lookup: a miss is a definite `None`.
    pub fn translate(&self, key: &DocKey) -> Option<DocKey> {
        let table = self.table();
        let Some(map) = table.as_ref() else {
            warn!(mapper = %self.name, "translate called before load");
            return None;
        };
        let found = map.get(&self.convert.apply(key)).cloned();
        if found.is_none() {
            debug!(mapper = %self.name, key = %key, "no mapping");
        }
        found
    }

    /// Transparent lookup: a miss returns the key unchanged.
    pub fn translate_transparent(&self, key: &DocKey) -> DocKey {
        self.translate(key).unwrap_or_else(|| key.clone())
    }

    pub fn contains(&self, key: &DocKey) -> bool {
        self.table()
            .as_ref()
            .map(|map| map.contains_key(&self.convert.apply(key)))
            .unwrap_or(false)
    }

    fn table(&self) -> RwLockReadGuard<'_, Option<HashMap<DocKey, DocKey>>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_error(&self, reason: String) -> KiraError {
        KiraError::MappingLoad {
            mapper: self.name.clone(),
            reason,
        }
    }
}

impl std::fmt::Debug for IdMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdMapper")
            .field("name", &self.name)
            .field("convert", &self.convert)
            .field("through", &self.through.as_ref().map(|mapper| mapper.name()))
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
