use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{DocKey, RawRecord, Scheme};
use crate::error::KiraError;
use crate::mapper::IdMapper;
use crate::source::SourceAdapter;

/// Read-only key/value tables consulted by graph edges. Must tolerate
/// concurrent readers.
pub trait LookupBackend: Send + Sync {
    fn get(&self, table: &str, key: &DocKey) -> Option<DocKey>;

    /// Called once before a build reads any source.
    fn prepare(&self) -> Result<(), KiraError> {
        Ok(())
    }

    /// Drops derived state so the next `prepare` rebuilds it.
    fn reset(&self) {}
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLookup {
    tables: HashMap<String, HashMap<DocKey, DocKey>>,
}

impl InMemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: &str, key: impl Into<DocKey>, value: impl Into<DocKey>) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map(HashMap::len).unwrap_or(0)
    }

    /// Indexes a source collection: the value at `lookup` (a dotted path, or
    /// `_id`) maps to the value at `field`. Array values index every element.
    /// The first record claiming a lookup value wins.
    pub fn index_source(
        &mut self,
        table: &str,
        source: &dyn SourceAdapter,
        lookup: &str,
        field: &str,
    ) -> Result<usize, KiraError> {
        let entries = self.tables.entry(table.to_string()).or_default();
        let before = entries.len();
        for record in source.stream()? {
            let Ok(record) = record else {
                continue;
            };
            let Some(target) = record.field(field).as_ref().and_then(DocKey::from_value) else {
                continue;
            };
            if let Some(value) = record.field(lookup) {
                for key in keys_of(&value) {
                    entries.entry(key).or_insert_with(|| target.clone());
                }
            }
        }
        let added = entries.len() - before;
        info!(table, source = source.name(), lookup, field, added, "lookup table indexed");
        Ok(added)
    }
}

impl LookupBackend for InMemoryLookup {
    fn get(&self, table: &str, key: &DocKey) -> Option<DocKey> {
        self.tables.get(table)?.get(key).cloned()
    }
}

struct IndexedTable {
    source: Arc<dyn SourceAdapter>,
    lookup: String,
    field: String,
}

/// Tables indexed from source collections when a build starts, so that
/// building a graph never reads a source.
#[derive(Default)]
pub struct SourceIndexLookup {
    tables: Vec<(String, IndexedTable)>,
    index: RwLock<Option<InMemoryLookup>>,
}

impl SourceIndexLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(
        &mut self,
        table: impl Into<String>,
        source: Arc<dyn SourceAdapter>,
        lookup: impl Into<String>,
        field: impl Into<String>,
    ) {
        self.tables.push((
            table.into(),
            IndexedTable {
                source,
                lookup: lookup.into(),
                field: field.into(),
            },
        ));
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl LookupBackend for SourceIndexLookup {
    fn get(&self, table: &str, key: &DocKey) -> Option<DocKey> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.as_ref()?.get(table, key)
    }

    fn prepare(&self) -> Result<(), KiraError> {
        let mut slot = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let mut index = InMemoryLookup::new();
        for (table, indexed) in &self.tables {
            index.index_source(table, indexed.source.as_ref(), &indexed.lookup, &indexed.field)?;
        }
        *slot = Some(index);
        Ok(())
    }

    fn reset(&self) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for SourceIndexLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceIndexLookup")
            .field(
                "tables",
                &self.tables.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field(
                "indexed",
                &self
                    .index
                    .read()
                    .map(|index| index.is_some())
                    .unwrap_or(false),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum EdgeLookup {
    Mapper(Arc<IdMapper>),
    Table { table: String },
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub from: Scheme,
    pub to: Scheme,
    pub lookup: EdgeLookup,
}

impl Edge {
    fn is_self_edge(&self) -> bool {
        self.from == self.to
    }
}

/// Identifier schemes connected by lookup-backed edges. Edges leaving a node
/// are tried in the order they were added.
pub struct TranslationGraph {
    nodes: BTreeSet<Scheme>,
    edges: Vec<Edge>,
    backend: Arc<dyn LookupBackend>,
}

impl Default for TranslationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationGraph {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(InMemoryLookup::new()))
    }

    pub fn with_backend(backend: Arc<dyn LookupBackend>) -> Self {
        Self {
            nodes: BTreeSet::new(),
            edges: Vec::new(),
            backend,
        }
    }

    pub fn set_backend(&mut self, backend: Arc<dyn LookupBackend>) {
        self.backend = backend;
    }

    pub fn add_node(&mut self, scheme: impl Into<Scheme>) {
        self.nodes.insert(scheme.into());
    }

    pub fn add_edge(&mut self, from: impl Into<Scheme>, to: impl Into<Scheme>, lookup: EdgeLookup) {
        let from = from.into();
        let to = to.into();
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.edges.push(Edge { from, to, lookup });
    }

    pub fn add_table_edge(
        &mut self,
        from: impl Into<Scheme>,
        to: impl Into<Scheme>,
        table: impl Into<String>,
    ) {
        self.add_edge(from, to, EdgeLookup::Table { table: table.into() });
    }

    /// Adds a mapper-backed translation edge `from -> to`.
    pub fn register_mapper(
        &mut self,
        from: impl Into<Scheme>,
        to: impl Into<Scheme>,
        mapper: Arc<IdMapper>,
    ) {
        self.add_edge(from, to, EdgeLookup::Mapper(mapper));
    }

    pub fn contains(&self, scheme: &Scheme) -> bool {
        self.nodes.contains(scheme)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Scheme> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing<'a>(&'a self, scheme: &'a Scheme) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| &edge.from == scheme)
    }

    pub fn mapper(&self, name: &str) -> Option<Arc<IdMapper>> {
        self.mappers().find(|mapper| mapper.name() == name)
    }

    pub fn mappers(&self) -> impl Iterator<Item = Arc<IdMapper>> + '_ {
        let mut seen = BTreeSet::new();
        self.edges.iter().filter_map(move |edge| match &edge.lookup {
            EdgeLookup::Mapper(mapper) if seen.insert(mapper.name().to_string()) => {
                Some(mapper.clone())
            }
            _ => None,
        })
    }

    /// Loads every mapping table referenced by an edge and prepares the
    /// lookup backend. Any failure aborts.
    pub fn load_mappers(&self) -> Result<(), KiraError> {
        for mapper in self.mappers() {
            mapper.load()?;
        }
        self.backend.prepare()
    }

    /// Discards loaded tables and loads them again from their backing stores.
    pub fn reload_mappers(&self) -> Result<(), KiraError> {
        for mapper in self.mappers() {
            mapper.reset();
        }
        self.backend.reset();
        self.load_mappers()
    }

    /// Upper bound on hops of any cycle-free walk.
    pub fn max_hops(&self) -> usize {
        self.nodes.len().max(1)
    }

    /// Static reachability, ignoring whether lookups would succeed.
    pub fn has_path(&self, from: &Scheme, outputs: &[Scheme]) -> bool {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(scheme) = queue.pop_front() {
            if outputs.contains(&scheme) {
                return true;
            }
            if !visited.insert(scheme.clone()) {
                continue;
            }
            for edge in self.outgoing(&scheme) {
                if !visited.contains(&edge.to) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        false
    }

    fn apply(&self, edge: &Edge, value: &DocKey) -> Option<DocKey> {
        match &edge.lookup {
            EdgeLookup::Mapper(mapper) => mapper.translate(value),
            EdgeLookup::Table { table } => self.backend.get(table, value),
        }
    }
}

impl std::fmt::Debug for TranslationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationGraph")
            .field("nodes", &self.nodes)
            .field("edges", &self.edges)
            .finish()
    }
}

/// Where to read an identifier in a record and which scheme it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputHint {
    pub scheme: Scheme,
    pub field: String,
}

impl InputHint {
    pub fn new(scheme: impl Into<Scheme>, field: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub scheme: Scheme,
    pub key: DocKey,
}

/// Walks the translation graph to re-key records into one of the output schemes.
#[derive(Debug, Clone)]
pub struct KeyLookup {
    graph: Arc<TranslationGraph>,
    inputs: Vec<InputHint>,
    outputs: Vec<Scheme>,
    skip_on_failure: bool,
}

impl KeyLookup {
    pub fn new(graph: Arc<TranslationGraph>, inputs: Vec<InputHint>, outputs: Vec<Scheme>) -> Self {
        Self {
            graph,
            inputs,
            outputs,
            skip_on_failure: false,
        }
    }

    pub fn skip_on_failure(mut self, skip: bool) -> Self {
        self.skip_on_failure = skip;
        self
    }

    pub fn skips_on_failure(&self) -> bool {
        self.skip_on_failure
    }

    pub fn inputs(&self) -> &[InputHint] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Scheme] {
        &self.outputs
    }

    /// At least one input scheme must statically reach an output scheme.
    pub fn validate(&self, source_name: &str) -> Result<(), KiraError> {
        for hint in &self.inputs {
            if !self.graph.contains(&hint.scheme) && !self.outputs.contains(&hint.scheme) {
                return Err(KiraError::UnknownScheme(hint.scheme.to_string()));
            }
        }
        let reachable = self
            .inputs
            .iter()
            .any(|hint| self.graph.has_path(&hint.scheme, &self.outputs));
        if reachable {
            return Ok(());
        }
        Err(KiraError::IncompleteTranslationPath {
            source_name: source_name.to_string(),
            scheme: self
                .inputs
                .iter()
                .map(|hint| hint.scheme.to_string())
                .collect::<Vec<_>>()
                .join(","),
            outputs: self
                .outputs
                .iter()
                .map(Scheme::to_string)
                .collect::<Vec<_>>()
                .join(","),
        })
    }

    /// Output schemes are tried in declared order, and for each of them the
    /// input hints in declared order; the first success wins. A later output
    /// is only used when no earlier one is reachable. `Ok(None)` is a
    /// translation miss.
    pub fn resolve(&self, record: &RawRecord) -> Result<Option<Resolved>, KiraError> {
        for output in &self.outputs {
            for hint in &self.inputs {
                let Some(value) = record.field(&hint.field) else {
                    continue;
                };
                for key in keys_of(&value) {
                    if let Some(resolved) = self.walk(&hint.scheme, key, output, 0)? {
                        return Ok(Some(resolved));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Re-keys resolvable records. Misses are dropped when skipping on failure,
    /// otherwise they pass through unchanged.
    pub fn transform<'a, I>(
        &'a self,
        records: I,
    ) -> impl Iterator<Item = Result<RawRecord, KiraError>> + 'a
    where
        I: IntoIterator<Item = RawRecord>,
        I::IntoIter: 'a,
    {
        records
            .into_iter()
            .filter_map(move |record| match self.resolve(&record) {
                Ok(Some(resolved)) => Some(Ok(RawRecord {
                    key: resolved.key,
                    payload: record.payload,
                })),
                Ok(None) if self.skip_on_failure => None,
                Ok(None) => Some(Ok(record)),
                Err(err) => Some(Err(err)),
            })
    }

    fn walk(
        &self,
        scheme: &Scheme,
        value: DocKey,
        target: &Scheme,
        hops: usize,
    ) -> Result<Option<Resolved>, KiraError> {
        if hops > self.graph.max_hops() {
            return Err(KiraError::GraphCycle {
                scheme: scheme.to_string(),
                hops,
            });
        }

        let is_output = scheme == target;
        let mut value = value;
        let self_edge = self.graph.outgoing(scheme).find(|edge| edge.is_self_edge());
        match (self_edge, is_output) {
            (Some(edge), true) => {
                // validates the id exists in the output scheme
                if let Some(key) = self.graph.apply(edge, &value) {
                    return Ok(Some(Resolved {
                        scheme: scheme.clone(),
                        key,
                    }));
                }
            }
            (None, true) => {
                return Ok(Some(Resolved {
                    scheme: scheme.clone(),
                    key: value,
                }));
            }
            (Some(edge), false) => {
                if let Some(normalized) = self.graph.apply(edge, &value) {
                    value = normalized;
                }
            }
            (None, false) => {}
        }

        for edge in self.graph.outgoing(scheme).filter(|edge| !edge.is_self_edge()) {
            let Some(next) = self.graph.apply(edge, &value) else {
                continue;
            };
            debug!(from = %edge.from, to = %edge.to, key = %value, next = %next, "edge applied");
            if let Some(resolved) = self.walk(&edge.to, next, target, hops + 1)? {
                return Ok(Some(resolved));
            }
        }
        Ok(None)
    }
}

fn keys_of(value: &Value) -> Vec<DocKey> {
    match value {
        Value::Array(items) => items.iter().filter_map(DocKey::from_value).collect(),
        other => DocKey::from_value(other).into_iter().collect(),
    }
}
