use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::builder::{BuildConfig, DocumentBuilder};
use crate::domain::Scheme;
use crate::error::KiraError;
use crate::graph::{EdgeLookup, InputHint, SourceIndexLookup, TranslationGraph};
use crate::mapper::{IdMapper, KeyConvert, TsvMappingFile};
use crate::merge::{MergePolicy, MergeStrategy};
use crate::panther::PantherSource;
use crate::source::{JsonLinesSource, SourceAdapter, SourceFormat, SourceRegistry, SourceSchema};
use crate::store::Store;
use crate::target::TargetBackend;

pub const DEFAULT_CONFIG_FILE: &str = "kira-genedoc.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store: Option<StoreEntry>,
    #[serde(default)]
    pub mappers: Vec<MapperEntry>,
    #[serde(default)]
    pub lookups: Vec<LookupEntry>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub builds: Vec<BuildEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreEntry {
    #[serde(default)]
    pub project_root: Option<Utf8PathBuf>,
}

/// A mapping table. With `from`/`to` it becomes a translation edge; without
/// them it only serves as the `through` table of other mappers.
#[derive(Debug, Deserialize, Serialize)]
pub struct MapperEntry {
    pub name: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub convert: Option<KeyConvert>,
    #[serde(default)]
    pub through: Option<String>,
}

/// An edge answered by indexing a source collection.
#[derive(Debug, Deserialize, Serialize)]
pub struct LookupEntry {
    pub from: String,
    pub to: String,
    pub collection: String,
    pub lookup: String,
    pub field: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    /// `"name:path"`, a JSON-lines source keyed in the scheme `name`.
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub name: String,
    #[serde(default)]
    pub main_source: Option<String>,
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default)]
    pub key_scheme: Option<String>,
    #[serde(default)]
    pub key_lookup: Vec<KeyLookupEntry>,
    #[serde(default)]
    pub skip_on_failure: bool,
    #[serde(default)]
    pub convert: KeyConvert,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct KeyLookupEntry {
    pub scheme: String,
    pub field: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BuildEntry {
    pub name: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub root_sources: Vec<String>,
    pub canonical_scheme: String,
    #[serde(default)]
    pub output_schemes: Vec<String>,
    #[serde(default)]
    pub merge_strategies: BTreeMap<String, MergeStrategy>,
    #[serde(default)]
    pub species: Vec<i64>,
    #[serde(default)]
    pub species_to_exclude: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct MapperRequest {
    pub name: String,
    pub edge: Option<(Scheme, Scheme)>,
    pub path: Utf8PathBuf,
    pub convert: KeyConvert,
    pub through: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub from: Scheme,
    pub to: Scheme,
    pub collection: String,
    pub lookup: String,
    pub field: String,
}

impl LookupRequest {
    pub fn table(&self) -> String {
        format!("{}.{}", self.collection, self.lookup)
    }
}

#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub name: String,
    pub path: Utf8PathBuf,
    pub format: SourceFormat,
    pub schema: SourceSchema,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub project_root: Option<Utf8PathBuf>,
    pub mappers: Vec<MapperRequest>,
    pub lookups: Vec<LookupRequest>,
    pub sources: Vec<SourceRequest>,
    pub builds: Vec<BuildConfig>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let mut mapper_names = BTreeSet::new();
        let mut mappers = Vec::with_capacity(config.mappers.len());
        for entry in config.mappers {
            if let Some(through) = &entry.through {
                // only earlier tables, which also rules out cycles
                if !mapper_names.contains(through) {
                    return Err(KiraError::InvalidBuildConfig(format!(
                        "mapper {} goes through {through}, which is not declared before it",
                        entry.name
                    )));
                }
            }
            if !mapper_names.insert(entry.name.clone()) {
                return Err(KiraError::InvalidBuildConfig(format!(
                    "duplicate mapper {}",
                    entry.name
                )));
            }
            let edge = match (entry.from, entry.to) {
                (Some(from), Some(to)) => Some((from.parse()?, to.parse()?)),
                (None, None) => None,
                _ => {
                    return Err(KiraError::InvalidBuildConfig(format!(
                        "mapper {} needs both from and to, or neither",
                        entry.name
                    )));
                }
            };
            mappers.push(MapperRequest {
                name: entry.name,
                edge,
                path: entry.path,
                convert: entry.convert.unwrap_or_default(),
                through: entry.through,
            });
        }

        let sources = config
            .sources
            .into_iter()
            .map(resolve_source)
            .collect::<Result<Vec<_>, KiraError>>()?;
        let mut source_names = BTreeSet::new();
        for source in &sources {
            if !source_names.insert(source.name.as_str()) {
                return Err(KiraError::InvalidBuildConfig(format!(
                    "duplicate source {}",
                    source.name
                )));
            }
        }

        let lookups = config
            .lookups
            .into_iter()
            .map(|entry| {
                if !source_names.contains(entry.collection.as_str()) {
                    return Err(KiraError::UnknownSource(entry.collection));
                }
                Ok(LookupRequest {
                    from: entry.from.parse()?,
                    to: entry.to.parse()?,
                    collection: entry.collection,
                    lookup: entry.lookup,
                    field: entry.field,
                })
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        let builds = config
            .builds
            .into_iter()
            .map(resolve_build)
            .collect::<Result<Vec<_>, KiraError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            project_root: config.store.and_then(|store| store.project_root),
            mappers,
            lookups,
            sources,
            builds,
        })
    }
}

fn resolve_source(entry: SourceEntry) -> Result<SourceRequest, KiraError> {
    match entry {
        SourceEntry::Shorthand(value) => {
            let (name, path) = value.split_once(':').ok_or_else(|| {
                KiraError::InvalidBuildConfig(format!("source shorthand {value} is not name:path"))
            })?;
            let key_scheme: Scheme = name.parse()?;
            Ok(SourceRequest {
                name: name.to_string(),
                path: Utf8PathBuf::from(path),
                format: SourceFormat::Jsonl,
                schema: SourceSchema::new(key_scheme),
            })
        }
        SourceEntry::Detailed(obj) => {
            let key_scheme: Scheme = obj.key_scheme.as_deref().unwrap_or(&obj.name).parse()?;
            let key_lookup = obj
                .key_lookup
                .into_iter()
                .map(|hint| -> Result<InputHint, KiraError> {
                    Ok(InputHint::new(hint.scheme.parse::<Scheme>()?, hint.field))
                })
                .collect::<Result<Vec<_>, KiraError>>()?;
            let mut schema = SourceSchema::new(key_scheme)
                .with_key_lookup(key_lookup)
                .skip_on_failure(obj.skip_on_failure)
                .with_convert(obj.convert);
            if let Some(main_source) = obj.main_source {
                schema = schema.with_main_source(main_source);
            }
            Ok(SourceRequest {
                name: obj.name,
                path: obj.path,
                format: obj.format.unwrap_or_default(),
                schema,
            })
        }
    }
}

fn resolve_build(entry: BuildEntry) -> Result<BuildConfig, KiraError> {
    let canonical: Scheme = entry.canonical_scheme.parse()?;
    let output_schemes = entry
        .output_schemes
        .iter()
        .map(|scheme| scheme.parse::<Scheme>())
        .collect::<Result<Vec<_>, KiraError>>()?;
    Ok(BuildConfig::new(entry.name, canonical)
        .with_sources(entry.sources)
        .with_root_sources(entry.root_sources)
        .with_output_schemes(output_schemes)
        .with_merge_policy(MergePolicy::new(entry.merge_strategies))
        .with_species(entry.species)
        .excluding_species(entry.species_to_exclude))
}

impl ResolvedConfig {
    /// Store rooted at the configured project root, if any.
    pub fn store(&self, store: Store) -> Store {
        match &self.project_root {
            Some(root) => store.with_project_root(root.clone()),
            None => store,
        }
    }

    pub fn source_registry(&self) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for source in &self.sources {
            let adapter: Arc<dyn SourceAdapter> = match source.format {
                SourceFormat::Jsonl => Arc::new(JsonLinesSource::new(
                    &source.name,
                    source.schema.clone(),
                    source.path.clone(),
                )),
                SourceFormat::Panther => Arc::new(PantherSource::new(
                    &source.name,
                    source.schema.clone(),
                    source.path.clone(),
                )),
            };
            registry.register(adapter);
        }
        registry
    }

    /// Wires sources, mapping tables and lookup edges into a builder. Nothing
    /// is read here; tables load when a build starts.
    pub fn into_builder(
        &self,
        store: &Store,
        backend: Arc<dyn TargetBackend>,
    ) -> Result<DocumentBuilder, KiraError> {
        let registry = self.source_registry();

        let mut index = SourceIndexLookup::new();
        for lookup in &self.lookups {
            index.add_table(
                lookup.table(),
                registry.get(&lookup.collection)?,
                &lookup.lookup,
                &lookup.field,
            );
        }
        let mut graph = TranslationGraph::with_backend(Arc::new(index));

        let mut tables = BTreeMap::<&str, Arc<IdMapper>>::new();
        for request in &self.mappers {
            let path = store.resolve_mapping_path(&request.path);
            let mut mapper = IdMapper::new(&request.name, TsvMappingFile::new(path))
                .with_convert(request.convert);
            if let Some(through) = &request.through {
                let table = tables.get(through.as_str()).ok_or_else(|| {
                    KiraError::InvalidBuildConfig(format!("unknown mapper {through}"))
                })?;
                mapper = mapper.through(table.clone());
            }
            let mapper = Arc::new(mapper);
            if let Some((from, to)) = &request.edge {
                graph.add_edge(from.clone(), to.clone(), EdgeLookup::Mapper(mapper.clone()));
            }
            tables.insert(&request.name, mapper);
        }
        for lookup in &self.lookups {
            graph.add_table_edge(lookup.from.clone(), lookup.to.clone(), lookup.table());
        }
        for build in &self.builds {
            graph.add_node(build.canonical_scheme.clone());
        }

        let mut builder = DocumentBuilder::new(registry, graph, backend);
        for build in &self.builds {
            builder.add_build(build.clone());
        }
        Ok(builder)
    }
}
