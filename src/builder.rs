//! Document Builder: reads every source of a build, re-keys records into the
//! canonical scheme, accumulates partial documents per key across all sources
//! and writes the merged documents to a target collection.
//!
//! Sources are read independently (optionally on their own threads) into
//! per-source partial maps. The partials are then folded by a single writer in
//! the declared source order, which keeps last-writer-wins conflicts identical
//! between sequential and parallel runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::{DocKey, Document, Scheme};
use crate::error::{KiraError, RecordError};
use crate::graph::{KeyLookup, TranslationGraph};
use crate::mapper::IdMapper;
use crate::merge::{MergePolicy, merge_document};
use crate::output::{ProgressEvent, ProgressSink};
use crate::root::{RootRole, RootSelector};
use crate::source::{SourceAdapter, SourceRegistry};
use crate::target::TargetBackend;

/// Number of record errors kept in a [`BuildResult`].
pub const MAX_ERRORS: usize = 20;

/// Attribute carrying the NCBI taxonomy id of a root document. Used for
/// species filtering and never written to the target.
pub const TAXID_FIELD: &str = "taxid";

#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    pub name: String,
    /// Participating sources, in merge order.
    pub sources: Vec<String>,
    /// Sources whose records assert that an entity exists.
    pub root_sources: Vec<String>,
    pub canonical_scheme: Scheme,
    /// Acceptable key schemes of the merged documents; empty means canonical only.
    pub output_schemes: Vec<Scheme>,
    pub merge_policy: MergePolicy,
    pub species: Vec<i64>,
    pub species_to_exclude: Vec<i64>,
}

impl BuildConfig {
    pub fn new(name: impl Into<String>, canonical_scheme: impl Into<Scheme>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            root_sources: Vec::new(),
            canonical_scheme: canonical_scheme.into(),
            output_schemes: Vec::new(),
            merge_policy: MergePolicy::default(),
            species: Vec::new(),
            species_to_exclude: Vec::new(),
        }
    }

    pub fn with_sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_root_sources<S: Into<String>>(
        mut self,
        sources: impl IntoIterator<Item = S>,
    ) -> Self {
        self.root_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_schemes<S: Into<Scheme>>(
        mut self,
        schemes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.output_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_species(mut self, species: Vec<i64>) -> Self {
        self.species = species;
        self
    }

    pub fn excluding_species(mut self, species: Vec<i64>) -> Self {
        self.species_to_exclude = species;
        self
    }

    pub fn output_schemes(&self) -> Vec<Scheme> {
        if self.output_schemes.is_empty() {
            vec![self.canonical_scheme.clone()]
        } else {
            self.output_schemes.clone()
        }
    }

    pub fn is_root(&self, source: &str) -> bool {
        self.root_sources.iter().any(|name| name == source)
    }

    /// Species filter applied to root documents. Without a taxid a document
    /// only passes when no inclusion list is set.
    pub fn accepts_species(&self, taxid: Option<&Value>) -> bool {
        let taxid = taxid
            .and_then(DocKey::from_value)
            .and_then(|key| key.to_integer().as_int());
        if !self.species.is_empty() && !taxid.is_some_and(|id| self.species.contains(&id)) {
            return false;
        }
        !taxid.is_some_and(|id| self.species_to_exclude.contains(&id))
    }
}

/// Shared cancellation switch. Checked before a source starts; a source that
/// is already being read runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Read sources on separate threads.
    pub parallel: bool,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildState {
    Init,
    Reading,
    Translating,
    Accumulating,
    Merging,
    Writing,
    Done,
    Cancelled,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildState::Init => "Init",
            BuildState::Reading => "Reading",
            BuildState::Translating => "Translating",
            BuildState::Accumulating => "Accumulating",
            BuildState::Merging => "Merging",
            BuildState::Writing => "Writing",
            BuildState::Done => "Done",
            BuildState::Cancelled => "Cancelled",
            BuildState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub source: String,
    /// Records seen, including invalid ones.
    pub read: usize,
    pub invalid: usize,
    /// Root documents rejected by the species filter.
    pub filtered: usize,
    /// Root documents already represented in the canonical scheme.
    pub suppressed: usize,
    /// Untranslatable records dropped by skip-on-failure.
    pub dropped: usize,
    pub translated: usize,
    /// Not read because the build was cancelled first.
    pub skipped: bool,
}

impl SourceStats {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub build: String,
    pub target: String,
    pub state: BuildState,
    pub cancelled: bool,
    pub sources: Vec<SourceStats>,
    pub documents_written: usize,
    /// Documents never asserted by a root source, left out of the target.
    pub orphaned: usize,
    /// First record errors, in source order.
    pub errors: Vec<String>,
}

struct SourcePlan {
    adapter: Arc<dyn SourceAdapter>,
    is_root: bool,
    selector: Option<RootSelector>,
    lookup: Option<KeyLookup>,
}

struct Partial {
    stats: SourceStats,
    documents: BTreeMap<DocKey, Document>,
    root_keys: BTreeSet<DocKey>,
    errors: Vec<String>,
}

impl Partial {
    fn new(source: &str) -> Self {
        Self {
            stats: SourceStats::new(source),
            documents: BTreeMap::new(),
            root_keys: BTreeSet::new(),
            errors: Vec::new(),
        }
    }

    fn record_error(&mut self, error: RecordError) {
        self.stats.invalid += 1;
        debug!(source = %self.stats.source, error = %error, "invalid record skipped");
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(error.to_string());
        }
    }
}

enum TargetMode {
    Create,
    Update,
}

/// Merges the sources of configured builds into target collections.
pub struct DocumentBuilder {
    sources: SourceRegistry,
    graph: Arc<TranslationGraph>,
    backend: Arc<dyn TargetBackend>,
    builds: BTreeMap<String, BuildConfig>,
    // mapping tables are reloaded per run, so runs do not overlap
    run_guard: Mutex<()>,
}

impl DocumentBuilder {
    pub fn new(
        sources: SourceRegistry,
        graph: TranslationGraph,
        backend: Arc<dyn TargetBackend>,
    ) -> Self {
        Self {
            sources,
            graph: Arc::new(graph),
            backend,
            builds: BTreeMap::new(),
            run_guard: Mutex::new(()),
        }
    }

    pub fn add_build(&mut self, config: BuildConfig) {
        self.builds.insert(config.name.clone(), config);
    }

    pub fn build(&self, name: &str) -> Result<&BuildConfig, KiraError> {
        self.builds
            .get(name)
            .ok_or_else(|| KiraError::UnknownBuild(name.to_string()))
    }

    pub fn builds(&self) -> impl Iterator<Item = &BuildConfig> {
        self.builds.values()
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn graph(&self) -> &TranslationGraph {
        &self.graph
    }

    /// Adds a translation edge backed by `mapper`. Only possible while no
    /// build is running.
    pub fn register_mapper(
        &mut self,
        from: impl Into<Scheme>,
        to: impl Into<Scheme>,
        mapper: IdMapper,
    ) -> Result<Arc<IdMapper>, KiraError> {
        let graph = Arc::get_mut(&mut self.graph).ok_or_else(|| {
            KiraError::InvalidBuildConfig(
                "translation graph is in use by a running build".to_string(),
            )
        })?;
        let mapper = Arc::new(mapper);
        graph.register_mapper(from, to, mapper.clone());
        Ok(mapper)
    }

    /// Validates a build without touching any source or mapping table.
    pub fn check(&self, build_name: &str) -> Result<(), KiraError> {
        let config = self.build(build_name)?;
        self.plan(config, None).map(|_| ())
    }

    pub fn merge(
        &self,
        build_name: &str,
        sources: Option<&[String]>,
        target_name: Option<&str>,
        options: &BuildOptions,
        sink: &dyn ProgressSink,
    ) -> Result<BuildResult, KiraError> {
        let config = self.build(build_name)?;
        self.merge_config(config, sources, target_name, options, sink)
    }

    /// Runs one build. Configuration problems are reported before any I/O;
    /// per-record problems are counted and never abort the run.
    pub fn merge_config(
        &self,
        config: &BuildConfig,
        sources: Option<&[String]>,
        target_name: Option<&str>,
        options: &BuildOptions,
        sink: &dyn ProgressSink,
    ) -> Result<BuildResult, KiraError> {
        let started = Instant::now();
        sink.event(ProgressEvent::phase(
            BuildState::Init,
            format!("build {}", config.name),
        ));
        let result = self.run(config, sources, target_name, options, sink);
        match &result {
            Ok(result) => {
                info!(
                    build = %result.build,
                    target = %result.target,
                    state = %result.state,
                    written = result.documents_written,
                    "build finished"
                );
                sink.event(
                    ProgressEvent::phase(
                        result.state,
                        format!("{} documents in {}", result.documents_written, result.target),
                    )
                    .with_elapsed(started.elapsed()),
                );
            }
            Err(err) => {
                warn!(build = %config.name, error = %err, "build failed");
                sink.event(
                    ProgressEvent::phase(BuildState::Failed, err).with_elapsed(started.elapsed()),
                );
            }
        }
        result
    }

    fn run(
        &self,
        config: &BuildConfig,
        subset: Option<&[String]>,
        target_name: Option<&str>,
        options: &BuildOptions,
        sink: &dyn ProgressSink,
    ) -> Result<BuildResult, KiraError> {
        let plans = self.plan(config, subset)?;
        let _running = self.run_guard.lock().unwrap_or_else(PoisonError::into_inner);
        let (target, mode) = self.resolve_target(config, subset, target_name)?;
        info!(build = %config.name, target = %target, sources = plans.len(), "build started");

        self.graph.reload_mappers()?;

        let partials = read_all(&plans, config, options, sink)?;

        let mut stats = Vec::with_capacity(plans.len());
        let mut errors = Vec::new();
        let mut documents = BTreeMap::<DocKey, Document>::new();
        let mut root_keys = BTreeSet::new();
        let mut cancelled = false;
        sink.event(ProgressEvent::phase(
            BuildState::Merging,
            format!("folding {} sources", plans.len()),
        ));
        for (plan, partial) in plans.iter().zip(partials) {
            let Some(partial) = partial else {
                cancelled = true;
                stats.push(SourceStats {
                    skipped: true,
                    ..SourceStats::new(plan.adapter.name())
                });
                continue;
            };
            for (key, document) in partial.documents {
                merge_document(
                    documents.entry(key).or_default(),
                    document,
                    &config.merge_policy,
                );
            }
            root_keys.extend(partial.root_keys);
            let room = MAX_ERRORS.saturating_sub(errors.len());
            errors.extend(partial.errors.into_iter().take(room));
            stats.push(partial.stats);
        }

        if cancelled {
            warn!(build = %config.name, "build cancelled, target left untouched");
            return Ok(BuildResult {
                build: config.name.clone(),
                target,
                state: BuildState::Cancelled,
                cancelled,
                sources: stats,
                documents_written: 0,
                orphaned: 0,
                errors,
            });
        }

        let mut writer = match mode {
            TargetMode::Create => self.backend.create(&target)?,
            TargetMode::Update => self.backend.open(&target)?,
        };

        // a document needs a root, either from this run or already in the target
        let mut orphaned = 0;
        if !config.root_sources.is_empty() {
            let before = documents.len();
            documents.retain(|key, _| root_keys.contains(key) || writer.contains(key));
            orphaned = before - documents.len();
            if orphaned > 0 {
                info!(build = %config.name, orphaned, "documents without a root left out");
            }
        }

        sink.event(ProgressEvent::phase(
            BuildState::Writing,
            format!("{} documents to {target}", documents.len()),
        ));
        let documents_written = documents.len();
        for (key, document) in documents {
            writer.ensure_document(&key)?;
            for (group, value) in document {
                writer.upsert_group(&key, &group, value)?;
            }
        }
        let total = writer.commit()?;
        debug!(target = %target, total, "target collection size");

        Ok(BuildResult {
            build: config.name.clone(),
            target,
            state: BuildState::Done,
            cancelled,
            sources: stats,
            documents_written,
            orphaned,
            errors,
        })
    }

    fn plan(
        &self,
        config: &BuildConfig,
        subset: Option<&[String]>,
    ) -> Result<Vec<SourcePlan>, KiraError> {
        if config.sources.is_empty() {
            return Err(KiraError::InvalidBuildConfig(format!(
                "build {} has no sources",
                config.name
            )));
        }
        for root in &config.root_sources {
            if !config.sources.contains(root) {
                return Err(KiraError::InvalidBuildConfig(format!(
                    "root source {root} is not a source of build {}",
                    config.name
                )));
            }
        }
        if let Some(subset) = subset {
            if subset.is_empty() {
                return Err(KiraError::InvalidBuildConfig(
                    "empty source selection".to_string(),
                ));
            }
            if let Some(extra) = subset.iter().find(|name| !config.sources.contains(name)) {
                return Err(KiraError::InvalidBuildConfig(format!(
                    "source {extra} is not part of build {}",
                    config.name
                )));
            }
        }

        let outputs = config.output_schemes();
        // declared order is kept even when a subset lists sources differently
        let selected = config
            .sources
            .iter()
            .filter(|name| subset.is_none_or(|subset| subset.contains(name)));

        let mut plans = Vec::new();
        for name in selected {
            let adapter = self.sources.get(name)?;
            let schema = adapter.schema();
            let is_root = config.is_root(name);
            let native_is_output = outputs.contains(&schema.key_scheme);

            let selector = if is_root && schema.key_scheme != config.canonical_scheme {
                let selector = RootSelector::new(
                    self.graph.clone(),
                    schema.input_hints(),
                    config.canonical_scheme.clone(),
                );
                selector.validate(name)?;
                Some(selector)
            } else {
                None
            };

            // with several outputs a native output key may still reach an earlier one
            let needs_lookup =
                !native_is_output || !schema.key_lookup.is_empty() || outputs.len() > 1;
            let lookup = if selector.is_none() && needs_lookup {
                let lookup =
                    KeyLookup::new(self.graph.clone(), schema.input_hints(), outputs.clone())
                        .skip_on_failure(schema.skip_on_failure);
                lookup.validate(name)?;
                Some(lookup)
            } else {
                None
            };

            plans.push(SourcePlan {
                adapter,
                is_root,
                selector,
                lookup,
            });
        }
        Ok(plans)
    }

    fn resolve_target(
        &self,
        config: &BuildConfig,
        subset: Option<&[String]>,
        target_name: Option<&str>,
    ) -> Result<(String, TargetMode), KiraError> {
        if subset.is_some() {
            let target = target_name.ok_or_else(|| {
                KiraError::InvalidBuildConfig(
                    "merging a subset of sources requires an existing target name".to_string(),
                )
            })?;
            if !self.backend.exists(target)? {
                return Err(KiraError::TargetNotFound(target.to_string()));
            }
            return Ok((target.to_string(), TargetMode::Update));
        }

        let target = target_name
            .map(str::to_string)
            .unwrap_or_else(|| target_name_for(&config.name));
        if self.backend.exists(&target)? {
            return Err(KiraError::TargetExists(target));
        }
        Ok((target, TargetMode::Create))
    }
}

impl fmt::Debug for DocumentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentBuilder")
            .field("sources", &self.sources)
            .field("graph", &self.graph)
            .field("builds", &self.builds.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `genedoc_<build>_<YYYYMMDD_HHMMSS>`, UTC.
pub fn target_name_for(build: &str) -> String {
    format!("genedoc_{build}_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

fn read_all(
    plans: &[SourcePlan],
    config: &BuildConfig,
    options: &BuildOptions,
    sink: &dyn ProgressSink,
) -> Result<Vec<Option<Partial>>, KiraError> {
    if !options.parallel {
        let mut partials = Vec::with_capacity(plans.len());
        for plan in plans {
            if options.cancel.is_cancelled() {
                partials.push(None);
                continue;
            }
            partials.push(Some(read_source(plan, config, sink)?));
        }
        return Ok(partials);
    }

    std::thread::scope(|scope| {
        let handles = plans
            .iter()
            .map(|plan| {
                let handle = scope.spawn(move || {
                    if options.cancel.is_cancelled() {
                        return Ok(None);
                    }
                    read_source(plan, config, sink).map(Some)
                });
                (plan.adapter.name(), handle)
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|(name, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err(KiraError::SourceRead {
                        source_name: name.to_string(),
                        reason: "reader thread panicked".to_string(),
                    })
                })
            })
            .collect()
    })
}

fn read_source(
    plan: &SourcePlan,
    config: &BuildConfig,
    sink: &dyn ProgressSink,
) -> Result<Partial, KiraError> {
    let name = plan.adapter.name();
    let started = Instant::now();
    sink.event(ProgressEvent::phase(
        BuildState::Reading,
        format!("source {name}"),
    ));
    if let Some(lookup) = &plan.lookup {
        let outputs = lookup
            .outputs()
            .iter()
            .map(Scheme::to_string)
            .collect::<Vec<_>>();
        let from = &plan.adapter.schema().key_scheme;
        sink.event(ProgressEvent::phase(
            BuildState::Translating,
            format!("source {name} from {from} to {}", outputs.join(",")),
        ));
    }

    let schema = plan.adapter.schema();
    let mut partial = Partial::new(name);
    for item in plan.adapter.stream()? {
        partial.stats.read += 1;
        let mut record = match item {
            Ok(record) => record,
            Err(err) => {
                partial.record_error(err);
                continue;
            }
        };

        record.key = schema.convert.apply(&record.key);
        let taxid = record.payload.remove(TAXID_FIELD);
        if plan.is_root && !config.accepts_species(taxid.as_ref()) {
            partial.stats.filtered += 1;
            continue;
        }
        let mut is_root = plan.is_root;
        if let Some(selector) = &plan.selector {
            record = match selector.classify(record)? {
                RootRole::Root(record) => record,
                RootRole::Represented(record) => {
                    partial.stats.suppressed += 1;
                    is_root = false;
                    record
                }
            };
        }
        if let Some(lookup) = &plan.lookup {
            match lookup.resolve(&record)? {
                Some(resolved) => {
                    record.key = resolved.key;
                    partial.stats.translated += 1;
                }
                None if lookup.skips_on_failure() => {
                    partial.stats.dropped += 1;
                    continue;
                }
                None => {}
            }
        }

        if is_root {
            partial.root_keys.insert(record.key.clone());
        }
        merge_document(
            partial.documents.entry(record.key).or_default(),
            record.payload,
            &config.merge_policy,
        );
    }

    let stats = &partial.stats;
    info!(
        source = %name,
        read = stats.read,
        invalid = stats.invalid,
        filtered = stats.filtered,
        suppressed = stats.suppressed,
        dropped = stats.dropped,
        translated = stats.translated,
        documents = partial.documents.len(),
        "source read"
    );
    sink.event(
        ProgressEvent::phase(
            BuildState::Accumulating,
            format!("source {name}: {} documents", partial.documents.len()),
        )
        .with_elapsed(started.elapsed()),
    );
    Ok(partial)
}
