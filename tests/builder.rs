use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use kira_genedoc::builder::{BuildConfig, BuildOptions, BuildState, CancelFlag, DocumentBuilder};
use kira_genedoc::domain::{DocKey, TargetDocument};
use kira_genedoc::error::{KiraError, RecordError};
use kira_genedoc::graph::{InMemoryLookup, InputHint, TranslationGraph};
use kira_genedoc::mapper::{IdMapper, KeyConvert, StaticMapping, TsvMappingFile};
use kira_genedoc::merge::{MergePolicy, MergeStrategy};
use kira_genedoc::output::{ProgressEvent, ProgressSink};
use kira_genedoc::panther;
use kira_genedoc::source::{
    MemorySource, RecordStream, SourceAdapter, SourceRegistry, SourceSchema,
};
use kira_genedoc::target::{MemoryTargetBackend, TargetBackend};

const PANTHER_LINES: &[&str] = &[
    "HUMAN|HGNC=11477|UniProtKB=P31946\tMOUSE|MGI=MGI=1891525|UniProtKB=Q9CQV8\tLDO\tEuarchontoglires\tPTHR18860",
    "HUMAN|HGNC=11477|UniProtKB=P31946\tRAT|RGD=621173|UniProtKB=P35213\tO\tEuarchontoglires\tPTHR18860",
];

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Flips the cancel flag as soon as it is read.
struct CancellingSource {
    inner: MemorySource,
    cancel: CancelFlag,
}

impl SourceAdapter for CancellingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn schema(&self) -> &SourceSchema {
        self.inner.schema()
    }

    fn stream(&self) -> Result<RecordStream<'_>, KiraError> {
        self.cancel.cancel();
        self.inner.stream()
    }
}

fn entrez_gene() -> MemorySource {
    MemorySource::new("entrez_gene", SourceSchema::new("entrez")).with_json([
        json!({"_id": 1017, "taxid": 9606, "symbol": "CDK2"}),
        json!({"_id": 1018, "taxid": 9606, "symbol": "CDK3"}),
        json!({"_id": 7529, "taxid": 9606, "symbol": "YWHAB"}),
        json!({"_id": 30970, "taxid": 7227, "symbol": "Cdk2"}),
    ])
}

fn ensembl_gene() -> MemorySource {
    MemorySource::new("ensembl_gene", SourceSchema::new("ensembl")).with_json([
        json!({"_id": "ENSG01", "taxid": 9606, "ensembl": {"gene": "ENSG01"}}),
        json!({"_id": "ENSG09", "taxid": 9606, "ensembl": {"gene": "ENSG09"}}),
    ])
}

fn reporter(affy_id: &str) -> MemorySource {
    MemorySource::new("reporter", SourceSchema::new("entrez")).with_json([
        json!({"_id": 1017, "reporter": {"HG-U133_Plus_2": affy_id}}),
        json!({"_id": 4242, "reporter": {"HG-U133_Plus_2": "1552256_a_at"}}),
    ])
}

fn ensembl_interpro() -> MemorySource {
    MemorySource::new(
        "ensembl_interpro",
        SourceSchema::new("ensembl")
            .with_main_source("ensembl")
            .skip_on_failure(true),
    )
    .with_json([
        json!({"_id": "ENSG01", "interpro": {"id": "IPR000719"}, "__aslistofdict__": "interpro"}),
        json!({"_id": "ENSG01", "interpro": {"id": "IPR008271"}, "__aslistofdict__": "interpro"}),
        json!({"_id": "ENSG77", "interpro": {"id": "IPR011009"}, "__aslistofdict__": "interpro"}),
    ])
}

fn pantherdb() -> MemorySource {
    let lines = PANTHER_LINES
        .iter()
        .enumerate()
        .map(|(index, line)| (index + 1, Ok(line.to_string())));
    let records = panther::parse_lines("pantherdb", lines)
        .collect::<Result<Vec<_>, RecordError>>()
        .unwrap();
    MemorySource::new("pantherdb", SourceSchema::new("swissprot")).with_records(records)
}

fn graph() -> TranslationGraph {
    let mut lookup = InMemoryLookup::new();
    lookup.insert("uniprot.Swiss-Prot", "P31946", 7529_i64);
    let mut graph = TranslationGraph::with_backend(Arc::new(lookup));
    graph.add_node("entrez");
    graph.register_mapper(
        "ensembl",
        "entrez",
        Arc::new(IdMapper::new(
            "ensembl2entrez",
            StaticMapping::new([("ENSG01", 1017_i64), ("ENSG02", 1018_i64)]),
        )),
    );
    graph.add_table_edge("swissprot", "entrez", "uniprot.Swiss-Prot");
    graph
}

fn registry(sources: Vec<Arc<dyn SourceAdapter>>) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source);
    }
    registry
}

fn default_sources() -> Vec<Arc<dyn SourceAdapter>> {
    vec![
        Arc::new(entrez_gene()),
        Arc::new(ensembl_gene()),
        Arc::new(reporter("204252_at")),
        Arc::new(ensembl_interpro()),
        Arc::new(pantherdb()),
    ]
}

fn mygene() -> BuildConfig {
    BuildConfig::new("mygene", "entrez")
        .with_sources([
            "entrez_gene",
            "ensembl_gene",
            "reporter",
            "ensembl_interpro",
            "pantherdb",
        ])
        .with_root_sources(["entrez_gene", "ensembl_gene"])
        .with_species(vec![9606])
}

fn builder(backend: &MemoryTargetBackend) -> DocumentBuilder {
    let mut builder = DocumentBuilder::new(
        registry(default_sources()),
        graph(),
        Arc::new(backend.clone()),
    );
    builder.add_build(mygene());
    builder
}

fn by_key(documents: &[TargetDocument]) -> BTreeMap<DocKey, Value> {
    documents
        .iter()
        .map(|document| (document.id.clone(), Value::Object(document.groups.clone())))
        .collect()
}

#[test]
fn merges_all_sources_by_canonical_key() {
    let backend = MemoryTargetBackend::new();
    let sink = RecordingSink::default();
    let result = builder(&backend)
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &sink)
        .unwrap();

    assert_eq!(result.state, BuildState::Done);
    assert_eq!(result.documents_written, 4);
    assert_eq!(result.orphaned, 1);
    assert!(result.errors.is_empty());

    let stats = &result.sources;
    assert_eq!(stats[0].filtered, 1);
    assert_eq!(stats[1].suppressed, 1);
    assert_eq!(stats[3].translated, 2);
    assert_eq!(stats[3].dropped, 1);
    assert_eq!(stats[4].translated, 1);

    let documents = by_key(&backend.collection("genedoc_test").unwrap());
    assert_eq!(
        documents[&DocKey::Int(1017)],
        json!({
            "symbol": "CDK2",
            "ensembl": {"gene": "ENSG01"},
            "reporter": {"HG-U133_Plus_2": "204252_at"},
            "interpro": [{"id": "IPR000719"}, {"id": "IPR008271"}]
        })
    );
    assert_eq!(documents[&DocKey::Int(1018)], json!({"symbol": "CDK3"}));
    assert_eq!(
        documents[&DocKey::Int(7529)]["pantherdb"]["ortholog"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
    // ENSG01 is represented by 1017 and lends it its groups; ENSG09 has no
    // Entrez counterpart
    assert!(!documents.contains_key(&DocKey::from("ENSG01")));
    assert_eq!(
        documents[&DocKey::from("ENSG09")],
        json!({"ensembl": {"gene": "ENSG09"}})
    );
    assert!(!documents.contains_key(&DocKey::Int(4242)));
    assert!(documents.values().all(|document| document.get("taxid").is_none()));

    let messages = sink.messages();
    assert!(messages[0].starts_with("phase=Init"));
    assert!(messages.iter().any(|message| message.starts_with("phase=Translating")));
    assert!(messages.last().unwrap().starts_with("phase=Done"));
}

#[test]
fn merge_is_idempotent() {
    let backend = MemoryTargetBackend::new();
    let builder = builder(&backend);
    for target in ["genedoc_a", "genedoc_b"] {
        builder
            .merge("mygene", None, Some(target), &BuildOptions::default(), &NullSink)
            .unwrap();
    }
    assert_eq!(
        backend.collection("genedoc_a").unwrap(),
        backend.collection("genedoc_b").unwrap()
    );
}

#[test]
fn parallel_reading_matches_sequential() {
    let backend = MemoryTargetBackend::new();
    let builder = builder(&backend);
    builder
        .merge("mygene", None, Some("genedoc_seq"), &BuildOptions::default(), &NullSink)
        .unwrap();
    let options = BuildOptions {
        parallel: true,
        ..BuildOptions::default()
    };
    builder
        .merge("mygene", None, Some("genedoc_par"), &options, &NullSink)
        .unwrap();
    assert_eq!(
        backend.collection("genedoc_seq").unwrap(),
        backend.collection("genedoc_par").unwrap()
    );
}

#[test]
fn conflicting_scalars_follow_declared_source_order() {
    let first = MemorySource::new("refseq", SourceSchema::new("entrez"))
        .with_json([json!({"_id": 1017, "summary": {"text": "from refseq"}})]);
    let second = MemorySource::new("generif", SourceSchema::new("entrez"))
        .with_json([json!({"_id": 1017, "summary": {"text": "from generif"}})]);
    let backend = MemoryTargetBackend::new();
    let mut builder = DocumentBuilder::new(
        registry(vec![Arc::new(first), Arc::new(second)]),
        graph(),
        Arc::new(backend.clone()),
    );
    builder.add_build(BuildConfig::new("lww", "entrez").with_sources(["refseq", "generif"]));
    builder.add_build(BuildConfig::new("rev", "entrez").with_sources(["generif", "refseq"]));
    builder.add_build(
        BuildConfig::new("both", "entrez")
            .with_sources(["refseq", "generif"])
            .with_merge_policy(MergePolicy::new(BTreeMap::from([(
                "summary".to_string(),
                MergeStrategy::MergeStruct,
            )]))),
    );

    for (build, expected) in [
        ("lww", json!({"text": "from generif"})),
        ("rev", json!({"text": "from refseq"})),
        ("both", json!({"text": ["from refseq", "from generif"]})),
    ] {
        let options = BuildOptions {
            parallel: true,
            ..BuildOptions::default()
        };
        let target = format!("genedoc_{build}");
        builder
            .merge(build, None, Some(&target), &options, &NullSink)
            .unwrap();
        let documents = backend.collection(&target).unwrap();
        assert_eq!(documents[0].group("summary"), Some(&expected), "build {build}");
    }
}

#[test]
fn bad_records_are_counted_and_skipped() {
    let mut broken = reporter("204252_at");
    broken.push_error(RecordError::new("reporter", Some(3), "expected object"));
    let backend = MemoryTargetBackend::new();
    let mut builder = DocumentBuilder::new(
        registry(vec![Arc::new(entrez_gene()), Arc::new(broken)]),
        graph(),
        Arc::new(backend.clone()),
    );
    builder.add_build(
        BuildConfig::new("mygene", "entrez")
            .with_sources(["entrez_gene", "reporter"])
            .with_root_sources(["entrez_gene"]),
    );

    let result = builder
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &NullSink)
        .unwrap();
    assert_eq!(result.sources[1].read, 3);
    assert_eq!(result.sources[1].invalid, 1);
    assert_eq!(result.errors, vec!["reporter line 3: expected object".to_string()]);
    assert_eq!(result.documents_written, 4);
}

#[test]
fn missing_mapping_table_aborts_before_writing() {
    let mut graph = TranslationGraph::new();
    graph.add_node("entrez");
    graph.register_mapper(
        "ensembl",
        "entrez",
        Arc::new(IdMapper::new(
            "ensembl2entrez",
            TsvMappingFile::new("/nonexistent/ensembl2entrez.tsv"),
        )),
    );
    let backend = MemoryTargetBackend::new();
    let mut builder = DocumentBuilder::new(
        registry(vec![Arc::new(ensembl_interpro())]),
        graph,
        Arc::new(backend.clone()),
    );
    builder.add_build(BuildConfig::new("mygene", "entrez").with_sources(["ensembl_interpro"]));

    let sink = RecordingSink::default();
    let err = builder
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &sink)
        .unwrap_err();
    assert_matches!(err, KiraError::MappingLoad { mapper, .. } if mapper == "ensembl2entrez");
    assert!(!backend.exists("genedoc_test").unwrap());
    assert!(sink.messages().last().unwrap().starts_with("phase=Failed"));
}

#[test]
fn configuration_errors_surface_before_any_io() {
    let backend = MemoryTargetBackend::new();
    let mut builder = builder(&backend);
    builder.add_build(BuildConfig::new("missing", "entrez").with_sources(["entrez_gene", "go"]));
    builder.add_build(
        BuildConfig::new("rootless", "entrez")
            .with_sources(["reporter"])
            .with_root_sources(["entrez_gene"]),
    );

    assert_matches!(
        builder.merge("unknown", None, None, &BuildOptions::default(), &NullSink),
        Err(KiraError::UnknownBuild(_))
    );
    assert_matches!(builder.check("missing"), Err(KiraError::UnknownSource(name)) if name == "go");
    assert_matches!(builder.check("rootless"), Err(KiraError::InvalidBuildConfig(_)));
    assert!(builder.check("mygene").is_ok());
    assert!(backend.names().is_empty());
}

#[test]
fn untranslatable_scheme_is_a_configuration_error() {
    let hgnc = MemorySource::new(
        "hgnc_xrefs",
        SourceSchema::new("hgnc").with_key_lookup(vec![InputHint::new("hgnc", "_id")]),
    );
    let mut builder = DocumentBuilder::new(
        registry(vec![Arc::new(hgnc)]),
        graph(),
        Arc::new(MemoryTargetBackend::new()),
    );
    builder.add_build(BuildConfig::new("mygene", "entrez").with_sources(["hgnc_xrefs"]));
    assert_matches!(
        builder.check("mygene"),
        Err(KiraError::UnknownScheme(scheme)) if scheme == "hgnc"
    );
}

#[test]
fn incremental_merge_replaces_only_selected_groups() {
    let backend = MemoryTargetBackend::new();
    builder(&backend)
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &NullSink)
        .unwrap();

    let mut sources = default_sources();
    sources[2] = Arc::new(reporter("211804_s_at"));
    let mut rebuilt = DocumentBuilder::new(registry(sources), graph(), Arc::new(backend.clone()));
    rebuilt.add_build(mygene());

    let subset = ["reporter".to_string()];
    assert_matches!(
        rebuilt.merge("mygene", Some(&subset), None, &BuildOptions::default(), &NullSink),
        Err(KiraError::InvalidBuildConfig(_))
    );
    assert_matches!(
        rebuilt.merge(
            "mygene",
            Some(&subset),
            Some("genedoc_missing"),
            &BuildOptions::default(),
            &NullSink
        ),
        Err(KiraError::TargetNotFound(_))
    );

    let result = rebuilt
        .merge(
            "mygene",
            Some(&subset),
            Some("genedoc_test"),
            &BuildOptions::default(),
            &NullSink,
        )
        .unwrap();
    assert_eq!(result.sources.len(), 1);

    let documents = by_key(&backend.collection("genedoc_test").unwrap());
    let cdk2 = &documents[&DocKey::Int(1017)];
    assert_eq!(cdk2["reporter"], json!({"HG-U133_Plus_2": "211804_s_at"}));
    assert_eq!(cdk2["symbol"], json!("CDK2"));
    assert_eq!(cdk2["interpro"].as_array().unwrap().len(), 2);
}

#[test]
fn subset_merge_does_not_add_rootless_documents() {
    let backend = MemoryTargetBackend::new();
    let builder = builder(&backend);
    builder
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &NullSink)
        .unwrap();
    let before = backend.collection("genedoc_test").unwrap();

    let subset = ["reporter".to_string()];
    let result = builder
        .merge(
            "mygene",
            Some(&subset),
            Some("genedoc_test"),
            &BuildOptions::default(),
            &NullSink,
        )
        .unwrap();
    assert_eq!(result.orphaned, 1);
    assert_eq!(result.documents_written, 1);
    assert_eq!(backend.collection("genedoc_test").unwrap(), before);
}

#[test]
fn earlier_output_scheme_takes_precedence() {
    let interpro = MemorySource::new(
        "ensembl_interpro",
        SourceSchema::new("ensembl").with_main_source("ensembl"),
    )
    .with_json([
        json!({"_id": "ENSG01", "interpro": {"id": "IPR000719"}}),
        json!({"_id": "ENSG09", "interpro": {"id": "IPR011009"}}),
    ]);
    let backend = MemoryTargetBackend::new();
    let mut builder = DocumentBuilder::new(
        registry(vec![
            Arc::new(entrez_gene()),
            Arc::new(ensembl_gene()),
            Arc::new(interpro),
        ]),
        graph(),
        Arc::new(backend.clone()),
    );
    builder.add_build(
        BuildConfig::new("mygene", "entrez")
            .with_sources(["entrez_gene", "ensembl_gene", "ensembl_interpro"])
            .with_root_sources(["entrez_gene", "ensembl_gene"])
            .with_output_schemes(["entrez", "ensembl"])
            .with_species(vec![9606]),
    );

    let result = builder
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &NullSink)
        .unwrap();
    assert_eq!(result.orphaned, 0);
    assert_eq!(result.sources[2].translated, 2);

    let documents = by_key(&backend.collection("genedoc_test").unwrap());
    assert_eq!(
        documents[&DocKey::Int(1017)],
        json!({
            "symbol": "CDK2",
            "ensembl": {"gene": "ENSG01"},
            "interpro": {"id": "IPR000719"}
        })
    );
    assert_eq!(
        documents[&DocKey::from("ENSG09")],
        json!({"ensembl": {"gene": "ENSG09"}, "interpro": {"id": "IPR011009"}})
    );
    assert!(!documents.contains_key(&DocKey::from("ENSG01")));
}

#[test]
fn string_keys_join_integer_roots_after_conversion() {
    let reporter = MemorySource::new(
        "reporter",
        SourceSchema::new("entrez").with_convert(KeyConvert::Int),
    )
    .with_json([json!({"_id": "1017", "reporter": {"HG-U133_Plus_2": "204252_at"}})]);
    let backend = MemoryTargetBackend::new();
    let mut builder = DocumentBuilder::new(
        registry(vec![Arc::new(entrez_gene()), Arc::new(reporter)]),
        graph(),
        Arc::new(backend.clone()),
    );
    builder.add_build(
        BuildConfig::new("mygene", "entrez")
            .with_sources(["entrez_gene", "reporter"])
            .with_root_sources(["entrez_gene"]),
    );

    let result = builder
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &NullSink)
        .unwrap();
    assert_eq!(result.orphaned, 0);
    let documents = by_key(&backend.collection("genedoc_test").unwrap());
    assert_eq!(
        documents[&DocKey::Int(1017)]["reporter"],
        json!({"HG-U133_Plus_2": "204252_at"})
    );
    assert!(!documents.contains_key(&DocKey::from("1017")));
}

#[test]
fn mapping_tables_are_reloaded_for_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("ensembl2entrez.tsv")).unwrap();
    fs::write(&path, "ENSG01\t1017\n").unwrap();

    let mut graph = TranslationGraph::new();
    graph.add_node("entrez");
    graph.register_mapper(
        "ensembl",
        "entrez",
        Arc::new(
            IdMapper::new("ensembl2entrez", TsvMappingFile::new(path.clone()))
                .with_convert(KeyConvert::Int),
        ),
    );
    let backend = MemoryTargetBackend::new();
    let mut builder = DocumentBuilder::new(
        registry(vec![Arc::new(ensembl_interpro())]),
        graph,
        Arc::new(backend.clone()),
    );
    builder.add_build(BuildConfig::new("interpro", "entrez").with_sources(["ensembl_interpro"]));

    builder
        .merge("interpro", None, Some("genedoc_a"), &BuildOptions::default(), &NullSink)
        .unwrap();
    fs::write(&path, "ENSG01\t1018\n").unwrap();
    builder
        .merge("interpro", None, Some("genedoc_b"), &BuildOptions::default(), &NullSink)
        .unwrap();

    let first = backend.collection("genedoc_a").unwrap();
    let second = backend.collection("genedoc_b").unwrap();
    assert_eq!(first[0].id, DocKey::Int(1017));
    assert_eq!(second[0].id, DocKey::Int(1018));
    assert_eq!(second.len(), 1);
}

#[test]
fn existing_target_is_never_overwritten() {
    let backend = MemoryTargetBackend::new();
    let builder = builder(&backend);
    builder
        .merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &NullSink)
        .unwrap();
    assert_matches!(
        builder.merge("mygene", None, Some("genedoc_test"), &BuildOptions::default(), &NullSink),
        Err(KiraError::TargetExists(_))
    );
}

#[test]
fn generated_target_names_use_the_build_name() {
    let backend = MemoryTargetBackend::new();
    let result = builder(&backend)
        .merge("mygene", None, None, &BuildOptions::default(), &NullSink)
        .unwrap();
    assert!(result.target.starts_with("genedoc_mygene_"));
    assert!(backend.collection(&result.target).is_some());
}

#[test]
fn cancellation_stops_before_the_next_source() {
    let options = BuildOptions::default();
    let entrez = CancellingSource {
        inner: entrez_gene(),
        cancel: options.cancel.clone(),
    };
    let backend = MemoryTargetBackend::new();
    let mut builder = DocumentBuilder::new(
        registry(vec![Arc::new(entrez), Arc::new(reporter("204252_at"))]),
        graph(),
        Arc::new(backend.clone()),
    );
    builder.add_build(
        BuildConfig::new("mygene", "entrez")
            .with_sources(["entrez_gene", "reporter"])
            .with_root_sources(["entrez_gene"]),
    );

    let result = builder
        .merge("mygene", None, Some("genedoc_test"), &options, &NullSink)
        .unwrap();
    assert!(result.cancelled);
    assert_eq!(result.state, BuildState::Cancelled);
    assert_eq!(result.sources[0].read, 4);
    assert!(result.sources[1].skipped);
    assert_eq!(result.documents_written, 0);
    assert!(!backend.exists("genedoc_test").unwrap());
}
