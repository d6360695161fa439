//! PANTHER reference-genome ortholog table.
//!
//! Each line pairs a reference gene with one of its orthologs:
//!
//! ```text
//! HUMAN|HGNC=11477|UniProtKB=P31946<TAB>MOUSE|MGI=MGI=109194|UniProtKB=Q9CQV8<TAB>LDO<TAB>Euarchontoglires<TAB>PTHR18860
//! ```
//!
//! Consecutive lines of one reference gene fold into a single document keyed by
//! the reference UniProt accession, with the orthologs collected under
//! `pantherdb.ortholog`.

use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::domain::{Document, RawRecord};
use crate::error::{KiraError, RecordError};
use crate::grouping::group_contiguous;
use crate::source::{RecordStream, SourceAdapter, SourceSchema, open_lines};

pub const GROUP: &str = "pantherdb";

static GENE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<species>[^|]+)\|(?P<db>[^=|]+)=(?:[^|]*=)?(?P<id>[^|=]+)\|UniProtKB=(?P<acc>[^|\s]+)$",
    )
    .expect("valid gene field regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneRef {
    pub species: String,
    pub db_name: String,
    pub db_id: String,
    pub uniprot_kb: String,
}

impl GeneRef {
    pub fn parse(field: &str) -> Option<Self> {
        let captures = GENE_FIELD.captures(field.trim())?;
        Some(Self {
            species: captures["species"].to_string(),
            db_name: captures["db"].to_string(),
            db_id: captures["id"].to_string(),
            uniprot_kb: captures["acc"].to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrthologRow {
    pub reference: GeneRef,
    pub ortholog: GeneRef,
    pub ortholog_type: String,
    pub panther_family: String,
}

impl OrthologRow {
    pub fn parse(line: &str) -> Result<Self, String> {
        let columns = line
            .trim_end_matches(['\r', '\n'])
            .split('\t')
            .collect::<Vec<_>>();
        if columns.len() < 5 {
            return Err(format!(
                "expected 5 tab-separated columns, found {}",
                columns.len()
            ));
        }
        let reference = GeneRef::parse(columns[0])
            .ok_or_else(|| format!("malformed reference gene field: {}", columns[0]))?;
        let ortholog = GeneRef::parse(columns[1])
            .ok_or_else(|| format!("malformed ortholog gene field: {}", columns[1]))?;
        Ok(Self {
            reference,
            ortholog,
            ortholog_type: columns[2].trim().to_string(),
            panther_family: columns[4].trim().to_string(),
        })
    }

    fn ortholog_entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert(
            self.ortholog.db_name.clone(),
            Value::String(self.ortholog.db_id.clone()),
        );
        entry.insert("uniprot_kb".to_string(), json!(self.ortholog.uniprot_kb));
        entry.insert("ortholog_type".to_string(), json!(self.ortholog_type));
        entry.insert("panther_family".to_string(), json!(self.panther_family));
        Value::Object(entry)
    }
}

/// Builds one document from the rows of one reference gene. The reference's
/// database fields come from the first row.
pub fn fold_group(rows: &[OrthologRow]) -> Option<RawRecord> {
    let first = rows.first()?;
    let mut group = Map::new();
    group.insert(
        first.reference.db_name.clone(),
        Value::String(first.reference.db_id.clone()),
    );
    group.insert("uniprot_kb".to_string(), json!(first.reference.uniprot_kb));
    group.insert(
        "ortholog".to_string(),
        Value::Array(rows.iter().map(OrthologRow::ortholog_entry).collect()),
    );
    let mut payload = Document::new();
    payload.insert(GROUP.to_string(), Value::Object(group));
    Some(RawRecord::new(first.reference.uniprot_kb.as_str(), payload))
}

/// Lazily folds parsed rows into documents, one per contiguous block of a
/// reference gene.
pub fn parse_rows<I, E>(rows: I) -> impl Iterator<Item = Result<RawRecord, E>>
where
    I: IntoIterator<Item = Result<OrthologRow, E>>,
{
    group_contiguous(rows, |row: &OrthologRow| row.reference.uniprot_kb.clone()).filter_map(
        |group| match group {
            Ok((_, rows)) => fold_group(&rows).map(Ok),
            Err(err) => Some(Err(err)),
        },
    )
}

/// Parses raw numbered lines; malformed lines become record errors.
pub fn parse_lines<'a, I>(
    source_name: &'a str,
    lines: I,
) -> impl Iterator<Item = Result<RawRecord, RecordError>> + 'a
where
    I: IntoIterator<Item = (usize, Result<String, String>)>,
    I::IntoIter: 'a,
{
    let rows = lines.into_iter().filter_map(move |(line_no, line)| {
        let line = match line {
            Ok(line) => line,
            Err(err) => return Some(Err(RecordError::new(source_name, Some(line_no), err))),
        };
        if line.trim().is_empty() || line.starts_with('#') {
            return None;
        }
        Some(
            OrthologRow::parse(&line)
                .map_err(|reason| RecordError::new(source_name, Some(line_no), reason)),
        )
    });
    parse_rows(rows)
}

/// Source adapter over a `RefGenomeOrthologs` file.
#[derive(Debug, Clone)]
pub struct PantherSource {
    name: String,
    schema: SourceSchema,
    path: Utf8PathBuf,
}

impl PantherSource {
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

impl SourceAdapter for PantherSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn stream(&self) -> Result<RecordStream<'_>, KiraError> {
        let lines = open_lines(&self.name, &self.path)?;
        Ok(Box::new(parse_lines(&self.name, lines)))
    }
}
