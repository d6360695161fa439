use std::fs;

use camino::Utf8PathBuf;
use serde_json::json;

use kira_genedoc::domain::DocKey;
use kira_genedoc::panther::{self, OrthologRow, PantherSource};
use kira_genedoc::source::{SourceAdapter, SourceSchema};

const YWHAB_MOUSE: &str =
    "HUMAN|HGNC=12849|UniProtKB=P31946\tMOUSE|MGI=MGI=1891525|UniProtKB=Q9CQV8\tLDO\tEuarchontoglires\tPTHR18860";
const YWHAB_RAT: &str =
    "HUMAN|HGNC=12849|UniProtKB=P31946\tRAT|RGD=621173|UniProtKB=P35213\tO\tEuarchontoglires\tPTHR18860";
const CDK2_MOUSE: &str =
    "HUMAN|HGNC=1771|UniProtKB=P24941\tMOUSE|MGI=MGI=104772|UniProtKB=P97377\tLDO\tEuarchontoglires\tPTHR24056";

fn write_table(dir: &tempfile::TempDir, lines: &[&str]) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("RefGenomeOrthologs.tsv")).unwrap();
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

#[test]
fn last_group_is_flushed() {
    let rows = [YWHAB_MOUSE, YWHAB_RAT, CDK2_MOUSE]
        .into_iter()
        .map(OrthologRow::parse);
    let records = panther::parse_rows(rows)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, DocKey::from("P31946"));
    assert_eq!(records[1].key, DocKey::from("P24941"));
    assert_eq!(
        records[1].payload["pantherdb"],
        json!({
            "HGNC": "1771",
            "uniprot_kb": "P24941",
            "ortholog": [{
                "MGI": "104772",
                "uniprot_kb": "P97377",
                "ortholog_type": "LDO",
                "panther_family": "PTHR24056"
            }]
        })
    );
}

#[test]
fn source_reads_file_and_reports_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_table(
        &dir,
        &[
            YWHAB_MOUSE,
            "HUMAN|HGNC=12849\tbroken",
            YWHAB_RAT,
            "",
            CDK2_MOUSE,
        ],
    );
    let source = PantherSource::new("pantherdb", SourceSchema::new("swissprot"), path);
    let items = source.stream().unwrap().collect::<Vec<_>>();

    let errors = items.iter().filter_map(|item| item.as_ref().err()).collect::<Vec<_>>();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, Some(2));

    let records = items.into_iter().filter_map(Result::ok).collect::<Vec<_>>();
    assert_eq!(records.len(), 2);
    let orthologs = records[0].payload["pantherdb"]["ortholog"].as_array().unwrap();
    assert_eq!(orthologs.len(), 2);
    assert_eq!(orthologs[1]["RGD"], json!("621173"));
}

#[test]
fn non_contiguous_rows_yield_separate_documents() {
    let lines = [YWHAB_MOUSE, CDK2_MOUSE, YWHAB_RAT]
        .iter()
        .enumerate()
        .map(|(index, line)| (index + 1, Ok(line.to_string())));
    let records = panther::parse_lines("pantherdb", lines)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let keys = records.iter().map(|record| record.key.to_string()).collect::<Vec<_>>();
    assert_eq!(keys, ["P31946", "P24941", "P31946"]);
}
