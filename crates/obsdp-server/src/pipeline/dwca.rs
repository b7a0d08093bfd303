//! Darwin Core Archive parsing
//!
//! An archive is a zip holding a tab-separated core file (`occurrence.txt`) with
//! a header row of Darwin Core terms. Each data row becomes one verbatim record
//! whose payload maps term -> value; empty cells are left out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::{Cursor, Read};
use tracing::debug;

use super::archive::UploadedArchive;
use super::types::VerbatimRecord;

const CORE_FILE: &str = "occurrence.txt";
const SOURCE_HINT_TERM: &str = "datasetName";
const RECORD_ID_TERM: &str = "occurrenceID";

/// Records read from one archive
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedArchive {
    /// Source the archive names itself as, if any
    pub source_hint: Option<String>,
    pub records: Vec<VerbatimRecord>,
}

/// Turns an uploaded archive into verbatim records
#[async_trait]
pub trait ArchiveParser: Send + Sync {
    async fn parse(&self, archive: &UploadedArchive, bytes: Vec<u8>) -> Result<ParsedArchive>;
}

/// Parser for zip-packaged Darwin Core Archives
#[derive(Debug, Clone, Copy, Default)]
pub struct DwcArchiveParser;

#[async_trait]
impl ArchiveParser for DwcArchiveParser {
    async fn parse(&self, archive: &UploadedArchive, bytes: Vec<u8>) -> Result<ParsedArchive> {
        let handle = archive.handle.clone();
        tokio::task::spawn_blocking(move || parse_dwca(&bytes))
            .await
            .context("Archive parser task failed")?
            .with_context(|| format!("Failed to parse archive '{handle}'"))
    }
}

/// Parse archive bytes
pub fn parse_dwca(bytes: &[u8]) -> Result<ParsedArchive> {
    let core = extract_core(bytes)?;
    let text = String::from_utf8(core).context("Core file is not UTF-8")?;

    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .context("Core file has no header row")?
        .split('\t')
        .map(str::trim)
        .collect();

    let mut parsed = ParsedArchive::default();
    for (row, line) in lines.enumerate() {
        let mut payload = Map::new();
        for (term, value) in header.iter().zip(line.split('\t')) {
            let value = value.trim();
            if !value.is_empty() {
                payload.insert((*term).to_string(), Value::String(value.to_string()));
            }
        }

        if parsed.source_hint.is_none() {
            parsed.source_hint = payload
                .get(SOURCE_HINT_TERM)
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        let record_id = payload
            .get(RECORD_ID_TERM)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("row-{}", row + 1));
        parsed
            .records
            .push(VerbatimRecord::new(record_id, Value::Object(payload)));
    }

    debug!(records = parsed.records.len(), hint = ?parsed.source_hint, "Parsed archive");
    Ok(parsed)
}

fn extract_core(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to open zip archive")?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry at index {i}"))?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        let basename = name.split('/').next_back().unwrap_or(&name);
        if basename.eq_ignore_ascii_case(CORE_FILE) {
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .with_context(|| format!("Failed to read zip entry: {name}"))?;
            return Ok(contents);
        }
    }

    anyhow::bail!("{CORE_FILE} not found in archive")
}

/// Build an archive in memory; used by tests across the crate
#[cfg(test)]
pub(crate) fn build_dwca(core: &str) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("dwca/occurrence.txt", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(core.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}
