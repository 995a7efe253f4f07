//! Transcript documents and their metadata
//!
//! Documents are read from a JSONL file of transcript components
//! (`{"transcript_id": .., "component_text": ..}`), metadata from a JSONL
//! file with one row per transcript. Both are fully materialised before
//! extraction starts.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{ExtractError, Result};

/// Column holding the document id in metadata rows.
pub const ID_COLUMN: &str = "transcript_id";

/// Opaque document identifier.
///
/// Transcript ids arrive either as JSON integers or strings; both are kept as
/// their textual form. Ids end up in chunk file names, see
/// [`DocumentId::is_filename_safe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, ASCII alphanumerics plus `-` and `.` only.
    ///
    /// `_` separates the id range in chunk names, so it cannot appear in an id.
    pub fn is_filename_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for DocumentId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid transcript id: {value}")))
    }
}

/// Documents in dataset enumeration order.
#[derive(Debug, Clone, Default)]
pub struct Documents {
    entries: Vec<(DocumentId, String)>,
    index: HashMap<DocumentId, usize>,
    duplicates: Vec<DocumentId>,
}

impl Documents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text to a document, creating it on first sight.
    ///
    /// Components are joined as `previous + " " + text`, so every assembled
    /// document starts with a space and repeated components are kept.
    pub fn append_component(&mut self, id: DocumentId, text: &str) {
        match self.index.get(&id) {
            Some(&pos) => {
                let body = &mut self.entries[pos].1;
                body.push(' ');
                body.push_str(text);
            }
            None => self.insert_new(id, format!(" {text}")),
        }
    }

    /// Insert a fully assembled document as-is. A second document with the
    /// same id keeps the first text and is reported by
    /// [`MetadataTable::validate`].
    pub fn push(&mut self, id: DocumentId, text: impl Into<String>) {
        if self.index.contains_key(&id) {
            self.duplicates.push(id);
            return;
        }
        self.insert_new(id, text.into());
    }

    fn insert_new(&mut self, id: DocumentId, text: String) {
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push((id, text));
    }

    /// Ids pushed more than once, in the order the repeats were seen.
    pub fn duplicates(&self) -> &[DocumentId] {
        &self.duplicates
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocumentId, &str)> {
        self.entries.iter().map(|(id, text)| (id, text.as_str()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.entries.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(DocumentId, String)> for Documents {
    fn from_iter<I: IntoIterator<Item = (DocumentId, String)>>(iter: I) -> Self {
        let mut documents = Self::new();
        for (id, text) in iter {
            documents.push(id, text);
        }
        documents
    }
}

/// Metadata rows indexed by document id.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    rows: HashMap<DocumentId, Map<String, Value>>,
    duplicates: Vec<DocumentId>,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row. The row must carry an id column; a second row for the
    /// same id is remembered and reported by [`MetadataTable::validate`].
    pub fn insert(&mut self, row: Map<String, Value>) -> Result<()> {
        let id = row
            .get(ID_COLUMN)
            .and_then(DocumentId::from_json)
            .ok_or_else(|| ExtractError::config(format!("metadata row without {ID_COLUMN}")))?;
        if self.rows.contains_key(&id) {
            self.duplicates.push(id);
            return Ok(());
        }
        self.rows.insert(id, row);
        Ok(())
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Map<String, Value>> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.rows.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows for `ids`, in that order. Missing ids are a configuration error.
    pub fn slice(&self, ids: &[DocumentId]) -> Result<Vec<&Map<String, Value>>> {
        ids.iter()
            .map(|id| {
                self.rows
                    .get(id)
                    .ok_or_else(|| ExtractError::config(format!("no metadata row for {id}")))
            })
            .collect()
    }

    /// Check that documents are unique, that every document has exactly one
    /// metadata row and that every id is file-name safe.
    pub fn validate(&self, documents: &Documents) -> Result<()> {
        if let Some(id) = documents.duplicates().first() {
            return Err(ExtractError::config(format!(
                "{} duplicate document(s), first: {id}",
                documents.duplicates().len()
            )));
        }
        if let Some(id) = self.duplicates.first() {
            return Err(ExtractError::config(format!(
                "metadata has {} duplicate row(s), first for {id}",
                self.duplicates.len()
            )));
        }
        let missing: Vec<&DocumentId> = documents.ids().filter(|id| !self.contains(id)).collect();
        if let Some(first) = missing.first() {
            return Err(ExtractError::config(format!(
                "{} document(s) have no metadata row, first: {first}",
                missing.len()
            )));
        }
        if let Some(bad) = documents.ids().find(|id| !id.is_filename_safe()) {
            return Err(ExtractError::config(format!(
                "document id {bad:?} cannot be used in chunk file names"
            )));
        }
        Ok(())
    }
}

/// Source of documents and metadata for one extraction run.
pub trait DatasetSource {
    fn load_documents(&self) -> Result<Documents>;
    fn load_metadata(&self) -> Result<MetadataTable>;
}

/// One line of the components file.
#[derive(Debug, Deserialize)]
struct ComponentRecord {
    transcript_id: DocumentId,
    #[serde(default)]
    component_text: Option<String>,
}

/// Transcript components stored as JSONL, metadata as JSONL or CSV.
///
/// The metadata format follows the file extension: `.csv` files are read
/// with a header row, everything else as one JSON object per line.
#[derive(Debug, Clone)]
pub struct TranscriptDataset {
    components_path: PathBuf,
    metadata_path: PathBuf,
}

impl TranscriptDataset {
    pub fn new(components_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            components_path: components_path.into(),
            metadata_path: metadata_path.into(),
        }
    }
}

impl DatasetSource for TranscriptDataset {
    fn load_documents(&self) -> Result<Documents> {
        let mut documents = Documents::new();
        let mut n_components = 0usize;
        for_each_json_line(&self.components_path, |line, value| {
            let record: ComponentRecord =
                serde_json::from_value(value).map_err(|source| ExtractError::Json {
                    path: self.components_path.clone(),
                    line,
                    source,
                })?;
            let text = record.component_text.unwrap_or_default();
            documents.append_component(record.transcript_id, &text);
            n_components += 1;
            Ok(())
        })?;
        info!(
            "Loaded {} components into {} documents from {}",
            n_components,
            documents.len(),
            self.components_path.display()
        );
        Ok(documents)
    }

    fn load_metadata(&self) -> Result<MetadataTable> {
        let mut table = MetadataTable::new();
        if is_csv(&self.metadata_path) {
            for_each_csv_row(&self.metadata_path, |_, row| table.insert(row))?;
        } else {
            for_each_json_line(&self.metadata_path, |line, value| match value {
                Value::Object(row) => table.insert(row),
                other => Err(ExtractError::config(format!(
                    "{} line {line}: expected an object, got {other}",
                    self.metadata_path.display()
                ))),
            })?;
        }
        info!(
            "Loaded {} metadata rows from {}",
            table.len(),
            self.metadata_path.display()
        );
        Ok(table)
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// Read a CSV file with a header row into JSON objects, with 1-based line
/// numbers. The id column must be present.
fn for_each_csv_row<F>(path: &Path, mut f: F) -> Result<()>
where
    F: FnMut(usize, Map<String, Value>) -> Result<()>,
{
    let file = File::open(path).map_err(|e| ExtractError::io(path, e))?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));
    let headers = reader
        .headers()
        .map_err(|e| ExtractError::config(format!("{}: {e}", path.display())))?
        .clone();
    if !headers.iter().any(|h| h == ID_COLUMN) {
        return Err(ExtractError::config(format!(
            "{} has no {ID_COLUMN} column",
            path.display()
        )));
    }
    for (idx, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| ExtractError::config(format!("{}: {e}", path.display())))?;
        let line = record.position().map_or(idx + 2, |pos| pos.line() as usize);
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(column, cell)| (column.to_string(), csv_cell(column, cell)))
            .collect();
        f(line, row)?;
    }
    debug!("Finished reading {}", path.display());
    Ok(())
}

/// Type a CSV cell: empty cells are null, ids stay text, numbers and
/// booleans are parsed.
fn csv_cell(column: &str, cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if column == ID_COLUMN {
        return Value::String(cell.to_string());
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::from(int);
    }
    if let Some(float) = cell.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Value::Number(float);
    }
    match cell {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

/// Parse every non-blank line of a JSONL file, with 1-based line numbers.
fn for_each_json_line<F>(path: &Path, mut f: F) -> Result<()>
where
    F: FnMut(usize, Value) -> Result<()>,
{
    let file = File::open(path).map_err(|e| ExtractError::io(path, e))?;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| ExtractError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).map_err(|source| ExtractError::Json {
            path: path.to_path_buf(),
            line: line_no,
            source,
        })?;
        f(line_no, value)?;
    }
    debug!("Finished reading {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_components_concatenate_with_leading_space() {
        let mut docs = Documents::new();
        docs.append_component(DocumentId::from("7"), "Good morning.");
        docs.append_component(DocumentId::from("8"), "Hello.");
        docs.append_component(DocumentId::from("7"), "Thanks.");
        docs.append_component(DocumentId::from("7"), "Thanks.");

        let collected: Vec<(String, String)> = docs
            .iter()
            .map(|(id, text)| (id.to_string(), text.to_string()))
            .collect();
        assert_eq!(
            collected,
            vec![
                ("7".to_string(), " Good morning. Thanks. Thanks.".to_string()),
                ("8".to_string(), " Hello.".to_string()),
            ]
        );
    }

    #[test]
    fn test_document_id_from_number_and_string() {
        let a: DocumentId = serde_json::from_value(json!(123)).unwrap();
        let b: DocumentId = serde_json::from_value(json!("123")).unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_value::<DocumentId>(json!(1.5)).is_err());
    }

    #[test]
    fn test_filename_safe_ids() {
        assert!(DocumentId::from("doc-12.a").is_filename_safe());
        assert!(!DocumentId::from("doc_12").is_filename_safe());
        assert!(!DocumentId::from("a/b").is_filename_safe());
        assert!(!DocumentId::from("").is_filename_safe());
    }

    #[test]
    fn test_validate_missing_metadata() {
        let docs: Documents = vec![
            (DocumentId::from("1"), "a".to_string()),
            (DocumentId::from("2"), "b".to_string()),
        ]
        .into_iter()
        .collect();
        let mut table = MetadataTable::new();
        table.insert(row(json!({"transcript_id": 1, "label": 0}))).unwrap();

        let err = table.validate(&docs).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("first: 2"));
    }

    #[test]
    fn test_validate_duplicate_metadata() {
        let docs: Documents = vec![(DocumentId::from("1"), "a".to_string())]
            .into_iter()
            .collect();
        let mut table = MetadataTable::new();
        table.insert(row(json!({"transcript_id": 1}))).unwrap();
        table.insert(row(json!({"transcript_id": "1"}))).unwrap();
        assert!(table.validate(&docs).unwrap_err().is_configuration());
    }

    #[test]
    fn test_slice_preserves_order() {
        let mut table = MetadataTable::new();
        for i in 1..=3u64 {
            table.insert(row(json!({"transcript_id": i, "x": i * 10}))).unwrap();
        }
        let ids = vec![DocumentId::from(3u64), DocumentId::from(1u64)];
        let rows = table.slice(&ids).unwrap();
        assert_eq!(rows[0]["x"], json!(30));
        assert_eq!(rows[1]["x"], json!(10));
        assert!(table.slice(&[DocumentId::from("9")]).is_err());
    }

    #[test]
    fn test_duplicate_documents_are_rejected() {
        let docs: Documents = vec![
            (DocumentId::from("1"), "first".to_string()),
            (DocumentId::from("2"), "b".to_string()),
            (DocumentId::from("1"), "second".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs.duplicates(), &[DocumentId::from("1")]);
        assert_eq!(docs.iter().next().map(|(_, text)| text), Some("first"));

        let mut table = MetadataTable::new();
        table.insert(row(json!({"transcript_id": 1}))).unwrap();
        table.insert(row(json!({"transcript_id": 2}))).unwrap();
        let err = table.validate(&docs).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("duplicate document"));
    }

    #[test]
    fn test_repeated_components_are_not_duplicates() {
        let mut docs = Documents::new();
        docs.append_component(DocumentId::from("1"), "a");
        docs.append_component(DocumentId::from("1"), "b");
        assert!(docs.duplicates().is_empty());
    }

    #[test]
    fn test_csv_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let components = dir.path().join("components.jsonl");
        std::fs::write(
            &components,
            "{\"transcript_id\": 1, \"component_text\": \"a\"}\n\
             {\"transcript_id\": 2, \"component_text\": \"b\"}\n",
        )
        .unwrap();
        let metadata = dir.path().join("metadata.csv");
        std::fs::write(
            &metadata,
            "transcript_id,label,ticker,score,note\n1,1,ACME,0.5,\n2,0,\"BETA, Inc\",1.25,x\n",
        )
        .unwrap();

        let dataset = TranscriptDataset::new(&components, &metadata);
        let docs = dataset.load_documents().unwrap();
        let table = dataset.load_metadata().unwrap();
        table.validate(&docs).unwrap();

        let first = table.get(&DocumentId::from(1u64)).unwrap();
        assert_eq!(first["transcript_id"], json!("1"));
        assert_eq!(first["label"], json!(1));
        assert_eq!(first["score"], json!(0.5));
        assert_eq!(first["note"], Value::Null);
        assert_eq!(table.get(&DocumentId::from("2")).unwrap()["ticker"], json!("BETA, Inc"));
    }

    #[test]
    fn test_csv_metadata_duplicates_and_missing_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let docs: Documents = vec![(DocumentId::from("7"), "a".to_string())]
            .into_iter()
            .collect();

        let duplicated = dir.path().join("dup.csv");
        std::fs::write(&duplicated, "transcript_id,label\n7,1\n7,0\n").unwrap();
        let table = TranscriptDataset::new(dir.path().join("unused.jsonl"), &duplicated)
            .load_metadata()
            .unwrap();
        assert!(table.validate(&docs).unwrap_err().is_configuration());

        let no_id = dir.path().join("no_id.csv");
        std::fs::write(&no_id, "id,label\n7,1\n").unwrap();
        let err = TranscriptDataset::new(dir.path().join("unused.jsonl"), &no_id)
            .load_metadata()
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
