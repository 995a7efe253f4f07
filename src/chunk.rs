//! Durable chunk files
//!
//! One flush produces one array file per statistic and one metadata slice,
//! all named after the same `(layer, first_id, last_id)` tuple:
//!
//! ```text
//! mean_layer12_1001_1100.safetensors.zst   stacked vectors, tensor "arr" [n, dim]
//! max_layer12_1001_1100.safetensors.zst
//! meta_layer12_1001_1100.jsonl             n metadata rows, same order
//! ```
//!
//! Files are staged in a temporary file inside the output directory and moved
//! into place with a no-clobber rename, so a final name either holds a
//! complete file or does not exist.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::dataset::{DocumentId, MetadataTable};
use crate::error::{ChunkRange, ExtractError, Result};
use crate::reduce::Statistic;

pub const ARRAY_EXTENSION: &str = ".safetensors.zst";
pub const METADATA_EXTENSION: &str = ".jsonl";
const METADATA_PREFIX: &str = "meta";
/// Name of the single tensor stored in each array file.
pub const ARRAY_TENSOR: &str = "arr";
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// `_layer{N}` for multi-layer encoders, empty otherwise.
pub fn layer_suffix(layer: Option<usize>) -> String {
    match layer {
        Some(layer) => format!("_layer{layer}"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Array(Statistic),
    Metadata,
}

/// Parsed chunk file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub kind: ChunkKind,
    pub layer: Option<usize>,
    pub first: DocumentId,
    pub last: DocumentId,
}

impl ChunkName {
    pub fn array(stat: Statistic, layer: Option<usize>, first: &DocumentId, last: &DocumentId) -> Self {
        Self {
            kind: ChunkKind::Array(stat),
            layer,
            first: first.clone(),
            last: last.clone(),
        }
    }

    pub fn metadata(layer: Option<usize>, first: &DocumentId, last: &DocumentId) -> Self {
        Self {
            kind: ChunkKind::Metadata,
            layer,
            first: first.clone(),
            last: last.clone(),
        }
    }

    /// The metadata file paired with this chunk file.
    pub fn partner_metadata(&self) -> Self {
        Self::metadata(self.layer, &self.first, &self.last)
    }

    pub fn file_name(&self) -> String {
        let (prefix, extension) = match self.kind {
            ChunkKind::Array(stat) => (stat.as_str(), ARRAY_EXTENSION),
            ChunkKind::Metadata => (METADATA_PREFIX, METADATA_EXTENSION),
        };
        format!(
            "{prefix}{}_{}_{}{extension}",
            layer_suffix(self.layer),
            self.first,
            self.last
        )
    }

    /// Parse a file name produced by [`ChunkName::file_name`]. Returns `None`
    /// for anything else.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, is_array) = if let Some(stem) = file_name.strip_suffix(ARRAY_EXTENSION) {
            (stem, true)
        } else {
            (file_name.strip_suffix(METADATA_EXTENSION)?, false)
        };

        let mut parts = stem.rsplitn(3, '_');
        let last = parts.next()?;
        let first = parts.next()?;
        let prefix = parts.next()?;
        let (first, last) = (DocumentId::from(first), DocumentId::from(last));
        if !first.is_filename_safe() || !last.is_filename_safe() {
            return None;
        }

        let (head, layer) = match prefix.split_once("_layer") {
            Some((head, layer)) => (head, Some(layer.parse::<usize>().ok()?)),
            None => (prefix, None),
        };
        let kind = match (head, is_array) {
            (METADATA_PREFIX, false) => ChunkKind::Metadata,
            (name, true) => ChunkKind::Array(name.parse().ok()?),
            _ => return None,
        };
        Some(Self {
            kind,
            layer,
            first,
            last,
        })
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Files written for one flushed batch.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub range: ChunkRange,
    /// Flush sequence number within the layer pass.
    pub chunk_index: usize,
    /// Position among all metadata chunks of this layer in the directory,
    /// including chunks left by earlier runs.
    pub sequence: usize,
    pub rows: usize,
    pub arrays: Vec<(Statistic, PathBuf)>,
    pub metadata: PathBuf,
}

/// Writes batches into an append-only output directory.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    dir: PathBuf,
    zstd_level: i32,
}

impl ChunkWriter {
    /// Open (and create if needed) the output directory.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ExtractError::io(&dir, e))?;
        Ok(Self {
            dir,
            zstd_level: DEFAULT_ZSTD_LEVEL,
        })
    }

    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `batch` as one chunk.
    ///
    /// Everything is encoded in memory first; files are only moved into place
    /// once every payload is ready. If a move fails, the files of this chunk
    /// that already landed are removed before the error is returned.
    pub fn write(
        &self,
        batch: &Batch,
        layer: Option<usize>,
        chunk_index: usize,
        metadata: &MetadataTable,
    ) -> Result<ChunkRecord> {
        let (first, last) = match (batch.first_id(), batch.last_id()) {
            (Some(first), Some(last)) => (first.clone(), last.clone()),
            _ => return Err(ExtractError::config("refusing to write an empty batch")),
        };
        let rows = metadata.slice(batch.ids())?;
        let sequence = self.next_sequence(layer)?;

        let mut payloads: Vec<(ChunkName, Vec<u8>)> = Vec::new();
        for stat in batch.statistics() {
            let stacked = batch.stack(stat)?;
            let bytes = self.encode_array(&stacked, stat, layer, &first, &last, (chunk_index, sequence))?;
            payloads.push((ChunkName::array(stat, layer, &first, &last), bytes));
        }

        let meta_name = ChunkName::metadata(layer, &first, &last);
        let meta_path = self.dir.join(meta_name.file_name());
        let mut meta_bytes = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            serde_json::to_writer(&mut meta_bytes, row).map_err(|source| ExtractError::Json {
                path: meta_path.clone(),
                line: idx + 1,
                source,
            })?;
            meta_bytes.push(b'\n');
        }
        payloads.push((meta_name, meta_bytes));

        let mut written: Vec<PathBuf> = Vec::with_capacity(payloads.len());
        for (name, bytes) in &payloads {
            let path = self.dir.join(name.file_name());
            if let Err(e) = self.persist(&path, bytes) {
                for landed in &written {
                    if let Err(cleanup) = std::fs::remove_file(landed) {
                        warn!("Could not remove partial chunk file {}: {cleanup}", landed.display());
                    }
                }
                return Err(e);
            }
            debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
            written.push(path);
        }

        let range = ChunkRange {
            layer,
            first,
            last,
        };
        info!(
            "Flushed chunk {} {}: {} documents, {} statistics",
            chunk_index,
            range,
            batch.len(),
            written.len() - 1
        );

        let metadata_path = written.pop().unwrap_or(meta_path);
        let arrays = batch.statistics().zip(written).collect();
        Ok(ChunkRecord {
            range,
            chunk_index,
            sequence,
            rows: batch.len(),
            arrays,
            metadata: metadata_path,
        })
    }

    /// Number of metadata chunks of `layer` already in the directory.
    fn next_sequence(&self, layer: Option<usize>) -> Result<usize> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| ExtractError::io(&self.dir, e))?;
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| ExtractError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str().and_then(ChunkName::parse) else {
                continue;
            };
            if name.kind == ChunkKind::Metadata && name.layer == layer {
                count += 1;
            }
        }
        Ok(count)
    }

    fn encode_array(
        &self,
        stacked: &Tensor,
        stat: Statistic,
        layer: Option<usize>,
        first: &DocumentId,
        last: &DocumentId,
        (chunk_index, sequence): (usize, usize),
    ) -> Result<Vec<u8>> {
        let info: HashMap<String, String> = [
            ("statistic", stat.as_str().to_string()),
            (
                "layer",
                layer.map_or_else(|| "none".to_string(), |l| l.to_string()),
            ),
            ("first_id", first.to_string()),
            ("last_id", last.to_string()),
            ("rows", stacked.dim(0)?.to_string()),
            ("chunk_index", chunk_index.to_string()),
            ("sequence", sequence.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let raw = safetensors::tensor::serialize([(ARRAY_TENSOR, stacked)], &Some(info))?;
        zstd::encode_all(raw.as_slice(), self.zstd_level)
            .map_err(|e| ExtractError::io(self.dir.join(ChunkName::array(stat, layer, first, last).file_name()), e))
    }

    fn persist(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| ExtractError::io(&self.dir, e))?;
        tmp.write_all(bytes).map_err(|e| ExtractError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| ExtractError::io(tmp.path(), e))?;
        tmp.persist_noclobber(path)
            .map_err(|e| ExtractError::io(path, e.error))?;
        Ok(())
    }
}
