//! Aggregate reader for chunk directories
//!
//! Pairs every array file with its metadata slice by file name, restores
//! flush order and concatenates both into one feature matrix and one
//! row-aligned metadata table.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use ndarray::{Array1, Array2};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::chunk::{ChunkKind, ChunkName, ARRAY_TENSOR};
use crate::dataset::{DocumentId, ID_COLUMN};
use crate::error::{ExtractError, Result};
use crate::reduce::Statistic;

/// Feature matrix with row-aligned metadata.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub features: Array2<f32>,
    pub ids: Vec<DocumentId>,
    pub metadata: Vec<Map<String, Value>>,
}

impl FeatureSet {
    pub fn n_rows(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Binary labels from a metadata column holding `0`/`1` or booleans.
    pub fn labels(&self, column: &str) -> Result<Array1<usize>> {
        self.metadata
            .iter()
            .zip(&self.ids)
            .map(|(row, id)| match row.get(column) {
                Some(Value::Bool(b)) => Ok(usize::from(*b)),
                Some(Value::Number(n)) => match n.as_f64() {
                    Some(v) if v == 0.0 => Ok(0),
                    Some(v) if v == 1.0 => Ok(1),
                    _ => Err(ExtractError::config(format!(
                        "label '{column}' of {id} is {n}, expected 0 or 1"
                    ))),
                },
                other => Err(ExtractError::config(format!(
                    "label '{column}' of {id} is {other:?}, expected 0 or 1"
                ))),
            })
            .collect()
    }
}

/// Chunk files found in one output directory.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    dir: PathBuf,
    chunks: Vec<ChunkName>,
}

/// One loaded array chunk with its paired metadata.
struct LoadedChunk {
    name: ChunkName,
    sequence: usize,
    array: Tensor,
    rows: Vec<Map<String, Value>>,
}

impl FeatureStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut chunks = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| ExtractError::io(&dir, e))? {
            let entry = entry.map_err(|e| ExtractError::io(&dir, e))?;
            let file_name = entry.file_name();
            match file_name.to_str().and_then(ChunkName::parse) {
                Some(name) => chunks.push(name),
                None => debug!("Ignoring {:?}", file_name),
            }
        }
        chunks.sort_by(|a, b| natural_cmp(&a.file_name(), &b.file_name()));
        info!("Found {} chunk files in {}", chunks.len(), dir.display());
        Ok(Self { dir, chunks })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunks(&self) -> &[ChunkName] {
        &self.chunks
    }

    /// Layers present in the directory (`None` for single-layer encoders).
    pub fn layers(&self) -> Vec<Option<usize>> {
        let set: BTreeSet<Option<usize>> = self.chunks.iter().map(|c| c.layer).collect();
        set.into_iter().collect()
    }

    /// Statistics present for one layer.
    pub fn statistics(&self, layer: Option<usize>) -> Vec<Statistic> {
        let set: BTreeSet<Statistic> = self
            .chunks
            .iter()
            .filter(|c| c.layer == layer)
            .filter_map(|c| match c.kind {
                ChunkKind::Array(stat) => Some(stat),
                ChunkKind::Metadata => None,
            })
            .collect();
        set.into_iter().collect()
    }

    /// Load every chunk of `(stat, layer)` in the order it was written,
    /// including chunks appended by later runs into the same directory.
    pub fn load(&self, stat: Statistic, layer: Option<usize>) -> Result<FeatureSet> {
        let mut loaded = Vec::new();
        for name in self
            .chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Array(stat) && c.layer == layer)
        {
            let partner = name.partner_metadata();
            if !self.chunks.contains(&partner) {
                return Err(ExtractError::config(format!(
                    "{name} has no metadata file {partner}"
                )));
            }
            loaded.push(self.load_chunk(name, &partner)?);
        }
        if loaded.is_empty() {
            return Err(ExtractError::config(format!(
                "no '{stat}' chunks for layer {layer:?} in {}",
                self.dir.display()
            )));
        }
        loaded.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| natural_cmp(a.name.first.as_str(), b.name.first.as_str()))
        });

        let dim = loaded[0].array.dim(1)?;
        let mut ids = Vec::new();
        let mut metadata = Vec::new();
        let mut arrays = Vec::with_capacity(loaded.len());
        for chunk in loaded {
            if chunk.array.dim(1)? != dim {
                return Err(ExtractError::config(format!(
                    "{} has {} features, expected {dim}",
                    chunk.name,
                    chunk.array.dim(1)?
                )));
            }
            for row in &chunk.rows {
                let id = row
                    .get(ID_COLUMN)
                    .and_then(|v| serde_json::from_value::<DocumentId>(v.clone()).ok())
                    .ok_or_else(|| {
                        ExtractError::config(format!(
                            "metadata of {} has a row without {ID_COLUMN}",
                            chunk.name
                        ))
                    })?;
                ids.push(id);
            }
            metadata.extend(chunk.rows);
            arrays.push(chunk.array);
        }

        let stacked = Tensor::cat(&arrays, 0)?;
        let n_rows = stacked.dim(0)?;
        let flat: Vec<f32> = stacked.flatten_all()?.to_vec1()?;
        let features = Array2::from_shape_vec((n_rows, dim), flat)
            .map_err(|e| ExtractError::config(format!("feature matrix shape: {e}")))?;
        info!(
            "Loaded '{}' layer {:?}: {} rows x {} features from {} chunks",
            stat,
            layer,
            n_rows,
            dim,
            arrays.len()
        );
        Ok(FeatureSet {
            features,
            ids,
            metadata,
        })
    }

    fn load_chunk(&self, name: &ChunkName, partner: &ChunkName) -> Result<LoadedChunk> {
        let path = self.dir.join(name.file_name());
        let compressed = std::fs::read(&path).map_err(|e| ExtractError::io(&path, e))?;
        let raw = zstd::decode_all(compressed.as_slice()).map_err(|e| ExtractError::io(&path, e))?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&raw)?;
        let sequence = header
            .metadata()
            .as_ref()
            .and_then(|info| info.get("sequence"))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(usize::MAX);
        let mut tensors = candle_core::safetensors::load_buffer(&raw, &Device::Cpu)?;
        let array = tensors
            .remove(ARRAY_TENSOR)
            .ok_or_else(|| ExtractError::config(format!("{name} has no '{ARRAY_TENSOR}' tensor")))?
            .to_dtype(DType::F32)?;
        if array.rank() != 2 {
            return Err(ExtractError::config(format!(
                "{name} holds shape {:?}, expected [rows, features]",
                array.dims()
            )));
        }

        let rows = read_rows(&self.dir.join(partner.file_name()))?;
        if rows.len() != array.dim(0)? {
            return Err(ExtractError::config(format!(
                "{name} has {} rows but {partner} has {}",
                array.dim(0)?,
                rows.len()
            )));
        }
        Ok(LoadedChunk {
            name: name.clone(),
            sequence,
            array,
            rows,
        })
    }
}

fn read_rows(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let file = File::open(path).map_err(|e| ExtractError::io(path, e))?;
    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| ExtractError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|source| ExtractError::Json {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Compare strings treating runs of ASCII digits as numbers, so that
/// `doc9` sorts before `doc10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let a_len = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let b_len = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let a_num = trim_zeros(&a[..a_len]);
                let b_num = trim_zeros(&b[..b_len]);
                let ord = a_num
                    .len()
                    .cmp(&b_num.len())
                    .then_with(|| a_num.cmp(b_num))
                    .then_with(|| a_len.cmp(&b_len));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[a_len..];
                b = &b[b_len..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().position(|&d| d != b'0').unwrap_or(digits.len());
    &digits[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("doc9", "doc10"), Ordering::Less);
        assert_eq!(natural_cmp("doc101", "doc11"), Ordering::Greater);
        assert_eq!(natural_cmp("a", "b"), Ordering::Less);
        assert_eq!(natural_cmp("7", "007"), Ordering::Less);
        assert_eq!(natural_cmp("x1y", "x1y"), Ordering::Equal);
    }

    #[test]
    fn test_labels_accept_bools_and_integers() {
        let set = FeatureSet {
            features: Array2::zeros((3, 2)),
            ids: vec!["1".into(), "2".into(), "3".into()],
            metadata: vec![
                json!({"label": 1}).as_object().unwrap().clone(),
                json!({"label": false}).as_object().unwrap().clone(),
                json!({"label": 0.0}).as_object().unwrap().clone(),
            ],
        };
        assert_eq!(set.labels("label").unwrap().to_vec(), vec![1, 0, 0]);
        assert!(set.labels("missing").is_err());
    }

    #[test]
    fn test_labels_reject_other_values() {
        let set = FeatureSet {
            features: Array2::zeros((1, 2)),
            ids: vec!["1".into()],
            metadata: vec![json!({"label": 2}).as_object().unwrap().clone()],
        };
        assert!(set.labels("label").unwrap_err().is_configuration());
    }
}
