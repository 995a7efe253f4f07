//! Named encoder configurations
//!
//! A [`ModelRegistry`] is built once at start-up (the built-in table, or a
//! JSON file replacing it) and handed to encoder construction. It is never
//! mutated afterwards.
//!
//! JSON layout, one object per identifier:
//!
//! ```json
//! {
//!   "sae_2b": {
//!     "kind": "sae",
//!     "base_model": "google/gemma-2-2b",
//!     "checkpoint": "google/gemma-scope-2b-pt-res",
//!     "checkpoint_path": "layer_{layer}/width_16k/average_l0_{l0}/params.npz",
//!     "feature_dim": 16384,
//!     "layers": [5, 12, 20]
//!   },
//!   "cls_gemma_2b": { "kind": "hidden_state", "base_model": "google/gemma-2-2b" }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ExtractError, Result};
use crate::hooks::HookPoint;
use crate::sae::{L0_PLACEHOLDER, LAYER_PLACEHOLDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    /// Sparse auto-encoder on intermediate layers (multi-layer).
    Sae,
    /// Final hidden states of the base model (single-layer).
    HiddenState,
}

/// Everything needed to build one encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderRecord {
    pub kind: EncoderKind,
    /// HuggingFace id of the decoder model.
    pub base_model: String,
    /// SAE weights: HuggingFace repository or local directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Path of one layer's weights inside `checkpoint`, with `{layer}` and
    /// optionally `{l0}` (resolved to the canonical sparsity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<String>,
    /// Latent width of the SAE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_dim: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<usize>,
    #[serde(default)]
    pub hook_point: HookPoint,
}

impl EncoderRecord {
    fn sae(base_model: &str, checkpoint: &str, width: &str, feature_dim: usize, layers: &[usize]) -> Self {
        Self {
            kind: EncoderKind::Sae,
            base_model: base_model.to_string(),
            checkpoint: Some(checkpoint.to_string()),
            checkpoint_path: Some(format!(
                "layer_{LAYER_PLACEHOLDER}/width_{width}/average_l0_{L0_PLACEHOLDER}/params.npz"
            )),
            feature_dim: Some(feature_dim),
            layers: layers.to_vec(),
            hook_point: HookPoint::ResidualPost,
        }
    }

    fn hidden_state(base_model: &str) -> Self {
        Self {
            kind: EncoderKind::HiddenState,
            base_model: base_model.to_string(),
            checkpoint: None,
            checkpoint_path: None,
            feature_dim: None,
            layers: Vec::new(),
            hook_point: HookPoint::default(),
        }
    }

    fn validate(&self, id: &str) -> Result<()> {
        if self.base_model.is_empty() {
            return Err(ExtractError::config(format!("{id}: base_model is empty")));
        }
        match self.kind {
            EncoderKind::Sae => {
                if self.checkpoint.as_deref().map_or(true, str::is_empty) {
                    return Err(ExtractError::config(format!("{id}: SAE record needs a checkpoint")));
                }
                match self.checkpoint_path.as_deref() {
                    Some(path) if path.contains(LAYER_PLACEHOLDER) => {}
                    _ => {
                        return Err(ExtractError::config(format!(
                            "{id}: checkpoint_path must contain {LAYER_PLACEHOLDER}"
                        )))
                    }
                }
                if self.layers.is_empty() {
                    return Err(ExtractError::config(format!("{id}: SAE record lists no layers")));
                }
                let distinct: BTreeSet<usize> = self.layers.iter().copied().collect();
                if distinct.len() != self.layers.len() {
                    return Err(ExtractError::config(format!(
                        "{id}: duplicate layers in {:?}",
                        self.layers
                    )));
                }
            }
            EncoderKind::HiddenState => {
                if !self.layers.is_empty() {
                    return Err(ExtractError::config(format!(
                        "{id}: hidden-state records read the final layer and take no layer list"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Read-only map from encoder identifier to its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    records: BTreeMap<String, EncoderRecord>,
}

impl ModelRegistry {
    pub fn new(records: BTreeMap<String, EncoderRecord>) -> Result<Self> {
        for (id, record) in &records {
            record.validate(id)?;
        }
        Ok(Self { records })
    }

    /// Gemma Scope residual SAEs and the hidden-state baselines.
    pub fn builtin() -> Self {
        let records = [
            (
                "sae_2b",
                EncoderRecord::sae(
                    "google/gemma-2-2b",
                    "google/gemma-scope-2b-pt-res",
                    "16k",
                    16_384,
                    &[5, 12, 20],
                ),
            ),
            (
                "sae_9b_16k",
                EncoderRecord::sae(
                    "google/gemma-2-9b",
                    "google/gemma-scope-9b-pt-res",
                    "16k",
                    16_384,
                    &[9, 20, 31],
                ),
            ),
            (
                "sae_9b_131k",
                EncoderRecord::sae(
                    "google/gemma-2-9b",
                    "google/gemma-scope-9b-pt-res",
                    "131k",
                    131_072,
                    &[9, 20, 31],
                ),
            ),
            ("cls_gemma_2b", EncoderRecord::hidden_state("google/gemma-2-2b")),
            ("cls_gemma_9b", EncoderRecord::hidden_state("google/gemma-2-9b")),
            ("cls_qwen_4b", EncoderRecord::hidden_state("qwen/Qwen-4B")),
            (
                "cls_llama_3b",
                EncoderRecord::hidden_state("meta-llama/Llama-3-2.3b"),
            ),
        ]
        .into_iter()
        .map(|(id, record)| (id.to_string(), record))
        .collect();
        Self { records }
    }

    /// Load a registry from a JSON file, replacing the built-in table.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ExtractError::io(path, e))?;
        let records: BTreeMap<String, EncoderRecord> =
            serde_json::from_str(&text).map_err(|source| ExtractError::Json {
                path: path.to_path_buf(),
                line: source.line(),
                source,
            })?;
        info!("Loaded {} encoder records from {}", records.len(), path.display());
        Self::new(records)
    }

    /// Look up `id`, requiring the given kind.
    pub fn get(&self, id: &str, kind: EncoderKind) -> Result<&EncoderRecord> {
        let record = self.records.get(id).ok_or_else(|| {
            ExtractError::config(format!(
                "unknown encoder id '{id}' (known: {})",
                self.ids().collect::<Vec<_>>().join(", ")
            ))
        })?;
        if record.kind != kind {
            return Err(ExtractError::config(format!(
                "encoder '{id}' is {:?}, not {kind:?}",
                record.kind
            )));
        }
        Ok(record)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_records_are_valid() {
        let registry = ModelRegistry::builtin();
        let rebuilt = ModelRegistry::new(registry.records.clone()).unwrap();
        assert_eq!(rebuilt.len(), 7);

        let sae = registry.get("sae_9b_131k", EncoderKind::Sae).unwrap();
        assert_eq!(sae.base_model, "google/gemma-2-9b");
        assert_eq!(sae.feature_dim, Some(131_072));
        assert_eq!(sae.layers, vec![9, 20, 31]);
        assert_eq!(sae.hook_point, HookPoint::ResidualPost);

        assert_eq!(
            sae.checkpoint_path.as_deref(),
            Some("layer_{layer}/width_131k/average_l0_{l0}/params.npz")
        );

        let cls = registry.get("cls_llama_3b", EncoderKind::HiddenState).unwrap();
        assert_eq!(cls.base_model, "meta-llama/Llama-3-2.3b");
    }

    #[test]
    fn test_unknown_id_and_wrong_kind() {
        let registry = ModelRegistry::builtin();
        let err = registry.get("sae_27b", EncoderKind::Sae).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("sae_2b"));
        assert!(registry
            .get("cls_gemma_2b", EncoderKind::Sae)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_json_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "tiny": {{
                    "kind": "sae",
                    "base_model": "google/gemma-2-2b",
                    "checkpoint": "/data/saes",
                    "checkpoint_path": "layer_{{layer}}.safetensors",
                    "layers": [1, 2],
                    "hook_point": "mlp_out"
                }}
            }}"#
        )
        .unwrap();
        let registry = ModelRegistry::from_json_file(file.path()).unwrap();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["tiny"]);
        let record = registry.get("tiny", EncoderKind::Sae).unwrap();
        assert_eq!(record.hook_point, HookPoint::MlpOut);
        assert_eq!(record.feature_dim, None);
    }

    #[test]
    fn test_rejects_duplicate_layers() {
        let mut record = ModelRegistry::builtin()
            .get("sae_2b", EncoderKind::Sae)
            .unwrap()
            .clone();
        record.layers = vec![5, 5];
        let records = BTreeMap::from([("dup".to_string(), record)]);
        assert!(ModelRegistry::new(records).unwrap_err().is_configuration());
    }

    #[test]
    fn test_rejects_template_without_layer() {
        let mut record = ModelRegistry::builtin()
            .get("sae_2b", EncoderKind::Sae)
            .unwrap()
            .clone();
        record.checkpoint_path = Some("params.safetensors".to_string());
        let records = BTreeMap::from([("flat".to_string(), record)]);
        assert!(ModelRegistry::new(records).is_err());
    }
}
