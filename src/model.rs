//! Model loading and hooked inference
//!
//! [`FeatureModel`] pairs a decoder backend with its tokenizer and a
//! [`HookRegistry`]. Backends implement [`ActivationBackend`]: one forward
//! pass over a single sequence that reports every block output to the hooks
//! and stops as soon as the attached hook has its activation.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::ApiRepo;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::de::DeserializeOwned;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::forward_gemma2::Gemma2Decoder;
use crate::forward_llama::LlamaDecoder;
use crate::hooks::{HookPoint, HookRegistry};

/// Supported decoder families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// Gemma 2 (Google)
    Gemma2,
    /// Qwen2 / Qwen2.5 (Alibaba): LLaMA layout with q/k/v bias
    Qwen2,
    /// LLaMA 2/3 (Meta)
    Llama,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("gemma") {
            ModelArchitecture::Gemma2
        } else if model_lower.contains("qwen") {
            ModelArchitecture::Qwen2
        } else if model_lower.contains("llama") {
            ModelArchitecture::Llama
        } else {
            info!(
                "Unknown model architecture for '{}', defaulting to LLaMA",
                model_id
            );
            ModelArchitecture::Llama
        }
    }
}

/// Decoder forward pass with hook reporting.
pub trait ActivationBackend: Send {
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    /// Longest sequence the rotary tables cover.
    fn max_positions(&self) -> usize;

    /// Run `input_ids` (`[1, seq_len]`) through the decoder.
    ///
    /// Every block offers its outputs to `hooks`. Once the attached hook has
    /// captured, the pass stops and returns `None`; otherwise the final
    /// normalised hidden states `[seq_len, d_model]` are returned.
    fn forward_hooked(&self, input_ids: &Tensor, hooks: &HookRegistry) -> Result<Option<Tensor>>;
}

/// Pick the device: CUDA in BF16 when available, CPU in F32 otherwise.
pub fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, DType::BF16)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// Safetensors index for sharded models.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Config plus weight files of a HuggingFace model repository.
pub(crate) struct HubCheckpoint<C> {
    pub config: C,
    pub weights: Vec<PathBuf>,
}

impl<C: DeserializeOwned> HubCheckpoint<C> {
    pub(crate) fn fetch(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: C = serde_json::from_str(&config_str)
            .with_context(|| format!("Invalid config.json for {model_id}"))?;

        let weights = weight_files(&repo)?;
        info!("Loading weights from {} file(s)...", weights.len());
        Ok(Self { config, weights })
    }
}

fn weight_files(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let Ok(index_path) = repo.get("model.safetensors.index.json") else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        return Ok(vec![path]);
    };
    info!("Model is sharded, loading index...");
    let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
    let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
    shard_names.sort();
    shard_names.dedup();
    info!("Downloading {} shard files...", shard_names.len());
    shard_names
        .iter()
        .map(|shard| {
            repo.get(shard)
                .with_context(|| format!("Failed to download {shard}"))
        })
        .collect()
}

/// Token ids of one document.
#[derive(Debug, Clone)]
pub struct TokenizedText {
    pub ids: Vec<u32>,
    /// Tokens that are not special (BOS, EOS, padding).
    pub content_tokens: usize,
    pub truncated: bool,
}

/// A decoder with tokenizer and hooks, loaded once per run.
pub struct FeatureModel {
    backend: Box<dyn ActivationBackend>,
    tokenizer: Tokenizer,
    hooks: HookRegistry,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
    max_tokens: usize,
}

impl FeatureModel {
    /// Load a model from HuggingFace (CUDA when available unless `force_cpu`).
    pub fn from_pretrained(model_id: &str, force_cpu: bool) -> Result<Self> {
        let architecture = ModelArchitecture::from_model_id(model_id);
        let (device, dtype) = select_device(force_cpu);

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}, dtype: {:?}", device, dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend: Box<dyn ActivationBackend> = match architecture {
            ModelArchitecture::Gemma2 => Box::new(Gemma2Decoder::load(model_id, &device, dtype)?),
            ModelArchitecture::Qwen2 | ModelArchitecture::Llama => {
                Box::new(LlamaDecoder::load(model_id, &device, dtype)?)
            }
        };
        let max_tokens = backend.max_positions();

        Ok(Self {
            backend,
            tokenizer,
            hooks: HookRegistry::new(),
            device,
            architecture,
            model_id: model_id.to_string(),
            max_tokens,
        })
    }

    /// Truncate documents to at most `max_tokens` tokens (BOS included).
    /// Never exceeds the backend's position limit.
    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        let limit = self.backend.max_positions();
        self.max_tokens = max_tokens.map_or(limit, |m| m.clamp(1, limit));
        self
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Tokenize with the model's special tokens (BOS) and truncate.
    pub fn tokenize(&self, text: &str) -> Result<TokenizedText> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let mut ids = encoding.get_ids().to_vec();
        let mut special = encoding.get_special_tokens_mask().to_vec();
        let truncated = ids.len() > self.max_tokens;
        if truncated {
            debug!("Truncating {} tokens to {}", ids.len(), self.max_tokens);
            ids.truncate(self.max_tokens);
            special.truncate(self.max_tokens);
        }
        let content_tokens = special.iter().filter(|&&s| s == 0).count();
        Ok(TokenizedText {
            ids,
            content_tokens,
            truncated,
        })
    }

    fn input_tensor(&self, tokens: &TokenizedText) -> Result<Tensor> {
        if tokens.ids.is_empty() {
            bail!("cannot run the model on an empty token sequence");
        }
        Ok(Tensor::new(tokens.ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Final-layer hidden states `[seq_len, d_model]` after the last norm.
    pub fn hidden_states(&self, tokens: &TokenizedText) -> Result<Tensor> {
        let input = self.input_tensor(tokens)?;
        self.backend
            .forward_hooked(&input, &self.hooks)?
            .context("forward pass stopped early although no hook was attached")
    }

    /// Activations `[seq_len, d_model]` of one decoder layer.
    pub fn layer_activations(
        &self,
        tokens: &TokenizedText,
        layer: usize,
        point: HookPoint,
    ) -> Result<Tensor> {
        let n_layers = self.n_layers();
        if layer >= n_layers {
            bail!("layer {layer} out of range for {} ({n_layers} layers)", self.model_id);
        }
        let input = self.input_tensor(tokens)?;
        let hook = self.hooks.attach(layer, point)?;
        self.backend.forward_hooked(&input, &self.hooks)?;
        hook.take()
            .with_context(|| format!("hook on layer {layer} ({point}) captured nothing"))
    }
}
