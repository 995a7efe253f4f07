//! JumpReLU sparse auto-encoder over residual-stream activations
//!
//! Weights are read per layer from a `.npz` archive (the Gemma Scope release
//! format) or a safetensors file, in either a HuggingFace repository or a
//! local directory. The file is located through a path template such as
//! `layer_{layer}/width_16k/average_l0_{l0}/params.npz`; `{l0}` picks the
//! published sparsity closest to an average L0 of 100, the canonical choice.
//! Only one layer is resident at a time (stream-and-free); loading another
//! layer drops the previous one first.
//!
//! ```text
//! Encode:  pre     = x @ W_enc + b_enc
//!          latents = pre * (pre > threshold)
//! Decode:  x_hat   = latents @ W_dec + b_dec
//! ```
//!
//! # Weight File Layout
//!
//! - `W_enc`: `[d_model, d_sae]`
//! - `b_enc`: `[d_sae]`
//! - `threshold`: `[d_sae]`
//! - `W_dec`: `[d_sae, d_model]`
//! - `b_dec`: `[d_model]`

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Placeholder substituted with the layer index in checkpoint path templates.
pub const LAYER_PLACEHOLDER: &str = "{layer}";
/// Placeholder resolved against the files that actually exist.
pub const L0_PLACEHOLDER: &str = "{l0}";
/// Average L0 of the canonical SAE for a layer and width.
pub const CANONICAL_L0: u32 = 100;

const WEIGHT_NAMES: [&str; 5] = ["W_enc", "b_enc", "threshold", "W_dec", "b_dec"];

/// Which SAE output becomes the per-token activation array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaeReadout {
    /// Decoder output, `[seq_len, d_model]`.
    #[default]
    Reconstruction,
    /// Sparse latent code, `[seq_len, d_sae]`.
    Latents,
}

impl fmt::Display for SaeReadout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SaeReadout::Reconstruction => "reconstruction",
            SaeReadout::Latents => "latents",
        })
    }
}

impl FromStr for SaeReadout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reconstruction" => Ok(SaeReadout::Reconstruction),
            "latents" => Ok(SaeReadout::Latents),
            other => anyhow::bail!("unknown SAE readout '{other}' (reconstruction or latents)"),
        }
    }
}

/// Weights of one layer's SAE, in F32 on the target device.
struct LoadedSae {
    layer: usize,
    w_enc: Tensor,
    b_enc: Tensor,
    threshold: Tensor,
    w_dec: Tensor,
    b_dec: Tensor,
}

impl LoadedSae {
    fn from_file(path: &Path, layer: usize, device: &Device) -> Result<Self> {
        if path.extension().is_some_and(|ext| ext == "npz") {
            Self::from_npz(path, layer, device)
        } else {
            Self::from_safetensors(path, layer, device)
        }
    }

    fn from_npz(path: &Path, layer: usize, device: &Device) -> Result<Self> {
        let arrays = Tensor::read_npz_by_name(path, &WEIGHT_NAMES)
            .with_context(|| format!("Failed to read SAE weights {}", path.display()))?;
        let mut arrays = arrays
            .into_iter()
            .map(|t| t.to_device(device)?.to_dtype(DType::F32))
            .collect::<candle_core::Result<Vec<_>>>()?
            .into_iter();
        let mut next = || arrays.next().context("npz archive returned too few arrays");
        Self::new(layer, next()?, next()?, next()?, next()?, next()?)
    }

    fn from_safetensors(path: &Path, layer: usize, device: &Device) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read SAE weights {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize SAE weights for layer {layer}"))?;
        let get = |name: &str| -> Result<Tensor> {
            let view = st
                .tensor(name)
                .with_context(|| format!("Tensor '{name}' not found in {}", path.display()))?;
            tensor_from_view(&view, device)?
                .to_dtype(DType::F32)
                .map_err(Into::into)
        };
        Self::new(
            layer,
            get("W_enc")?,
            get("b_enc")?,
            get("threshold")?,
            get("W_dec")?,
            get("b_dec")?,
        )
    }

    fn new(
        layer: usize,
        w_enc: Tensor,
        b_enc: Tensor,
        threshold: Tensor,
        w_dec: Tensor,
        b_dec: Tensor,
    ) -> Result<Self> {
        let (d_model, d_sae) = w_enc.dims2().context("W_enc must be 2-D")?;
        anyhow::ensure!(
            w_dec.dims() == [d_sae, d_model],
            "W_dec has shape {:?}, expected [{d_sae}, {d_model}]",
            w_dec.dims()
        );
        anyhow::ensure!(
            b_enc.dims() == [d_sae] && threshold.dims() == [d_sae],
            "b_enc/threshold must have shape [{d_sae}]"
        );
        anyhow::ensure!(b_dec.dims() == [d_model], "b_dec must have shape [{d_model}]");
        Ok(Self {
            layer,
            w_enc,
            b_enc,
            threshold,
            w_dec,
            b_dec,
        })
    }
}

/// Per-layer JumpReLU SAE family (one checkpoint per decoder layer).
pub struct JumpReluSae {
    checkpoint: String,
    path_template: String,
    device: Device,
    /// Currently loaded layer (stream-and-free: only one at a time)
    loaded: Option<LoadedSae>,
}

impl JumpReluSae {
    /// `checkpoint` is a HuggingFace repository id or a local directory.
    pub fn new(checkpoint: &str, path_template: &str, device: &Device) -> Self {
        Self {
            checkpoint: checkpoint.to_string(),
            path_template: path_template.to_string(),
            device: device.clone(),
            loaded: None,
        }
    }

    /// Relative path of the weight file for `layer`, still holding `{l0}`
    /// when the template has one.
    pub fn layer_path(&self, layer: usize) -> String {
        self.path_template
            .replace(LAYER_PLACEHOLDER, &layer.to_string())
    }

    /// Locate (and download when needed) the weight file for `layer`.
    pub fn resolve(&self, layer: usize) -> Result<PathBuf> {
        let pattern = self.layer_path(layer);
        let local = Path::new(&self.checkpoint);
        if local.is_dir() {
            let relative = if pattern.contains(L0_PLACEHOLDER) {
                let candidates = local_candidates(local, &pattern)?;
                closest_to_canonical(&pattern, candidates.iter().map(String::as_str))
                    .with_context(|| format!("No SAE weights match {pattern} in {}", local.display()))?
            } else {
                pattern
            };
            let path = local.join(&relative);
            anyhow::ensure!(path.is_file(), "SAE weights not found: {}", path.display());
            return Ok(path);
        }

        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(self.checkpoint.clone(), RepoType::Model));
        let relative = if pattern.contains(L0_PLACEHOLDER) {
            let info = repo
                .info()
                .with_context(|| format!("Failed to list files of {}", self.checkpoint))?;
            closest_to_canonical(&pattern, info.siblings.iter().map(|s| s.rfilename.as_str()))
                .with_context(|| format!("No SAE weights match {pattern} in {}", self.checkpoint))?
        } else {
            pattern
        };
        info!("Downloading {relative} from {}", self.checkpoint);
        repo.get(&relative)
            .with_context(|| format!("Failed to download {relative} from {}", self.checkpoint))
    }

    /// Load the SAE for `layer`, freeing any previously loaded layer first.
    pub fn load_layer(&mut self, layer: usize) -> Result<()> {
        if self.loaded_layer() == Some(layer) {
            return Ok(());
        }
        self.loaded = None;

        info!("Loading SAE for layer {layer}");
        let path = self.resolve(layer)?;
        let sae = LoadedSae::from_file(&path, layer, &self.device)?;
        info!(
            "SAE layer {layer}: d_model={}, d_sae={}",
            sae.b_dec.dim(0)?,
            sae.b_enc.dim(0)?
        );
        self.loaded = Some(sae);
        Ok(())
    }

    pub fn loaded_layer(&self) -> Option<usize> {
        self.loaded.as_ref().map(|sae| sae.layer)
    }

    /// Latent width of the loaded layer.
    pub fn d_sae(&self) -> Option<usize> {
        self.loaded.as_ref().map(|sae| sae.b_enc.dims()[0])
    }

    fn current(&self, layer: usize) -> Result<&LoadedSae> {
        let sae = self
            .loaded
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No SAE loaded. Call load_layer({layer}) first"))?;
        anyhow::ensure!(
            sae.layer == layer,
            "Loaded SAE is for layer {}, but layer {layer} was requested",
            sae.layer
        );
        Ok(sae)
    }

    /// Sparse latents `[seq_len, d_sae]` for activations `[seq_len, d_model]`.
    pub fn encode(&self, acts: &Tensor, layer: usize) -> Result<Tensor> {
        let sae = self.current(layer)?;
        let acts = acts.to_device(&self.device)?.to_dtype(DType::F32)?;
        let pre = acts.matmul(&sae.w_enc)?.broadcast_add(&sae.b_enc)?;
        let gate = pre.broadcast_gt(&sae.threshold)?.to_dtype(DType::F32)?;
        Ok((pre * gate)?)
    }

    /// Reconstruction `[seq_len, d_model]` from latents `[seq_len, d_sae]`.
    pub fn decode(&self, latents: &Tensor, layer: usize) -> Result<Tensor> {
        let sae = self.current(layer)?;
        Ok(latents.matmul(&sae.w_dec)?.broadcast_add(&sae.b_dec)?)
    }

    pub fn forward(&self, acts: &Tensor, layer: usize, readout: SaeReadout) -> Result<Tensor> {
        let latents = self.encode(acts, layer)?;
        match readout {
            SaeReadout::Latents => Ok(latents),
            SaeReadout::Reconstruction => self.decode(&latents, layer),
        }
    }
}

/// Pick the candidate matching `pattern` whose `{l0}` value is closest to
/// [`CANONICAL_L0`]; ties go to the sparser SAE.
pub fn closest_to_canonical<'a>(
    pattern: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    let (prefix, suffix) = pattern.split_once(L0_PLACEHOLDER)?;
    candidates
        .into_iter()
        .filter_map(|candidate| {
            let l0 = candidate
                .strip_prefix(prefix)?
                .strip_suffix(suffix)?
                .parse::<u32>()
                .ok()?;
            Some((l0.abs_diff(CANONICAL_L0), l0, candidate))
        })
        .min()
        .map(|(_, _, candidate)| candidate.to_string())
}

/// Relative paths under `root` that could match `pattern`: the entries of
/// the directory holding the `{l0}` component, completed with the rest of
/// the pattern.
fn local_candidates(root: &Path, pattern: &str) -> Result<Vec<String>> {
    let Some((prefix, suffix)) = pattern.split_once(L0_PLACEHOLDER) else {
        return Ok(vec![pattern.to_string()]);
    };
    let parent = prefix.rsplit_once('/').map_or("", |(parent, _)| parent);
    let rest = suffix.find('/').map_or("", |pos| &suffix[pos..]);
    let dir = root.join(parent);
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let relative = if parent.is_empty() {
            format!("{name}{rest}")
        } else {
            format!("{parent}/{name}{rest}")
        };
        if root.join(&relative).is_file() {
            candidates.push(relative);
        }
    }
    Ok(candidates)
}

/// Convert a safetensors view into a candle tensor (BF16/F16/F32 supported).
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported SAE tensor dtype: {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}
