//! LLaMA-family forward pass with layer hooks
//!
//! Covers LLaMA 2/3 and Qwen2, which share the decoder layout:
//! - Pre-norm blocks with two RmsNorms
//! - SwiGLU MLP without bias
//! - GQA attention; Qwen2 has bias on the Q/K/V projections, LLaMA has none
//! - Optional LLaMA 3 rope frequency scaling

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use tracing::info;

use crate::hooks::{HookPoint, HookRegistry};
use crate::masks::causal_mask;
use crate::model::{ActivationBackend, HubCheckpoint};

/// Model configuration (matches HuggingFace config.json for LLaMA and Qwen2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    /// Absent from Qwen2 configs, whose Q/K/V projections always carry bias.
    #[serde(default)]
    pub attention_bias: Option<bool>,
    #[serde(default)]
    pub model_type: Option<String>,
}

/// LLaMA 3 style frequency scaling.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RopeScaling {
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
    #[serde(default)]
    pub rope_type: Option<String>,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

impl LlamaConfig {
    fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    fn qkv_bias(&self) -> bool {
        self.attention_bias
            .unwrap_or_else(|| self.model_type.as_deref() == Some("qwen2"))
    }
}

/// Inverse rotary frequencies, with LLaMA 3 scaling applied when configured.
fn inv_frequencies(head_dim: usize, theta: f64, scaling: Option<&RopeScaling>) -> Vec<f32> {
    let base = (0..head_dim)
        .step_by(2)
        .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64));
    let Some(scaling) = scaling.filter(|s| s.rope_type.as_deref().unwrap_or("llama3") == "llama3")
    else {
        return base.map(|f| f as f32).collect();
    };

    let orig = scaling.original_max_position_embeddings as f64;
    let low_freq_wavelen = orig / scaling.low_freq_factor;
    let high_freq_wavelen = orig / scaling.high_freq_factor;
    base.map(|freq| {
        let wavelen = 2.0 * std::f64::consts::PI / freq;
        let scaled = if wavelen < high_freq_wavelen {
            freq
        } else if wavelen > low_freq_wavelen {
            freq / scaling.factor
        } else {
            let smooth = (orig / wavelen - scaling.low_freq_factor)
                / (scaling.high_freq_factor - scaling.low_freq_factor);
            (1.0 - smooth) * freq / scaling.factor + smooth * freq
        };
        scaled as f32
    })
    .collect()
}

/// Rotary Position Embeddings (RoPE, half-rotation layout)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, device: &Device, dtype: DType) -> Result<Self> {
        let inv_freq = inv_frequencies(
            config.head_dim(),
            config.rope_theta,
            config.rope_scaling.as_ref(),
        );
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let max_seq_len = config.max_position_embeddings;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;

        // [seq_len, dim/2]
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

/// Multi-head attention with grouped KV heads
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let bias = config.qkv_bias();
        let q_proj = linear_b(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            bias,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_b(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            bias,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_b(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            bias,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_no_bias(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            vb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;
        let q = q.contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?)? / scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((b, n_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((b, n_kv_heads * n_rep, seq_len, head_dim))?)
}

/// MLP block (SwiGLU, no bias)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Single decoder layer
struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: &Tensor,
        layer_idx: usize,
        hooks: &HookRegistry,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary, mask)?;
        let x = (x + residual)?;

        let residual = &x;
        let mlp_out = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&x)?)?;
        hooks.record(layer_idx, HookPoint::MlpOut, &mlp_out.squeeze(0)?)?;
        Ok((mlp_out + residual)?)
    }
}

/// LLaMA / Qwen2 decoder stack (no LM head).
pub struct LlamaDecoder {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
}

impl LlamaDecoder {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading LLaMA-family decoder from: {}", model_id);
        let checkpoint = HubCheckpoint::<LlamaConfig>::fetch(model_id)?;
        let config = checkpoint.config;

        info!(
            "Model config: {} layers, {} hidden, {} heads ({} kv), qkv_bias={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.qkv_bias()
        );

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&checkpoint.weights, dtype, device)? };
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), &config)?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;
        let rotary = RotaryEmbedding::new(&config, device, dtype)?;

        info!("Model loaded with {} layers", config.num_hidden_layers);
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            config,
        })
    }
}

impl ActivationBackend for LlamaDecoder {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn forward_hooked(&self, input_ids: &Tensor, hooks: &HookRegistry) -> Result<Option<Tensor>> {
        let seq_len = input_ids.dim(1)?;
        let mut hidden = self.embed_tokens.forward(input_ids)?;
        let mask = causal_mask(seq_len, None, hidden.device(), hidden.dtype())?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rotary, &mask, i, hooks)?;
            hooks.record(i, HookPoint::ResidualPost, &hidden.squeeze(0)?)?;
            if hooks.has_capture() {
                return Ok(None);
            }
        }

        Ok(Some(self.norm.forward(&hidden)?.squeeze(0)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> LlamaConfig {
        serde_json::from_str(json).unwrap()
    }

    const BASE: &str = r#""hidden_size": 64, "intermediate_size": 128,
        "num_attention_heads": 4, "num_key_value_heads": 2,
        "num_hidden_layers": 2, "vocab_size": 100"#;

    #[test]
    fn test_qwen2_defaults_to_qkv_bias() {
        let qwen = config(&format!(r#"{{{BASE}, "model_type": "qwen2"}}"#));
        assert!(qwen.qkv_bias());
        let llama = config(&format!(
            r#"{{{BASE}, "model_type": "llama", "attention_bias": false}}"#
        ));
        assert!(!llama.qkv_bias());
        assert_eq!(llama.head_dim(), 16);
    }

    #[test]
    fn test_unscaled_frequencies() {
        let freqs = inv_frequencies(4, 10_000.0, None);
        assert_eq!(freqs.len(), 2);
        assert!((freqs[0] - 1.0).abs() < 1e-6);
        assert!((freqs[1] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_llama3_scaling_only_touches_low_frequencies() {
        let scaling = RopeScaling {
            factor: 8.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 8192,
            rope_type: Some("llama3".to_string()),
        };
        let plain = inv_frequencies(128, 500_000.0, None);
        let scaled = inv_frequencies(128, 500_000.0, Some(&scaling));
        // Highest frequency (short wavelength) unchanged, lowest divided by factor.
        assert_eq!(plain[0], scaled[0]);
        let last = plain.len() - 1;
        assert!((scaled[last] - plain[last] / 8.0).abs() < 1e-12);
    }
}
