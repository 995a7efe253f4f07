//! Gemma 2 forward pass with layer hooks
//!
//! Implementation for Gemma 2 (google/gemma-2-2b, google/gemma-2-9b):
//! - Alternating sliding window / global attention per layer
//! - Attention logit soft-capping
//! - Four-norm decoder layers (pre/post attention + pre/post MLP)
//! - GQA with explicit head_dim (not derived from hidden_size/num_heads)
//!
//! Only the residual stream is produced; there is no LM head since features
//! are read from hidden states, never from logits.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::info;

use crate::hooks::{HookPoint, HookRegistry};
use crate::masks::causal_mask;
use crate::model::{ActivationBackend, HubCheckpoint};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Gemma 2 model configuration (matches HuggingFace config.json).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gemma2Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub head_dim: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
    #[serde(default = "default_query_pre_attn_scalar")]
    pub query_pre_attn_scalar: usize,
    #[serde(default)]
    pub sliding_window: Option<usize>,
}

fn default_rope_theta() -> f64 {
    10000.0
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_max_position_embeddings() -> usize {
    8192
}
fn default_query_pre_attn_scalar() -> usize {
    256
}

// ---------------------------------------------------------------------------
// RmsNorm (Gemma-style: weight + 1.0)
// ---------------------------------------------------------------------------

struct GemmaRmsNorm {
    weight: Tensor,
    eps: f64,
}

impl GemmaRmsNorm {
    fn load(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(dim, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let internal_dtype = match x_dtype {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };
        let hidden_size = x.dim(D::Minus1)?;
        let x = x.to_dtype(internal_dtype)?;
        let norm_x = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
        let x_normed = x.broadcast_div(&(norm_x + self.eps)?.sqrt()?)?;
        // Scale in f32, then cast back.
        let weight_plus_one = (&self.weight.to_dtype(internal_dtype)? + 1.0)?;
        Ok(x_normed.broadcast_mul(&weight_plus_one)?.to_dtype(x_dtype)?)
    }
}

// ---------------------------------------------------------------------------
// Rotary Embedding
// ---------------------------------------------------------------------------

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0f32 / (rope_theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    n_rep: usize,
    head_dim: usize,
    attn_logit_softcapping: Option<f64>,
    scale: f64,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim;
        let hidden_size = config.hidden_size;

        let q_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            n_rep: num_heads / num_kv_heads,
            head_dim,
            attn_logit_softcapping: config.attn_logit_softcapping,
            scale: 1.0 / (config.query_pre_attn_scalar as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let k = repeat_kv(k, self.n_rep)?.contiguous()?;
        let v = repeat_kv(v, self.n_rep)?.contiguous()?;
        let q = q.contiguous()?;

        let mut attn_weights = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        if let Some(sc) = self.attn_logit_softcapping {
            attn_weights = ((attn_weights / sc)?.tanh()? * sc)?;
        }
        attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights.matmul(&v)?;
        let attn_output = attn_output.transpose(1, 2)?.reshape((b_sz, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

/// Expand KV heads for GQA.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((b, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

// ---------------------------------------------------------------------------
// MLP (GeGLU with gelu_pytorch_tanh)
// ---------------------------------------------------------------------------

#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.gelu()?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

// ---------------------------------------------------------------------------
// Decoder Layer (4 norms: pre/post attention + pre/post MLP)
// ---------------------------------------------------------------------------

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: GemmaRmsNorm,
    post_attention_layernorm: GemmaRmsNorm,
    pre_feedforward_layernorm: GemmaRmsNorm,
    post_feedforward_layernorm: GemmaRmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let norm = |name: &str| GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp(name));
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: norm("input_layernorm")?,
            post_attention_layernorm: norm("post_attention_layernorm")?,
            pre_feedforward_layernorm: norm("pre_feedforward_layernorm")?,
            post_feedforward_layernorm: norm("post_feedforward_layernorm")?,
        })
    }

    /// Block forward; the raw MLP output is offered to `hooks` as
    /// [`HookPoint::MlpOut`].
    fn forward(
        &self,
        xs: &Tensor,
        rotary: &RotaryEmbedding,
        mask: &Tensor,
        layer_idx: usize,
        hooks: &HookRegistry,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attn.forward(&xs, rotary, mask)?;
        let xs = self.post_attention_layernorm.forward(&xs)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = self.pre_feedforward_layernorm.forward(&xs)?;
        let xs = self.mlp.forward(&xs)?;
        hooks.record(layer_idx, HookPoint::MlpOut, &xs.squeeze(0)?)?;
        let xs = self.post_feedforward_layernorm.forward(&xs)?;
        Ok((residual + xs)?)
    }
}

// ---------------------------------------------------------------------------
// Gemma2Decoder
// ---------------------------------------------------------------------------

/// Gemma 2 decoder stack (no LM head).
pub struct Gemma2Decoder {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: GemmaRmsNorm,
    rotary: RotaryEmbedding,
    config: Gemma2Config,
}

impl Gemma2Decoder {
    /// Load Gemma 2 from HuggingFace.
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading Gemma 2 from: {}", model_id);
        let checkpoint = HubCheckpoint::<Gemma2Config>::fetch(model_id)?;
        let config = checkpoint.config;

        info!(
            "Gemma 2 config: {} layers, hidden={}, heads={}, kv_heads={}, head_dim={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.head_dim,
        );
        info!(
            "  attn_softcap={:?}, sliding_window={:?}",
            config.attn_logit_softcapping, config.sliding_window
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
            GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;
        let rotary = RotaryEmbedding::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        info!("Gemma 2 loaded: {} layers", config.num_hidden_layers);
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            config,
        })
    }

    /// Even layers use the sliding window, odd layers attend globally.
    fn window_for_layer(&self, layer_idx: usize) -> Option<usize> {
        if layer_idx % 2 == 0 {
            self.config.sliding_window
        } else {
            None
        }
    }
}

impl ActivationBackend for Gemma2Decoder {
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
        let device = input_ids.device();
        let dtype = self.embed_tokens.embeddings().dtype();

        // Embedding with sqrt(hidden_size) scaling
        let normalizer = (self.config.hidden_size as f64).sqrt();
        let mut hidden = (self.embed_tokens.forward(input_ids)? * normalizer)?;

        for (i, layer) in self.layers.iter().enumerate() {
            let mask = causal_mask(seq_len, self.window_for_layer(i), device, dtype)?;
            hidden = layer.forward(&hidden, &self.rotary, &mask, i, hooks)?;
            hooks.record(i, HookPoint::ResidualPost, &hidden.squeeze(0)?)?;
            if hooks.has_capture() {
                return Ok(None);
            }
        }

        Ok(Some(self.norm.forward(&hidden)?.squeeze(0)?))
    }
}
