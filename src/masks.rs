//! Attention masks shared by the decoder backends
//!
//! Documents arrive with a different length almost every time, so the cache
//! only holds masks for the most recent sequence length: the two variants a
//! Gemma 2 pass alternates between (global and sliding window) are built once
//! per document instead of once per layer.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type MaskKey = (Option<usize>, usize, DType);

#[derive(Default)]
struct MaskCache {
    seq_len: usize,
    masks: HashMap<MaskKey, Tensor>,
}

static MASK_CACHE: LazyLock<Mutex<MaskCache>> = LazyLock::new(|| Mutex::new(MaskCache::default()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`: `0.0` where position `i`
/// may attend to `j`, `-inf` elsewhere. With `window`, positions more than
/// `window` tokens back are masked too.
pub fn causal_mask(
    seq_len: usize,
    window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let key = (window, device_id(device), dtype);
    if let Ok(cache) = MASK_CACHE.lock() {
        if cache.seq_len == seq_len {
            if let Some(mask) = cache.masks.get(&key) {
                return Ok(mask.clone());
            }
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| {
                let too_far = window.is_some_and(|w| i.saturating_sub(j) > w);
                if j > i || too_far {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    if let Ok(mut cache) = MASK_CACHE.lock() {
        if cache.seq_len != seq_len {
            cache.seq_len = seq_len;
            cache.masks.clear();
        }
        cache.masks.insert(key, mask.clone());
    }
    Ok(mask)
}
