//! Scoped activation capture on one decoder layer
//!
//! A forward pass reports every block output to its [`HookRegistry`]; the
//! registry keeps only the tensor matching the attached `(layer, point)`.
//! Attachment is held by a [`LayerHook`] guard, and dropping the guard
//! detaches it, including when inference bails out with `?` halfway through.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Where in a decoder block the activation is read.
///
/// The default reads the residual stream, which is what residual SAEs were
/// trained on; pipelines that hooked the MLP output select [`HookPoint::MlpOut`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Residual stream after the whole block (input of the next block).
    #[default]
    ResidualPost,
    /// Output of the block's MLP, before it is added to the residual.
    MlpOut,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::ResidualPost => "residual_post",
            HookPoint::MlpOut => "mlp_out",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "residual_post" | "resid_post" | "residual" => Ok(HookPoint::ResidualPost),
            "mlp_out" | "mlp" => Ok(HookPoint::MlpOut),
            other => bail!("unknown hook point '{other}' (expected residual_post or mlp_out)"),
        }
    }
}

#[derive(Debug, Default)]
struct HookState {
    target: Option<(usize, HookPoint)>,
    captured: Option<Tensor>,
}

/// Per-model hook table. Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    state: Arc<Mutex<HookState>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HookState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("hook registry lock poisoned"))
    }

    /// Attach a hook on `layer` at `point`. Only one hook may be active.
    pub fn attach(&self, layer: usize, point: HookPoint) -> Result<LayerHook> {
        let mut state = self.lock()?;
        if let Some((active_layer, active_point)) = state.target {
            bail!(
                "a hook is already attached at layer {active_layer} ({active_point}); \
                 drop it before attaching layer {layer}"
            );
        }
        state.target = Some((layer, point));
        state.captured = None;
        Ok(LayerHook {
            registry: self.clone(),
            layer,
            point,
        })
    }

    pub fn target(&self) -> Option<(usize, HookPoint)> {
        self.lock().ok().and_then(|state| state.target)
    }

    pub fn is_attached(&self) -> bool {
        self.target().is_some()
    }

    /// Offer a block output to the registry. Returns `true` when it matched
    /// the attached hook, so the caller may stop the forward pass.
    pub fn record(&self, layer: usize, point: HookPoint, tensor: &Tensor) -> Result<bool> {
        let mut state = self.lock()?;
        if state.target != Some((layer, point)) {
            return Ok(false);
        }
        state.captured = Some(tensor.clone());
        Ok(true)
    }

    /// Whether the attached hook has already captured its activation.
    pub fn has_capture(&self) -> bool {
        self.lock().map(|state| state.captured.is_some()).unwrap_or(false)
    }

    fn take(&self) -> Option<Tensor> {
        self.lock().ok().and_then(|mut state| state.captured.take())
    }

    fn detach(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.target = None;
            state.captured = None;
        }
    }
}

/// Guard for an attached hook; detaches on drop.
#[derive(Debug)]
pub struct LayerHook {
    registry: HookRegistry,
    layer: usize,
    point: HookPoint,
}

impl LayerHook {
    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn point(&self) -> HookPoint {
        self.point
    }

    /// The captured activation, if the forward pass reached the hooked layer.
    pub fn take(&self) -> Option<Tensor> {
        self.registry.take()
    }
}

impl Drop for LayerHook {
    fn drop(&mut self) {
        self.registry.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn t(v: f32) -> Tensor {
        (Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap() * f64::from(v)).unwrap()
    }

    #[test]
    fn test_records_only_matching_layer_and_point() {
        let hooks = HookRegistry::new();
        let hook = hooks.attach(2, HookPoint::ResidualPost).unwrap();
        assert!(!hooks.record(1, HookPoint::ResidualPost, &t(1.0)).unwrap());
        assert!(!hooks.record(2, HookPoint::MlpOut, &t(2.0)).unwrap());
        assert!(hooks.record(2, HookPoint::ResidualPost, &t(3.0)).unwrap());
        let captured = hook.take().unwrap();
        assert_eq!(captured.to_vec2::<f32>().unwrap()[0], vec![3.0, 3.0, 3.0]);
        assert!(hook.take().is_none());
    }

    #[test]
    fn test_second_attach_is_rejected() {
        let hooks = HookRegistry::new();
        let _hook = hooks.attach(0, HookPoint::MlpOut).unwrap();
        assert!(hooks.attach(1, HookPoint::MlpOut).is_err());
    }

    #[test]
    fn test_drop_detaches() {
        let hooks = HookRegistry::new();
        {
            let _hook = hooks.attach(4, HookPoint::ResidualPost).unwrap();
            assert!(hooks.is_attached());
        }
        assert!(!hooks.is_attached());
        assert!(!hooks.record(4, HookPoint::ResidualPost, &t(1.0)).unwrap());
        hooks.attach(5, HookPoint::ResidualPost).unwrap();
    }

    #[test]
    fn test_detaches_on_early_return() {
        fn failing_pass(hooks: &HookRegistry) -> Result<Tensor> {
            let _hook = hooks.attach(3, HookPoint::ResidualPost)?;
            bail!("inference failed")
        }
        let hooks = HookRegistry::new();
        assert!(failing_pass(&hooks).is_err());
        assert!(!hooks.is_attached());
    }

    #[test]
    fn test_hook_point_parse() {
        assert_eq!("mlp".parse::<HookPoint>().unwrap(), HookPoint::MlpOut);
        assert_eq!(
            "residual_post".parse::<HookPoint>().unwrap(),
            HookPoint::ResidualPost
        );
        assert!("attn".parse::<HookPoint>().is_err());
        assert_eq!(HookPoint::default(), HookPoint::ResidualPost);
    }
}
