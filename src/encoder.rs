//! Text to per-token activation arrays
//!
//! Two capabilities, dispatched explicitly by the pipeline:
//! - [`SingleLayerEncoder`]: one array per document (final hidden states)
//! - [`MultiLayerEncoder`]: one array per document and configured layer (SAE
//!   readouts of intermediate layers)
//!
//! Errors from tokenization or inference surface as [`ExtractError::Encoder`];
//! a text with no content tokens is [`ExtractError::MalformedInput`].

use candle_core::Tensor;
use tracing::{debug, info};

use crate::error::{ExtractError, Result};
use crate::hooks::HookPoint;
use crate::model::{FeatureModel, TokenizedText};
use crate::reduce::Statistic;
use crate::registry::{EncoderKind, EncoderRecord, ModelRegistry};
use crate::sae::{JumpReluSae, SaeReadout};

/// Encoder invoked once per document.
pub trait SingleLayerEncoder {
    /// Statistics the reducer computes for this encoder's output.
    fn statistics(&self) -> &[Statistic];
    /// Width of each activation vector, when known up front.
    fn feature_dim(&self) -> Option<usize>;
    /// Activations `[seq_len, feature_dim]`.
    fn encode(&mut self, text: &str) -> Result<Tensor>;
}

/// Encoder invoked once per document and configured layer.
pub trait MultiLayerEncoder {
    fn statistics(&self) -> &[Statistic];
    /// Configured layers, in pass order.
    fn layers(&self) -> &[usize];
    fn feature_dim(&self, layer: usize) -> Option<usize>;
    /// Activations `[seq_len, feature_dim]` for `layer`.
    fn encode(&mut self, text: &str, layer: usize) -> Result<Tensor>;
}

/// An encoder of either shape.
pub enum Encoder {
    SingleLayer(Box<dyn SingleLayerEncoder>),
    MultiLayer(Box<dyn MultiLayerEncoder>),
}

impl Encoder {
    pub fn statistics(&self) -> &[Statistic] {
        match self {
            Encoder::SingleLayer(encoder) => encoder.statistics(),
            Encoder::MultiLayer(encoder) => encoder.statistics(),
        }
    }

    /// `None` for a single-layer encoder (one pass, no layer suffix).
    pub fn passes(&self) -> Vec<Option<usize>> {
        match self {
            Encoder::SingleLayer(_) => vec![None],
            Encoder::MultiLayer(encoder) => encoder.layers().iter().copied().map(Some).collect(),
        }
    }

    /// Build the encoder registered under `id`.
    pub fn from_registry(
        registry: &ModelRegistry,
        id: &str,
        kind: EncoderKind,
        options: &EncoderOptions,
    ) -> Result<Self> {
        let record = registry.get(id, kind)?;
        info!("Building {:?} encoder '{}' on {}", kind, id, record.base_model);
        Ok(match kind {
            EncoderKind::Sae => Encoder::MultiLayer(Box::new(SaeEncoder::new(record, options)?)),
            EncoderKind::HiddenState => {
                Encoder::SingleLayer(Box::new(HiddenStateEncoder::new(record, options)?))
            }
        })
    }
}

/// Runtime knobs shared by the concrete encoders.
#[derive(Debug, Clone, Default)]
pub struct EncoderOptions {
    pub force_cpu: bool,
    /// Token limit per document (BOS included); defaults to the model's.
    pub max_tokens: Option<usize>,
    pub readout: SaeReadout,
}

fn load_model(record: &EncoderRecord, options: &EncoderOptions) -> Result<FeatureModel> {
    let model = FeatureModel::from_pretrained(&record.base_model, options.force_cpu)
        .map_err(ExtractError::Encoder)?;
    Ok(model.with_max_tokens(options.max_tokens))
}

fn tokenize(model: &FeatureModel, text: &str) -> Result<TokenizedText> {
    let tokens = model.tokenize(text).map_err(ExtractError::Encoder)?;
    if tokens.content_tokens == 0 {
        return Err(ExtractError::malformed(format!(
            "no content tokens ({} special)",
            tokens.ids.len()
        )));
    }
    if tokens.truncated {
        debug!("Document truncated to {} tokens", tokens.ids.len());
    }
    Ok(tokens)
}

/// Final hidden states of the base model, reduced to `{cls, mean}`.
pub struct HiddenStateEncoder {
    model: FeatureModel,
}

impl HiddenStateEncoder {
    const STATISTICS: [Statistic; 2] = [Statistic::Mean, Statistic::Cls];

    pub fn new(record: &EncoderRecord, options: &EncoderOptions) -> Result<Self> {
        Ok(Self::from_model(load_model(record, options)?))
    }

    pub fn from_model(model: FeatureModel) -> Self {
        Self { model }
    }
}

impl SingleLayerEncoder for HiddenStateEncoder {
    fn statistics(&self) -> &[Statistic] {
        &Self::STATISTICS
    }

    fn feature_dim(&self) -> Option<usize> {
        Some(self.model.d_model())
    }

    fn encode(&mut self, text: &str) -> Result<Tensor> {
        let tokens = tokenize(&self.model, text)?;
        self.model
            .hidden_states(&tokens)
            .map_err(ExtractError::Encoder)
    }
}

/// JumpReLU SAE readout of hooked intermediate layers, reduced to
/// `{sum, mean, max, last}`.
pub struct SaeEncoder {
    model: FeatureModel,
    sae: JumpReluSae,
    layers: Vec<usize>,
    hook_point: HookPoint,
    readout: SaeReadout,
    latent_dim: Option<usize>,
}

impl SaeEncoder {
    const STATISTICS: [Statistic; 4] = [
        Statistic::Sum,
        Statistic::Mean,
        Statistic::Max,
        Statistic::Last,
    ];

    pub fn new(record: &EncoderRecord, options: &EncoderOptions) -> Result<Self> {
        let (Some(checkpoint), Some(template)) = (&record.checkpoint, &record.checkpoint_path)
        else {
            return Err(ExtractError::config(format!(
                "SAE encoder on {} needs checkpoint and checkpoint_path",
                record.base_model
            )));
        };
        let model = load_model(record, options)?;
        let sae = JumpReluSae::new(checkpoint, template, model.device());
        Self::from_parts(model, sae, record, options.readout)
    }

    /// Assemble from an already loaded model; checks layers against it.
    pub fn from_parts(
        model: FeatureModel,
        sae: JumpReluSae,
        record: &EncoderRecord,
        readout: SaeReadout,
    ) -> Result<Self> {
        let n_layers = model.n_layers();
        if let Some(&bad) = record.layers.iter().find(|&&l| l >= n_layers) {
            return Err(ExtractError::config(format!(
                "layer {bad} out of range for {} ({n_layers} layers)",
                record.base_model
            )));
        }
        Ok(Self {
            model,
            sae,
            layers: record.layers.clone(),
            hook_point: record.hook_point,
            readout,
            latent_dim: record.feature_dim,
        })
    }
}

impl MultiLayerEncoder for SaeEncoder {
    fn statistics(&self) -> &[Statistic] {
        &Self::STATISTICS
    }

    fn layers(&self) -> &[usize] {
        &self.layers
    }

    fn feature_dim(&self, _layer: usize) -> Option<usize> {
        match self.readout {
            SaeReadout::Reconstruction => Some(self.model.d_model()),
            SaeReadout::Latents => self.latent_dim.or_else(|| self.sae.d_sae()),
        }
    }

    fn encode(&mut self, text: &str, layer: usize) -> Result<Tensor> {
        if !self.layers.contains(&layer) {
            return Err(ExtractError::config(format!(
                "layer {layer} is not configured (layers: {:?})",
                self.layers
            )));
        }
        let tokens = tokenize(&self.model, text)?;
        let acts = self
            .model
            .layer_activations(&tokens, layer, self.hook_point)
            .map_err(ExtractError::Encoder)?;
        self.sae.load_layer(layer).map_err(ExtractError::Encoder)?;
        self.sae
            .forward(&acts, layer, self.readout)
            .map_err(ExtractError::Encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Model-backed encoders need downloaded weights; see tests/integration.rs
    // for the ignored end-to-end checks.

    struct Fixed;

    impl SingleLayerEncoder for Fixed {
        fn statistics(&self) -> &[Statistic] {
            &HiddenStateEncoder::STATISTICS
        }
        fn feature_dim(&self) -> Option<usize> {
            Some(2)
        }
        fn encode(&mut self, _text: &str) -> Result<Tensor> {
            Ok(Tensor::zeros((1, 2), candle_core::DType::F32, &candle_core::Device::Cpu)?)
        }
    }

    #[test]
    fn test_single_layer_has_one_unsuffixed_pass() {
        let encoder = Encoder::SingleLayer(Box::new(Fixed));
        assert_eq!(encoder.passes(), vec![None]);
        assert_eq!(encoder.statistics(), &[Statistic::Mean, Statistic::Cls]);
    }

    #[test]
    fn test_unknown_registry_id_fails_before_loading() {
        let err = Encoder::from_registry(
            &ModelRegistry::builtin(),
            "sae_70b",
            EncoderKind::Sae,
            &EncoderOptions::default(),
        )
        .err()
        .unwrap();
        assert!(err.is_configuration());
    }
}
