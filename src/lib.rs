// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `first`/`flush`
#![allow(clippy::module_name_repetitions)] // ChunkWriter in chunk.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Method style pedantic:
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_pass_by_value)]

//! saefx: sparse auto-encoder feature extraction
//!
//! Streams transcripts through a decoder LLM, reads either a JumpReLU SAE on a
//! hooked intermediate layer or the final hidden states, reduces every
//! token sequence to fixed-size statistics, and persists them in paired
//! array/metadata chunks that can be read back as one feature matrix.
//!
//! ## Architecture
//!
//! - `encoder`: SingleLayer/MultiLayer encoder capabilities and their model-backed implementations
//! - `model`: Tokenizer + decoder wrapper with device selection and truncation
//! - `forward_gemma2`: Gemma 2 forward pass with a layer hook
//! - `forward_llama`: LLaMA / Qwen2 forward pass with a layer hook
//! - `hooks`: Single-slot activation hook with a drop guard
//! - `masks`: Causal (and sliding-window) attention masks
//! - `sae`: JumpReLU sparse auto-encoder, one layer resident at a time
//! - `registry`: Named encoder records
//! - `reduce`: Sequence → statistic vectors
//! - `batch`: In-memory accumulation and flush policy
//! - `chunk`: Crash-safe chunk files
//! - `pipeline`: Extraction driver
//! - `dataset`: Documents and metadata sources
//! - `store`: Aggregate chunk reader
//! - `probe`: Linear probing with linfa
//! - `error`: Error taxonomy

pub mod batch;
pub mod chunk;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod forward_gemma2;
pub mod forward_llama;
pub mod hooks;
pub mod masks;
pub mod model;
pub mod pipeline;
pub mod probe;
pub mod reduce;
pub mod registry;
pub mod sae;
pub mod store;

pub use batch::{Batch, BatchAccumulator, DEFAULT_FLUSH_EVERY};
pub use chunk::{ChunkKind, ChunkName, ChunkRecord, ChunkWriter};
pub use dataset::{DatasetSource, DocumentId, Documents, MetadataTable, TranscriptDataset, ID_COLUMN};
pub use encoder::{
    Encoder, EncoderOptions, HiddenStateEncoder, MultiLayerEncoder, SaeEncoder, SingleLayerEncoder,
};
pub use error::{ChunkRange, ExtractError, Result, RunError};
pub use forward_gemma2::Gemma2Decoder;
pub use forward_llama::LlamaDecoder;
pub use hooks::{HookPoint, HookRegistry, LayerHook};
pub use masks::causal_mask;
pub use model::{ActivationBackend, FeatureModel, ModelArchitecture, TokenizedText};
pub use pipeline::{run, MalformedPolicy, PipelineConfig, RunSummary};
pub use probe::{ProbeConfig, ProbeResults, ProbeTrainer};
pub use reduce::{Features, Reducer, Statistic};
pub use registry::{EncoderKind, EncoderRecord, ModelRegistry};
pub use sae::{JumpReluSae, SaeReadout};
pub use store::{FeatureSet, FeatureStore};
