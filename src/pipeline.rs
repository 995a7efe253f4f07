//! Extraction driver: Encoder → Reducer → BatchAccumulator → ChunkWriter
//!
//! Documents are processed one at a time, in dataset order, once per pass
//! (one pass per configured layer, or a single pass for single-layer
//! encoders). Every pass owns a fresh accumulator, so a chunk never spans two
//! layers. Any failure stops the run: the in-flight batch is dropped and the
//! chunks already on disk stay valid.

use tracing::{debug, info, warn};

use crate::batch::{BatchAccumulator, DEFAULT_FLUSH_EVERY};
use crate::chunk::{ChunkRecord, ChunkWriter};
use crate::dataset::{DatasetSource, DocumentId, MetadataTable};
use crate::encoder::Encoder;
use crate::error::{ChunkRange, ExtractError, Result, RunError};
use crate::reduce::Reducer;

/// What to do with a document whose text yields no usable tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Stop the run.
    #[default]
    Halt,
    /// Log it, leave it out of every chunk, and continue.
    Skip,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Documents per chunk.
    pub flush_every: usize,
    pub malformed: MalformedPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_every: DEFAULT_FLUSH_EVERY,
            malformed: MalformedPolicy::Halt,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Chunks in the order they were written.
    pub chunks: Vec<ChunkRecord>,
    /// Documents encoded successfully, summed over passes.
    pub documents_processed: usize,
    /// Documents left out under [`MalformedPolicy::Skip`], with their pass.
    pub skipped: Vec<(Option<usize>, DocumentId)>,
}

/// Run `encoder` over every document of `dataset` and persist the reduced
/// vectors through `writer`.
///
/// Metadata is checked against the documents before the first encode call.
/// On failure the returned [`RunError`] names the last chunk that reached disk.
pub fn run(
    encoder: &mut Encoder,
    dataset: &dyn DatasetSource,
    config: &PipelineConfig,
    writer: &ChunkWriter,
) -> std::result::Result<RunSummary, RunError> {
    let mut driver = Driver {
        config,
        writer,
        summary: RunSummary::default(),
        last_flushed: None,
    };
    match driver.run(encoder, dataset) {
        Ok(()) => Ok(driver.summary),
        Err(source) => Err(RunError {
            last_flushed: driver.last_flushed,
            source,
        }),
    }
}

struct Driver<'a> {
    config: &'a PipelineConfig,
    writer: &'a ChunkWriter,
    summary: RunSummary,
    last_flushed: Option<ChunkRange>,
}

impl Driver<'_> {
    fn run(&mut self, encoder: &mut Encoder, dataset: &dyn DatasetSource) -> Result<()> {
        // Fail on bad configuration before loading anything heavy.
        BatchAccumulator::new(self.config.flush_every)?;
        let reducer = Reducer::new(encoder.statistics().iter().copied())?;

        let documents = dataset.load_documents()?;
        let metadata = dataset.load_metadata()?;
        metadata.validate(&documents)?;

        let passes = encoder.passes();
        info!(
            "Extracting {} documents, {} pass(es), statistics {:?}, flush every {}",
            documents.len(),
            passes.len(),
            reducer.statistics(),
            self.config.flush_every
        );

        for layer in passes {
            if let Some(layer) = layer {
                info!("Layer {layer}");
            }
            let mut acc = BatchAccumulator::new(self.config.flush_every)?;
            let mut chunk_index = 0;

            for (id, text) in documents.iter() {
                let features = encode(encoder, text, layer)
                    .and_then(|acts| reducer.reduce(&acts))
                    .map_err(|e| e.for_document(id));
                let features = match features {
                    Ok(features) => features,
                    Err(e) if e.is_malformed_input() && self.config.malformed == MalformedPolicy::Skip => {
                        warn!("Skipping: {e}");
                        self.summary.skipped.push((layer, id.clone()));
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                acc.add(id.clone(), features)?;
                self.summary.documents_processed += 1;
                debug!("Encoded {id} ({} in batch)", acc.len());

                if acc.should_flush() {
                    self.flush(&mut acc, layer, &mut chunk_index, &metadata)?;
                }
            }
            self.flush(&mut acc, layer, &mut chunk_index, &metadata)?;
        }

        info!(
            "Done: {} chunks, {} documents encoded, {} skipped",
            self.summary.chunks.len(),
            self.summary.documents_processed,
            self.summary.skipped.len()
        );
        Ok(())
    }

    fn flush(
        &mut self,
        acc: &mut BatchAccumulator,
        layer: Option<usize>,
        chunk_index: &mut usize,
        metadata: &MetadataTable,
    ) -> Result<()> {
        let Some(batch) = acc.drain() else {
            return Ok(());
        };
        let record = self.writer.write(&batch, layer, *chunk_index, metadata)?;
        *chunk_index += 1;
        self.last_flushed = Some(record.range.clone());
        self.summary.chunks.push(record);
        Ok(())
    }
}

fn encode(encoder: &mut Encoder, text: &str, layer: Option<usize>) -> Result<candle_core::Tensor> {
    match (encoder, layer) {
        (Encoder::SingleLayer(encoder), None) => encoder.encode(text),
        (Encoder::MultiLayer(encoder), Some(layer)) => encoder.encode(text, layer),
        (Encoder::SingleLayer(_), Some(layer)) => Err(ExtractError::config(format!(
            "single-layer encoder asked for layer {layer}"
        ))),
        (Encoder::MultiLayer(_), None) => Err(ExtractError::config(
            "multi-layer encoder needs a layer",
        )),
    }
}
