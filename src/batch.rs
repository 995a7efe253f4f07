//! In-memory accumulation of reduced vectors between flushes

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::dataset::DocumentId;
use crate::error::{ExtractError, Result};
use crate::reduce::{describe, Features, Statistic};

/// Default number of documents per chunk.
pub const DEFAULT_FLUSH_EVERY: usize = 100;

/// Feature vectors of consecutive documents, ready to be written as a chunk.
#[derive(Debug)]
pub struct Batch {
    ids: Vec<DocumentId>,
    vectors: BTreeMap<Statistic, Vec<Tensor>>,
}

impl Batch {
    pub fn ids(&self) -> &[DocumentId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn first_id(&self) -> Option<&DocumentId> {
        self.ids.first()
    }

    pub fn last_id(&self) -> Option<&DocumentId> {
        self.ids.last()
    }

    pub fn statistics(&self) -> impl Iterator<Item = Statistic> + '_ {
        self.vectors.keys().copied()
    }

    pub fn vectors(&self, stat: Statistic) -> Option<&[Tensor]> {
        self.vectors.get(&stat).map(Vec::as_slice)
    }

    /// Stack the vectors of one statistic into `[len, dim]`, in document order.
    ///
    /// # Panics
    /// If the vector count differs from the id count. `BatchAccumulator::add`
    /// keeps them equal, so a mismatch here is a bug.
    pub fn stack(&self, stat: Statistic) -> Result<Tensor> {
        let vectors = self
            .vectors
            .get(&stat)
            .ok_or_else(|| ExtractError::config(format!("batch has no '{stat}' vectors")))?;
        assert_eq!(
            vectors.len(),
            self.ids.len(),
            "batch invariant violated for '{stat}'"
        );
        Ok(Tensor::stack(vectors, 0)?)
    }
}

/// Collects reduced vectors until the flush threshold is reached.
///
/// The first `add` of a window fixes the statistic set and dimensions;
/// later calls must match them. Only [`BatchAccumulator::drain`] clears state.
#[derive(Debug)]
pub struct BatchAccumulator {
    flush_every: usize,
    ids: Vec<DocumentId>,
    vectors: BTreeMap<Statistic, Vec<Tensor>>,
    dims: BTreeMap<Statistic, usize>,
}

impl BatchAccumulator {
    pub fn new(flush_every: usize) -> Result<Self> {
        if flush_every == 0 {
            return Err(ExtractError::config("flush threshold must be positive"));
        }
        Ok(Self {
            flush_every,
            ids: Vec::with_capacity(flush_every),
            vectors: BTreeMap::new(),
            dims: BTreeMap::new(),
        })
    }

    pub fn flush_every(&self) -> usize {
        self.flush_every
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn add(&mut self, id: DocumentId, features: Features) -> Result<()> {
        let dims = features
            .iter()
            .map(|(&stat, vector)| Ok((stat, vector.dims1()?)))
            .collect::<Result<BTreeMap<Statistic, usize>>>()?;

        if self.ids.is_empty() {
            if dims.is_empty() {
                return Err(ExtractError::InconsistentStatistics {
                    expected: "at least one statistic".to_string(),
                    found: "{}".to_string(),
                });
            }
            self.dims = dims;
        } else if dims != self.dims {
            let expected_keys: Vec<Statistic> = self.dims.keys().copied().collect();
            let found_keys: Vec<Statistic> = dims.keys().copied().collect();
            let (expected, found) = if expected_keys == found_keys {
                (format!("{:?}", self.dims), format!("{dims:?}"))
            } else {
                (describe(expected_keys), describe(found_keys))
            };
            return Err(ExtractError::InconsistentStatistics { expected, found });
        }

        for (stat, vector) in features {
            self.vectors
                .entry(stat)
                .or_insert_with(|| Vec::with_capacity(self.flush_every))
                .push(vector);
        }
        self.ids.push(id);
        Ok(())
    }

    pub fn should_flush(&self) -> bool {
        self.ids.len() >= self.flush_every
    }

    /// Take the accumulated batch, leaving the accumulator empty.
    pub fn drain(&mut self) -> Option<Batch> {
        if self.ids.is_empty() {
            return None;
        }
        self.dims.clear();
        Some(Batch {
            ids: std::mem::replace(&mut self.ids, Vec::with_capacity(self.flush_every)),
            vectors: std::mem::take(&mut self.vectors),
        })
    }
}
