//! Sequence reduction: per-token activations to fixed-size summary vectors

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ExtractError, Result};

/// Summary statistic over the token axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Sum,
    Mean,
    Max,
    /// Last token position.
    Last,
    /// First token position.
    Cls,
}

impl Statistic {
    pub const ALL: [Statistic; 5] = [
        Statistic::Sum,
        Statistic::Mean,
        Statistic::Max,
        Statistic::Last,
        Statistic::Cls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Sum => "sum",
            Statistic::Mean => "mean",
            Statistic::Max => "max",
            Statistic::Last => "last",
            Statistic::Cls => "cls",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Statistic {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        Statistic::ALL
            .into_iter()
            .find(|stat| stat.as_str() == s)
            .ok_or_else(|| ExtractError::config(format!("unknown statistic '{s}'")))
    }
}

/// Statistics computed for one document, keyed by name.
pub type Features = BTreeMap<Statistic, Tensor>;

/// Render a statistic set as `{a, b}` for messages.
pub fn describe(stats: impl IntoIterator<Item = Statistic>) -> String {
    let names: Vec<&str> = stats.into_iter().map(|s| s.as_str()).collect();
    format!("{{{}}}", names.join(", "))
}

/// Collapses `[seq_len, dim]` activations into one `[dim]` vector per statistic.
///
/// The set of statistics is fixed at construction; every document gets all
/// of them. Output vectors are `f32` on the CPU.
#[derive(Debug, Clone)]
pub struct Reducer {
    statistics: Vec<Statistic>,
}

impl Reducer {
    pub fn new(statistics: impl IntoIterator<Item = Statistic>) -> Result<Self> {
        let mut statistics: Vec<Statistic> = statistics.into_iter().collect();
        statistics.sort();
        statistics.dedup();
        if statistics.is_empty() {
            return Err(ExtractError::config("reducer needs at least one statistic"));
        }
        Ok(Self { statistics })
    }

    /// `{sum, mean, max, last}`, used for sparse auto-encoder outputs.
    pub fn sae() -> Self {
        Self {
            statistics: vec![
                Statistic::Sum,
                Statistic::Mean,
                Statistic::Max,
                Statistic::Last,
            ],
        }
    }

    /// `{cls, mean}`, used for final hidden states.
    pub fn hidden_state() -> Self {
        Self {
            statistics: vec![Statistic::Mean, Statistic::Cls],
        }
    }

    pub fn statistics(&self) -> &[Statistic] {
        &self.statistics
    }

    pub fn reduce(&self, activations: &Tensor) -> Result<Features> {
        let dims = activations.dims();
        if dims.len() != 2 {
            return Err(ExtractError::malformed(format!(
                "expected [seq_len, dim] activations, got shape {dims:?}"
            )));
        }
        let (seq_len, dim) = (dims[0], dims[1]);
        if seq_len == 0 {
            return Err(ExtractError::malformed("empty token sequence"));
        }
        if dim == 0 {
            return Err(ExtractError::malformed("zero-width activations"));
        }

        let acts = activations.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let mut features = Features::new();
        for &stat in &self.statistics {
            let vector = match stat {
                Statistic::Sum => acts.sum(0)?,
                Statistic::Mean => acts.mean(0)?,
                Statistic::Max => acts.max(0)?,
                Statistic::Last => acts.i(seq_len - 1)?,
                Statistic::Cls => acts.i(0)?,
            };
            features.insert(stat, vector.contiguous()?);
        }
        Ok(features)
    }
}
