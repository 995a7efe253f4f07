//! Linear probing with linfa on extracted feature chunks
//!
//! Trains a logistic-regression probe on one statistic (and layer) of a chunk
//! directory, optionally keeping only the top-k columns by ANOVA F-score, and
//! reports positive-class probabilities for the held-out documents.

use anyhow::{bail, Context, Result};
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::dataset::DocumentId;
use crate::reduce::Statistic;
use crate::store::FeatureSet;

/// Probe training parameters.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub statistic: Statistic,
    pub layer: Option<usize>,
    /// Metadata column holding the binary label.
    pub label_column: String,
    /// Keep only the k best columns by ANOVA F-score.
    pub select_k: Option<usize>,
    /// Fraction of each class held out for evaluation.
    pub test_size: f64,
    pub seed: u64,
    pub max_iterations: u64,
    /// Scale columns to zero mean and unit variance using training statistics.
    pub standardize: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            statistic: Statistic::Mean,
            layer: None,
            label_column: "label".to_string(),
            select_k: None,
            test_size: 0.2,
            seed: 42,
            max_iterations: 1000,
            standardize: true,
        }
    }
}

/// Results from training and evaluating a probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResults {
    /// Classification accuracy on test set
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    /// Columns used after selection.
    pub n_features: usize,
    /// Held-out documents, aligned with `probabilities`.
    pub test_ids: Vec<DocumentId>,
    /// Probability of label 1 for each held-out document.
    pub probabilities: Vec<f64>,
}

impl ProbeResults {
    /// Precision with label 1 as the positive class
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

/// Trainer for linear probes
pub struct ProbeTrainer {
    config: ProbeConfig,
}

impl ProbeTrainer {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Split, select, fit and evaluate on one feature set.
    pub fn train_and_evaluate(&self, set: &FeatureSet) -> Result<ProbeResults> {
        let labels = set
            .labels(&self.config.label_column)
            .context("Failed to read probe labels")?;
        let x = set.features.mapv(f64::from);
        let (train_idx, test_idx) = stratified_split(&labels, self.config.test_size, self.config.seed)?;

        let mut train_x = x.select(Axis(0), &train_idx);
        let mut test_x = x.select(Axis(0), &test_idx);
        let train_y = labels.select(Axis(0), &train_idx);
        let test_y = labels.select(Axis(0), &test_idx);

        if let Some(k) = self.config.select_k {
            if k == 0 {
                bail!("select_k must be positive");
            }
            let columns = select_top_k(&anova_f_scores(&train_x, &train_y), k);
            debug!("Selected {} of {} columns", columns.len(), train_x.ncols());
            train_x = train_x.select(Axis(1), &columns);
            test_x = test_x.select(Axis(1), &columns);
        }
        if self.config.standardize {
            standardize(&mut train_x, &mut test_x);
        }

        info!(
            "Training probe: {} train / {} test samples, {} features",
            train_x.nrows(),
            test_x.nrows(),
            train_x.ncols()
        );

        let n_features = train_x.ncols();
        let train_dataset = Dataset::new(train_x, train_y);
        let model = LogisticRegression::default()
            .max_iterations(self.config.max_iterations)
            .fit(&train_dataset)
            .context("Failed to train logistic regression")?;

        let predictions = model.predict(&test_x);
        let raw = model.predict_probabilities(&test_x);
        let probabilities = probability_of_one(&raw, model.labels().pos.class == 1);

        let mut results = compute_metrics(&predictions, &test_y);
        results.n_features = n_features;
        results.test_ids = test_idx.iter().map(|&i| set.ids[i].clone()).collect();
        results.probabilities = probabilities;
        Ok(results)
    }
}

/// linfa reports the probability of its positive class, which is the more
/// frequent training label rather than label 1.
fn probability_of_one(raw: &Array1<f64>, positive_is_one: bool) -> Vec<f64> {
    raw.iter()
        .map(|&p| if positive_is_one { p } else { 1.0 - p })
        .collect()
}

fn compute_metrics(predictions: &Array1<usize>, labels: &Array1<usize>) -> ProbeResults {
    let (mut tp, mut tn, mut fp, mut r#fn) = (0, 0, 0, 0);
    for (pred, label) in predictions.iter().zip(labels.iter()) {
        match (*pred, *label) {
            (1, 1) => tp += 1,
            (0, 0) => tn += 1,
            (1, 0) => fp += 1,
            (0, 1) => r#fn += 1,
            _ => {}
        }
    }
    let correct = tp + tn;
    let total = predictions.len();
    ProbeResults {
        accuracy: ratio(correct, total),
        correct,
        total,
        true_positives: tp,
        true_negatives: tn,
        false_positives: fp,
        false_negatives: r#fn,
        n_features: 0,
        test_ids: Vec::new(),
        probabilities: Vec::new(),
    }
}

/// Seeded train/test split preserving class proportions.
///
/// Every class keeps at least one sample on each side, so each class needs
/// two or more samples. Returned indices are sorted.
pub fn stratified_split(
    labels: &Array1<usize>,
    test_size: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(test_size > 0.0 && test_size < 1.0) {
        bail!("test_size must be in (0, 1), got {test_size}");
    }
    let mut classes: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
    for (idx, &label) in labels.iter().enumerate() {
        classes.entry(label).or_default().push(idx);
    }
    if classes.len() < 2 {
        bail!("probe needs two classes, found {}", classes.len());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for (label, mut members) in classes {
        if members.len() < 2 {
            bail!("class {label} has a single sample");
        }
        members.shuffle(&mut rng);
        let n_test = ((members.len() as f64 * test_size).round() as usize).clamp(1, members.len() - 1);
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    Ok((train, test))
}

/// One-way ANOVA F-statistic of every column against the class labels.
///
/// Columns constant within every class score `+inf` when the class means
/// differ and `0` when the whole column is constant.
pub fn anova_f_scores(x: &Array2<f64>, y: &Array1<usize>) -> Vec<f64> {
    let n = x.nrows();
    let mut classes: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
    for (idx, &label) in y.iter().enumerate() {
        classes.entry(label).or_default().push(idx);
    }
    let k = classes.len();
    if k < 2 || n <= k {
        return vec![0.0; x.ncols()];
    }

    x.axis_iter(Axis(1))
        .map(|column| {
            let grand = column.mean().unwrap_or(0.0);
            let (mut between, mut within) = (0.0, 0.0);
            for members in classes.values() {
                let mean = members.iter().map(|&i| column[i]).sum::<f64>() / members.len() as f64;
                between += members.len() as f64 * (mean - grand).powi(2);
                within += members.iter().map(|&i| (column[i] - mean).powi(2)).sum::<f64>();
            }
            let between = between / (k - 1) as f64;
            let within = within / (n - k) as f64;
            match (between > 0.0, within > 0.0) {
                (_, true) => between / within,
                (true, false) => f64::INFINITY,
                (false, false) => 0.0,
            }
        })
        .collect()
}

/// Indices of the `k` highest scores, in column order.
pub fn select_top_k(scores: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k);
    order.sort_unstable();
    order
}

fn standardize(train: &mut Array2<f64>, test: &mut Array2<f64>) {
    let Some(mean) = train.mean_axis(Axis(0)) else {
        return;
    };
    let std = train.std_axis(Axis(0), 0.0).mapv(|s| if s > 0.0 { s } else { 1.0 });
    for mut row in train.rows_mut().into_iter().chain(test.rows_mut()) {
        row -= &mean;
        row /= &std;
    }
}
