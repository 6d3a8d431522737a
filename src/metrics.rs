//! Streaming metric accumulators for training and evaluation.
//!
//! Every accumulator supports incremental batch-at-a-time updates, a
//! `result` read and a `reset`, so a full evaluation pass never needs the
//! dataset's raw predictions in memory (prediction export is handled
//! separately by the trainer). The [`MetricsRegistry`] owns one accumulator
//! set per dataset and is passed by reference into the step functions.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::config::{ReferralMode, SngpConfig};
use crate::error::SngpResult;

/// Running mean of scalar observations.
#[derive(Debug, Clone, Default)]
pub struct MeanMetric {
    sum: f64,
    count: f64,
}

impl MeanMetric {
    pub fn update(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1.0;
    }

    pub fn update_many(&mut self, values: &[f32]) {
        for v in values {
            self.sum += *v as f64;
        }
        self.count += values.len() as f64;
    }

    pub fn result(&self) -> f32 {
        if self.count == 0.0 {
            0.0
        } else {
            (self.sum / self.count) as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0.0;
    }
}

/// Plain classification accuracy over binary predictions.
#[derive(Debug, Clone, Default)]
pub struct AccuracyMetric {
    correct: f64,
    total: f64,
}

impl AccuracyMetric {
    pub fn update(&mut self, correct: &[bool]) {
        self.correct += correct.iter().filter(|c| **c).count() as f64;
        self.total += correct.len() as f64;
    }

    pub fn result(&self) -> f32 {
        if self.total == 0.0 {
            0.0
        } else {
            (self.correct / self.total) as f32
        }
    }

    pub fn reset(&mut self) {
        self.correct = 0.0;
        self.total = 0.0;
    }
}

/// Streaming Brier score: mean squared error between probabilities and
/// (possibly fractional) labels.
#[derive(Debug, Clone, Default)]
pub struct BrierMetric {
    sum_sq: f64,
    count: f64,
}

impl BrierMetric {
    pub fn update(&mut self, labels: &[f32], probs: &[f32]) {
        for (y, p) in labels.iter().zip(probs) {
            let d = (*p - *y) as f64;
            self.sum_sq += d * d;
        }
        self.count += labels.len() as f64;
    }

    pub fn result(&self) -> f32 {
        if self.count == 0.0 {
            0.0
        } else {
            (self.sum_sq / self.count) as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum_sq = 0.0;
        self.count = 0.0;
    }
}

/// Which curve a streaming [`AucMetric`] integrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AucCurve {
    Roc,
    Pr,
}

/// Threshold-binned streaming AUC (ROC or precision/recall).
///
/// Confusion counts are accumulated at a fixed grid of thresholds and the
/// curve is integrated by trapezoid at read time, so updates stream one
/// batch at a time.
#[derive(Debug, Clone)]
pub struct AucMetric {
    curve: AucCurve,
    thresholds: Vec<f64>,
    true_pos: Vec<f64>,
    false_pos: Vec<f64>,
    true_neg: Vec<f64>,
    false_neg: Vec<f64>,
}

impl AucMetric {
    pub fn new(curve: AucCurve, num_thresholds: usize) -> Self {
        let n = num_thresholds.max(3);
        // Grid over [0, 1] with guard thresholds just outside the range so
        // the curve endpoints (all-positive / all-negative) are included.
        let thresholds: Vec<f64> = (0..n)
            .map(|i| match i {
                0 => -1e-7,
                i if i == n - 1 => 1.0 + 1e-7,
                i => (i as f64) / (n as f64 - 1.0),
            })
            .collect();
        Self {
            curve,
            true_pos: vec![0.0; n],
            false_pos: vec![0.0; n],
            true_neg: vec![0.0; n],
            false_neg: vec![0.0; n],
            thresholds,
        }
    }

    /// Accumulate a batch of binary labels and probabilities.
    pub fn update(&mut self, labels: &[bool], probs: &[f32]) {
        for (y, p) in labels.iter().zip(probs) {
            let p = *p as f64;
            for (i, t) in self.thresholds.iter().enumerate() {
                let predicted_pos = p > *t;
                match (predicted_pos, *y) {
                    (true, true) => self.true_pos[i] += 1.0,
                    (true, false) => self.false_pos[i] += 1.0,
                    (false, true) => self.false_neg[i] += 1.0,
                    (false, false) => self.true_neg[i] += 1.0,
                }
            }
        }
    }

    pub fn result(&self) -> f32 {
        let n = self.thresholds.len();
        match self.curve {
            AucCurve::Roc => {
                let mut auc = 0.0f64;
                for i in 0..n - 1 {
                    let (x0, y0) = self.roc_point(i);
                    let (x1, y1) = self.roc_point(i + 1);
                    auc += (x0 - x1) * (y0 + y1) / 2.0;
                }
                auc as f32
            }
            AucCurve::Pr => {
                let mut auc = 0.0f64;
                for i in 0..n - 1 {
                    let (r0, p0) = self.pr_point(i);
                    let (r1, p1) = self.pr_point(i + 1);
                    auc += (r0 - r1) * (p0 + p1) / 2.0;
                }
                auc as f32
            }
        }
    }

    fn roc_point(&self, i: usize) -> (f64, f64) {
        let tpr = safe_div(self.true_pos[i], self.true_pos[i] + self.false_neg[i]);
        let fpr = safe_div(self.false_pos[i], self.false_pos[i] + self.true_neg[i]);
        (fpr, tpr)
    }

    fn pr_point(&self, i: usize) -> (f64, f64) {
        let recall = safe_div(self.true_pos[i], self.true_pos[i] + self.false_neg[i]);
        let precision = safe_div(self.true_pos[i], self.true_pos[i] + self.false_pos[i]);
        (recall, precision)
    }

    pub fn reset(&mut self) {
        for v in [
            &mut self.true_pos,
            &mut self.false_pos,
            &mut self.true_neg,
            &mut self.false_neg,
        ] {
            v.iter_mut().for_each(|x| *x = 0.0);
        }
    }
}

fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Expected Calibration Error over equal-width confidence bins.
///
/// Empty bins are excluded from the weighted average rather than counted as
/// zero error.
#[derive(Debug, Clone)]
pub struct EceMetric {
    counts: Vec<f64>,
    confidence_sums: Vec<f64>,
    correct_sums: Vec<f64>,
}

impl EceMetric {
    pub fn new(num_bins: usize) -> Self {
        Self {
            counts: vec![0.0; num_bins],
            confidence_sums: vec![0.0; num_bins],
            correct_sums: vec![0.0; num_bins],
        }
    }

    fn bin_index(&self, confidence: f32) -> usize {
        let b = self.counts.len();
        (((confidence as f64) * b as f64) as usize).min(b - 1)
    }

    /// Accumulate per-example prediction confidence and correctness.
    pub fn update(&mut self, confidence: &[f32], correct: &[bool]) {
        for (conf, ok) in confidence.iter().zip(correct) {
            let i = self.bin_index(*conf);
            self.counts[i] += 1.0;
            self.confidence_sums[i] += *conf as f64;
            self.correct_sums[i] += if *ok { 1.0 } else { 0.0 };
        }
    }

    pub fn result(&self) -> f32 {
        let total: f64 = self.counts.iter().sum();
        if total == 0.0 {
            return 0.0;
        }
        let mut ece = 0.0f64;
        for i in 0..self.counts.len() {
            if self.counts[i] == 0.0 {
                continue;
            }
            let mean_conf = self.confidence_sums[i] / self.counts[i];
            let mean_acc = self.correct_sums[i] / self.counts[i];
            ece += self.counts[i] / total * (mean_conf - mean_acc).abs();
        }
        ece as f32
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|x| *x = 0.0);
        self.confidence_sums.iter_mut().for_each(|x| *x = 0.0);
        self.correct_sums.iter_mut().for_each(|x| *x = 0.0);
    }
}

/// Accuracy under a simulated human-in-the-loop policy that defers the
/// most-uncertain `fraction` of examples to a perfect oracle.
///
/// Uncertainty ranking uses `1 - confidence`. Two referral scopes exist:
/// `PerBatch` sorts each update's batch exactly, `Global` accumulates a
/// confidence histogram and applies the fraction over the whole pass at
/// read time (with fractional deferral inside the boundary bin).
#[derive(Debug, Clone)]
pub struct OracleCollaborativeAccuracy {
    fraction: f64,
    mode: ReferralMode,
    // PerBatch state
    scored_correct: f64,
    scored_total: f64,
    // Global state: equal-width confidence bins
    bin_counts: Vec<f64>,
    bin_corrects: Vec<f64>,
}

impl OracleCollaborativeAccuracy {
    pub fn new(fraction: f64, mode: ReferralMode, num_bins: usize) -> Self {
        Self {
            fraction,
            mode,
            scored_correct: 0.0,
            scored_total: 0.0,
            bin_counts: vec![0.0; num_bins],
            bin_corrects: vec![0.0; num_bins],
        }
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn update(&mut self, confidence: &[f32], correct: &[bool]) {
        match self.mode {
            ReferralMode::PerBatch => self.update_per_batch(confidence, correct),
            ReferralMode::Global => self.update_global(confidence, correct),
        }
    }

    fn update_per_batch(&mut self, confidence: &[f32], correct: &[bool]) {
        let n = confidence.len();
        if n == 0 {
            return;
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| confidence[*a].total_cmp(&confidence[*b]));
        let referred = ((self.fraction * n as f64).floor() as usize).min(n);
        // Referred examples (lowest confidence) are scored by the oracle
        // and therefore always correct.
        let mut batch_correct = referred as f64;
        for &i in &order[referred..] {
            if correct[i] {
                batch_correct += 1.0;
            }
        }
        self.scored_correct += batch_correct;
        self.scored_total += n as f64;
    }

    fn update_global(&mut self, confidence: &[f32], correct: &[bool]) {
        let b = self.bin_counts.len();
        for (conf, ok) in confidence.iter().zip(correct) {
            let i = (((*conf as f64) * b as f64) as usize).min(b - 1);
            self.bin_counts[i] += 1.0;
            self.bin_corrects[i] += if *ok { 1.0 } else { 0.0 };
        }
    }

    pub fn result(&self) -> f32 {
        match self.mode {
            ReferralMode::PerBatch => {
                if self.scored_total == 0.0 {
                    0.0
                } else {
                    (self.scored_correct / self.scored_total) as f32
                }
            }
            ReferralMode::Global => {
                let total: f64 = self.bin_counts.iter().sum();
                if total == 0.0 {
                    return 0.0;
                }
                let mut budget = (self.fraction * total).floor();
                let mut correct = 0.0f64;
                // Walk bins from least to most confident, deferring whole
                // bins while budget remains and splitting the boundary bin.
                for i in 0..self.bin_counts.len() {
                    let count = self.bin_counts[i];
                    if count == 0.0 {
                        continue;
                    }
                    if budget >= count {
                        correct += count; // fully referred, oracle-correct
                        budget -= count;
                    } else if budget > 0.0 {
                        let kept = count - budget;
                        correct += budget + self.bin_corrects[i] * kept / count;
                        budget = 0.0;
                    } else {
                        correct += self.bin_corrects[i];
                    }
                }
                (correct / total) as f32
            }
        }
    }

    pub fn reset(&mut self) {
        self.scored_correct = 0.0;
        self.scored_total = 0.0;
        self.bin_counts.iter_mut().for_each(|x| *x = 0.0);
        self.bin_corrects.iter_mut().for_each(|x| *x = 0.0);
    }
}

/// Negative log-likelihood under Monte-Carlo ensembling.
///
/// `ce` is the per-sample sigmoid cross-entropy, `[num_samples, batch]`.
/// Ensembling is a mixture in probability space:
/// `nll_i = -logsumexp_s(-ce[s][i]) + ln(num_samples)`, which reduces to the
/// plain cross-entropy when `num_samples == 1`.
pub fn mc_ensemble_nll(ce: &Tensor) -> SngpResult<Tensor> {
    let (num_samples, _batch) = ce.dims2()?;
    let neg = ce.neg()?;
    let max = neg.max_keepdim(0)?;
    let lse = (neg.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?.log()? + max)?;
    let nll = (lse.neg()? + (num_samples as f64).ln())?;
    Ok(nll.squeeze(0)?)
}

/// Derived per-example quantities shared by several accumulators.
pub struct BatchPredictions {
    /// Predicted confidence `max(p, 1-p)`
    pub confidence: Vec<f32>,
    /// Prediction correct against the thresholded label
    pub correct: Vec<bool>,
    /// Binary labels from the toxicity-score threshold
    pub binary_labels: Vec<bool>,
}

impl BatchPredictions {
    pub fn from_probs(labels: &[f32], probs: &[f32], label_threshold: f32) -> Self {
        let mut confidence = Vec::with_capacity(probs.len());
        let mut correct = Vec::with_capacity(probs.len());
        let mut binary_labels = Vec::with_capacity(probs.len());
        for (y, p) in labels.iter().zip(probs) {
            let label = *y > label_threshold;
            let pred = *p >= 0.5;
            confidence.push(p.max(1.0 - p));
            correct.push(pred == label);
            binary_labels.push(label);
        }
        Self {
            confidence,
            correct,
            binary_labels,
        }
    }
}

/// Training-pass accumulators.
pub struct TrainMetrics {
    pub loss: MeanMetric,
    pub negative_log_likelihood: MeanMetric,
    pub accuracy: AccuracyMetric,
    pub ece: EceMetric,
    label_threshold: f32,
}

impl TrainMetrics {
    pub fn new(num_bins: usize, label_threshold: f32) -> Self {
        Self {
            loss: MeanMetric::default(),
            negative_log_likelihood: MeanMetric::default(),
            accuracy: AccuracyMetric::default(),
            ece: EceMetric::new(num_bins),
            label_threshold,
        }
    }

    pub fn update(&mut self, labels: &[f32], probs: &[f32], loss: f32, nll: f32) {
        let preds = BatchPredictions::from_probs(labels, probs, self.label_threshold);
        self.loss.update(loss);
        self.negative_log_likelihood.update(nll);
        self.accuracy.update(&preds.correct);
        self.ece.update(&preds.confidence, &preds.correct);
    }

    pub fn finalize(&self) -> Vec<(String, f32)> {
        vec![
            ("train/loss".to_string(), self.loss.result()),
            (
                "train/negative_log_likelihood".to_string(),
                self.negative_log_likelihood.result(),
            ),
            ("train/accuracy".to_string(), self.accuracy.result()),
            ("train/ece".to_string(), self.ece.result()),
        ]
    }

    pub fn reset(&mut self) {
        self.loss.reset();
        self.negative_log_likelihood.reset();
        self.accuracy.reset();
        self.ece.reset();
    }
}

const AUC_THRESHOLDS: usize = 200;

/// Evaluation-pass accumulators for one dataset.
pub struct EvalMetrics {
    pub nll: MeanMetric,
    pub auroc: AucMetric,
    pub aupr: AucMetric,
    pub brier: BrierMetric,
    pub ece: EceMetric,
    pub stddev: MeanMetric,
    pub accuracy: AccuracyMetric,
    pub eval_time: MeanMetric,
    pub collab: Vec<OracleCollaborativeAccuracy>,
    label_threshold: f32,
}

impl EvalMetrics {
    pub fn new(config: &SngpConfig) -> Self {
        Self {
            nll: MeanMetric::default(),
            auroc: AucMetric::new(AucCurve::Roc, AUC_THRESHOLDS),
            aupr: AucMetric::new(AucCurve::Pr, AUC_THRESHOLDS),
            brier: BrierMetric::default(),
            ece: EceMetric::new(config.num_bins),
            stddev: MeanMetric::default(),
            accuracy: AccuracyMetric::default(),
            eval_time: MeanMetric::default(),
            collab: config
                .fractions
                .iter()
                .map(|f| {
                    OracleCollaborativeAccuracy::new(*f, config.referral_mode, config.num_bins)
                })
                .collect(),
            label_threshold: config.ece_label_threshold,
        }
    }

    /// Accumulate one evaluation batch.
    pub fn update(
        &mut self,
        labels: &[f32],
        probs: &[f32],
        nll: f32,
        stddev: &[f32],
        eval_seconds: f32,
    ) {
        let preds = BatchPredictions::from_probs(labels, probs, self.label_threshold);
        self.nll.update(nll);
        self.auroc.update(&preds.binary_labels, probs);
        self.aupr.update(&preds.binary_labels, probs);
        self.brier.update(labels, probs);
        self.ece.update(&preds.confidence, &preds.correct);
        self.stddev.update_many(stddev);
        self.accuracy.update(&preds.correct);
        self.eval_time.update(eval_seconds);
        for collab in &mut self.collab {
            collab.update(&preds.confidence, &preds.correct);
        }
    }

    /// Produce the named scalar results. The in-domain dataset keeps the
    /// bare metric names; other datasets are suffixed.
    pub fn finalize(&self, dataset: &str, in_domain: bool) -> Vec<(String, f32)> {
        let suffix = if in_domain {
            String::new()
        } else {
            format!("_{dataset}")
        };
        let mut out = vec![
            (format!("test/nll{suffix}"), self.nll.result()),
            (format!("test/auroc{suffix}"), self.auroc.result()),
            (format!("test/aupr{suffix}"), self.aupr.result()),
            (format!("test/brier{suffix}"), self.brier.result()),
            (format!("test/ece{suffix}"), self.ece.result()),
            (format!("test/eval_time{suffix}"), self.eval_time.result()),
            (format!("test/stddev{suffix}"), self.stddev.result()),
            (format!("test/acc{suffix}"), self.accuracy.result()),
        ];
        for collab in &self.collab {
            out.push((
                format!(
                    "test_collab_acc/collab_acc_{}{suffix}",
                    collab.fraction()
                ),
                collab.result(),
            ));
        }
        out
    }

    pub fn reset(&mut self) {
        self.nll.reset();
        self.auroc.reset();
        self.aupr.reset();
        self.brier.reset();
        self.ece.reset();
        self.stddev.reset();
        self.accuracy.reset();
        self.eval_time.reset();
        for collab in &mut self.collab {
            collab.reset();
        }
    }
}

/// One registry per run: training accumulators plus one evaluation set per
/// dataset, created on first use.
pub struct MetricsRegistry {
    config: SngpConfig,
    pub train: TrainMetrics,
    eval: BTreeMap<String, EvalMetrics>,
}

impl MetricsRegistry {
    pub fn new(config: &SngpConfig) -> Self {
        Self {
            config: config.clone(),
            train: TrainMetrics::new(config.num_bins, config.ece_label_threshold),
            eval: BTreeMap::new(),
        }
    }

    pub fn eval_mut(&mut self, dataset: &str) -> &mut EvalMetrics {
        if !self.eval.contains_key(dataset) {
            self.eval
                .insert(dataset.to_string(), EvalMetrics::new(&self.config));
        }
        self.eval.get_mut(dataset).unwrap()
    }

    pub fn reset_all(&mut self) {
        self.train.reset();
        for metrics in self.eval.values_mut() {
            metrics.reset();
        }
    }
}
