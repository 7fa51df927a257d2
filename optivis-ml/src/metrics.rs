//! Evaluation metrics: classification report, confusion matrix, macro-F1,
//! AUROC and the binary threshold search used by outlier evaluation.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Per-class precision, recall and F1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: i64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragedMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Classification report over every label present in truth or prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AveragedMetrics,
    pub weighted_avg: AveragedMetrics,
    pub total: usize,
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

fn check_lengths(y_true: &[i64], y_pred: &[i64]) -> Result<(), MlError> {
    if y_true.len() != y_pred.len() {
        return Err(MlError::Evaluation(format!(
            "{} true labels but {} predictions",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(MlError::Evaluation("no samples to evaluate".into()));
    }
    Ok(())
}

fn label_union(y_true: &[i64], y_pred: &[i64]) -> Vec<i64> {
    let mut labels: Vec<i64> = y_true.iter().chain(y_pred).copied().collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

impl ClassificationReport {
    pub fn compute(y_true: &[i64], y_pred: &[i64]) -> Result<Self, MlError> {
        check_lengths(y_true, y_pred)?;
        let labels = label_union(y_true, y_pred);
        let total = y_true.len();

        let classes: Vec<ClassMetrics> = labels
            .iter()
            .map(|&label| {
                let mut tp = 0.0;
                let mut predicted = 0.0;
                let mut support = 0;
                for (t, p) in y_true.iter().zip(y_pred) {
                    if *p == label {
                        predicted += 1.0;
                        if *t == label {
                            tp += 1.0;
                        }
                    }
                    if *t == label {
                        support += 1;
                    }
                }
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support as f64);
                ClassMetrics {
                    label,
                    precision,
                    recall,
                    f1: ratio(2.0 * precision * recall, precision + recall),
                    support,
                }
            })
            .collect();

        let k = classes.len() as f64;
        let macro_avg = AveragedMetrics {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / k,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / k,
            f1: classes.iter().map(|c| c.f1).sum::<f64>() / k,
        };
        let weight = |c: &ClassMetrics| c.support as f64 / total as f64;
        let weighted_avg = AveragedMetrics {
            precision: classes.iter().map(|c| c.precision * weight(c)).sum(),
            recall: classes.iter().map(|c| c.recall * weight(c)).sum(),
            f1: classes.iter().map(|c| c.f1 * weight(c)).sum(),
        };
        let hits = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();

        Ok(Self {
            classes,
            accuracy: hits as f64 / total as f64,
            macro_avg,
            weighted_avg,
            total,
        })
    }

    pub fn macro_f1(&self) -> f64 {
        self.macro_avg.f1
    }

    /// Tabular text rendering; `name` maps labels to display names.
    pub fn render(&self, name: impl Fn(i64) -> String) -> String {
        let names: Vec<String> = self.classes.iter().map(|c| name(c.label)).collect();
        let width = names.iter().map(String::len).chain([12]).max().unwrap_or(12);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}\n",
            "", "precision", "recall", "f1-score", "support"
        );
        for (c, n) in self.classes.iter().zip(&names) {
            let _ = writeln!(
                out,
                "{n:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                c.precision, c.recall, c.f1, c.support
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.total
        );
        for (label, avg) in [("macro avg", self.macro_avg), ("weighted avg", self.weighted_avg)] {
            let _ = writeln!(
                out,
                "{label:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                avg.precision, avg.recall, avg.f1, self.total
            );
        }
        out
    }
}

/// Counts of true label (rows) against predicted label (columns).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<i64>,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn compute(y_true: &[i64], y_pred: &[i64]) -> Result<Self, MlError> {
        check_lengths(y_true, y_pred)?;
        let labels = label_union(y_true, y_pred);
        let index = |l: &i64| labels.partition_point(|x| x < l);
        let mut counts = vec![vec![0; labels.len()]; labels.len()];
        for (t, p) in y_true.iter().zip(y_pred) {
            counts[index(t)][index(p)] += 1;
        }
        Ok(Self { labels, counts })
    }

    pub fn render(&self, name: impl Fn(i64) -> String) -> String {
        let names: Vec<String> = self.labels.iter().map(|l| name(*l)).collect();
        let width = names.iter().map(String::len).chain([6]).max().unwrap_or(6);
        let mut out = format!("{:>width$}", "");
        for n in &names {
            let _ = write!(out, " {n:>width$}");
        }
        out.push('\n');
        for (n, row) in names.iter().zip(&self.counts) {
            let _ = write!(out, "{n:>width$}");
            for c in row {
                let _ = write!(out, " {c:>width$}");
            }
            out.push('\n');
        }
        out
    }
}

/// Unweighted mean of per-class F1 scores.
pub fn macro_f1(y_true: &[i64], y_pred: &[i64]) -> Result<f64, MlError> {
    Ok(ClassificationReport::compute(y_true, y_pred)?.macro_f1())
}

/// Area under the ROC curve for `positive` against every other label.
///
/// Computed as the normalised Mann-Whitney statistic; tied scores count
/// one half.
pub fn auroc(y_true: &[i64], scores: &[f64], positive: i64) -> Result<f64, MlError> {
    if y_true.len() != scores.len() {
        return Err(MlError::Evaluation(format!(
            "{} labels but {} scores",
            y_true.len(),
            scores.len()
        )));
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // Average ranks (1-based) over runs of tied scores.
    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &i in &order[start..=end] {
            ranks[i] = rank;
        }
        start = end + 1;
    }

    let n_pos = y_true.iter().filter(|y| **y == positive).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(MlError::Evaluation(
            "AUROC needs both positive and negative samples".into(),
        ));
    }
    let rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(y, _)| **y == positive)
        .map(|(_, r)| r)
        .sum();
    let u = rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Ok(u / (n_pos * n_neg) as f64)
}

/// Binary decision cut-off chosen on an evaluation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdChoice {
    /// Scores at or above this value are accepted as `accept_label`.
    pub threshold: f64,
    pub report: ClassificationReport,
}

/// Label assigned to each score under `threshold`.
pub fn apply_threshold(scores: &[f64], threshold: f64, accept: i64, reject: i64) -> Vec<i64> {
    scores
        .iter()
        .map(|s| if *s >= threshold { accept } else { reject })
        .collect()
}

/// Scan every distinct score as a cut-off and keep the one with the best
/// macro-F1 of the resulting binary decision. Ties keep the lowest cut-off.
pub fn best_threshold(
    y_true: &[i64],
    scores: &[f64],
    accept: i64,
    reject: i64,
) -> Result<ThresholdChoice, MlError> {
    if y_true.len() != scores.len() {
        return Err(MlError::Evaluation(format!(
            "{} labels but {} scores",
            y_true.len(),
            scores.len()
        )));
    }
    let mut candidates = scores.to_vec();
    candidates.sort_by(f64::total_cmp);
    candidates.dedup();

    let mut best: Option<ThresholdChoice> = None;
    for threshold in candidates {
        let predicted = apply_threshold(scores, threshold, accept, reject);
        let report = ClassificationReport::compute(y_true, &predicted)?;
        if best.as_ref().is_none_or(|b| report.macro_f1() > b.report.macro_f1()) {
            best = Some(ThresholdChoice { threshold, report });
        }
    }
    best.ok_or_else(|| MlError::Evaluation("no scores to threshold".into()))
}
