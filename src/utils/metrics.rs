//! Metrics Module for Anomaly Scores
//!
//! Threshold fitting and ranking metrics over (score, is_anomalous) pairs:
//! - Adaptive threshold maximizing F1
//! - Area under the ROC curve
//! - F1 at a fixed threshold

use std::cmp::Ordering;

/// Outcome of an adaptive threshold search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdFit {
    /// Scores `>= threshold` are predicted anomalous
    pub threshold: f32,
    /// F1 reached at that threshold
    pub f1: f64,
}

fn descending(a: &f32, b: &f32) -> Ordering {
    b.partial_cmp(a).unwrap_or(Ordering::Equal)
}

/// Find the threshold that maximizes F1 over the given scores.
///
/// Every distinct score is a candidate. Returns `None` when there are no
/// anomalous samples, in which case F1 is undefined.
pub fn adaptive_f1_threshold(scores: &[f32], labels: &[bool]) -> Option<ThresholdFit> {
    assert_eq!(scores.len(), labels.len(), "scores and labels must have the same length");

    let positives = labels.iter().filter(|&&l| l).count();
    if positives == 0 {
        return None;
    }

    let mut pairs: Vec<(f32, bool)> = scores.iter().copied().zip(labels.iter().copied()).collect();
    pairs.sort_by(|a, b| descending(&a.0, &b.0));

    let mut best: Option<ThresholdFit> = None;
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut i = 0;

    while i < pairs.len() {
        let current = pairs[i].0;
        // consume the whole tie group before evaluating
        while i < pairs.len() && pairs[i].0 == current {
            if pairs[i].1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }

        let fn_ = positives - tp;
        let f1 = (2 * tp) as f64 / (2 * tp + fp + fn_) as f64;
        if best.map_or(true, |b| f1 > b.f1) {
            best = Some(ThresholdFit { threshold: current, f1 });
        }
    }

    best
}

/// Area under the ROC curve via the Mann-Whitney U statistic.
///
/// Tied scores receive their average rank. Returns `None` unless both
/// classes are present.
pub fn auroc(scores: &[f32], labels: &[bool]) -> Option<f64> {
    assert_eq!(scores.len(), labels.len(), "scores and labels must have the same length");

    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(Ordering::Equal));

    let mut rank_sum_pos = 0.0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    let u = rank_sum_pos - p * (p + 1.0) / 2.0;
    Some(u / (p * n))
}
