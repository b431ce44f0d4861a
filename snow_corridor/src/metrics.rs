//! Paired evaluation metrics and fitting helpers for score calibration.

use std::cmp::Ordering;

use serde::Serialize;

/// Guard against division by a numerically negligible quantity.
const EPS: f64 = 1e-12;

/// Minimum number of paired points for a meaningful fit or metric.
pub(crate) const MIN_POINTS: usize = 10;

/// Error metrics for paired (observed, predicted) series.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PairedMetrics {
    pub n: usize,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub corr: Option<f64>,
}

impl PairedMetrics {
    /// Placeholder block for a fit that produced no usable evaluation.
    pub fn empty(n: usize) -> Self {
        Self {
            n,
            mae: None,
            rmse: None,
            corr: None,
        }
    }
}

/// Compute MAE, RMSE and Pearson correlation for paired values.
///
/// Fewer than ten pairs yields null metrics; correlation is null whenever
/// either series has near-zero standard deviation.
pub fn paired_metrics(observed: &[f64], predicted: &[f64]) -> PairedMetrics {
    let n = observed.len().min(predicted.len());
    if n < MIN_POINTS {
        return PairedMetrics::empty(n);
    }
    let count = n as f64;
    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    for (obs, pred) in observed.iter().zip(predicted.iter()) {
        let err = pred - obs;
        abs_sum += err.abs();
        sq_sum += err * err;
    }
    PairedMetrics {
        n,
        mae: Some(abs_sum / count),
        rmse: Some((sq_sum / count).sqrt()),
        corr: pearson(observed, predicted),
    }
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let count = a.len().min(b.len()) as f64;
    let mean_a = a.iter().sum::<f64>() / count;
    let mean_b = b.iter().sum::<f64>() / count;
    let std_a = (a.iter().map(|v| (v - mean_a).powi(2)).sum::<f64>() / count).sqrt();
    let std_b = (b.iter().map(|v| (v - mean_b).powi(2)).sum::<f64>() / count).sqrt();
    if std_a < EPS || std_b < EPS {
        return None;
    }
    let cov = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / count;
    Some(cov / (std_a * std_b))
}

/// Ordinary least squares through the origin: slope of `obs ~ score`.
///
/// Returns `None` when fewer than ten pairs are supplied or the denominator
/// `score · score` is numerically negligible.
pub fn fit_origin_slope(score: &[f64], obs: &[f64]) -> Option<f64> {
    if score.len() < MIN_POINTS || score.len() != obs.len() {
        return None;
    }
    let denom: f64 = score.iter().map(|s| s * s).sum();
    if denom < EPS {
        return None;
    }
    let num: f64 = score.iter().zip(obs.iter()).map(|(s, y)| s * y).sum();
    Some(num / denom)
}

/// Median of a slice; even counts average the two middle values.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
