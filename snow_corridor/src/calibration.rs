//! Per-segment and global calibration of forward corridor scores against
//! observed snowfall.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::{self, PairedMetrics};
use crate::{cell, float_cell, format_time, parse_numeric, parse_time, CorridorError, EnrichedSeries};

/// Calibration-stage configuration. Column names are configurable so the
/// fit can run against tables produced elsewhere.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub horizon_hours: usize,
    pub train_frac: f64,
    pub min_valid_points: usize,
    pub rho_scale: f64,
    pub time_col: String,
    pub segment_col: String,
    pub score_col: String,
    pub snow_col: String,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            horizon_hours: 24,
            train_frac: 0.7,
            min_valid_points: 48,
            rho_scale: 1.0,
            time_col: "time".to_string(),
            segment_col: "segment_id".to_string(),
            score_col: "corridor_score".to_string(),
            snow_col: "snowfall_cm".to_string(),
        }
    }
}

impl CalibrationParams {
    pub fn validate(&self) -> Result<(), CorridorError> {
        if self.horizon_hours == 0 {
            return Err(CorridorError::InvalidParameter(
                "horizon_hours must be at least 1".into(),
            ));
        }
        if !self.train_frac.is_finite() || self.train_frac <= 0.0 || self.train_frac > 1.0 {
            return Err(CorridorError::InvalidParameter(
                "train_frac must be in (0, 1]".into(),
            ));
        }
        if !self.rho_scale.is_finite() {
            return Err(CorridorError::InvalidParameter(
                "rho_scale must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Calibration input: verbatim rows plus the parsed columns the fit needs,
/// in stable time order.
#[derive(Clone, Debug)]
pub struct CalibrationTable {
    pub header: Vec<String>,
    pub raw_rows: Vec<Vec<String>>,
    pub times: Vec<DateTime<Utc>>,
    pub segment_ids: Vec<i64>,
    pub scores: Vec<Option<f64>>,
    pub snow: Vec<f64>,
    pub dropped_rows: usize,
}

impl CalibrationTable {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Build directly from an enriched series, skipping the CSV round trip.
    pub fn from_enriched(series: &EnrichedSeries) -> Self {
        let header = series.csv_header();
        let raw_rows = (0..series.len()).map(|i| series.csv_row(i)).collect();
        let times = series.table.records.iter().map(|r| r.time).collect();
        let segment_ids = series.features.iter().map(|f| f.segment_id).collect();
        let scores = series.features.iter().map(|f| f.corridor_score).collect();
        let snow = series
            .table
            .records
            .iter()
            .map(|r| r.snowfall_cm.unwrap_or(0.0))
            .collect();
        Self {
            header,
            raw_rows,
            times,
            segment_ids,
            scores,
            snow,
            dropped_rows: 0,
        }
    }
}

/// Load a calibration CSV. Time, score and snow columns are required; a
/// missing segment column puts every row in segment 0. Rows with
/// unparseable timestamps or segment ids are dropped, bad score cells
/// become undefined and bad snow cells become zero.
pub fn load_calibration_csv(
    path: &Path,
    params: &CalibrationParams,
) -> Result<CalibrationTable, CorridorError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| CorridorError::Csv(e.to_string()))?;
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| CorridorError::Csv(e.to_string()))?
        .iter()
        .map(|s| s.to_string())
        .collect();
    let find = |name: &str| header.iter().position(|h| h == name);
    let missing: Vec<String> = [&params.time_col, &params.score_col, &params.snow_col]
        .iter()
        .filter(|name| find(name).is_none())
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CorridorError::MissingColumns(missing));
    }
    let time_idx = find(&params.time_col).unwrap_or(0);
    let score_idx = find(&params.score_col).unwrap_or(0);
    let snow_idx = find(&params.snow_col).unwrap_or(0);
    let segment_idx = find(&params.segment_col);

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    let mut times: Vec<DateTime<Utc>> = Vec::new();
    let mut segment_ids: Vec<i64> = Vec::new();
    let mut scores: Vec<Option<f64>> = Vec::new();
    let mut snow: Vec<f64> = Vec::new();
    let mut dropped_rows = 0usize;
    for result in reader.records() {
        let record = result.map_err(|e| CorridorError::Csv(e.to_string()))?;
        let cells: Vec<String> = record.iter().map(|s| s.to_string()).collect();
        let time = match parse_time(cell(&cells, time_idx)) {
            Some(time) => time,
            None => {
                dropped_rows += 1;
                continue;
            }
        };
        let segment = match segment_idx {
            Some(idx) => match parse_segment(cell(&cells, idx)) {
                Some(id) => id,
                None => {
                    dropped_rows += 1;
                    continue;
                }
            },
            None => 0,
        };
        times.push(time);
        segment_ids.push(segment);
        scores.push(parse_numeric(cell(&cells, score_idx)));
        snow.push(parse_numeric(cell(&cells, snow_idx)).unwrap_or(0.0));
        raw_rows.push(cells);
    }
    if times.is_empty() {
        return Err(CorridorError::EmptyInput);
    }

    let mut order: Vec<usize> = (0..times.len()).collect();
    order.sort_by_key(|&i| times[i]);
    Ok(CalibrationTable {
        header,
        raw_rows: permute(&raw_rows, &order),
        times: permute(&times, &order),
        segment_ids: permute(&segment_ids, &order),
        scores: permute(&scores, &order),
        snow: permute(&snow, &order),
        dropped_rows,
    })
}

fn parse_segment(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v as i64)
}

fn permute<T: Clone>(values: &[T], order: &[usize]) -> Vec<T> {
    order.iter().map(|&i| values[i].clone()).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    Ok,
    InsufficientValidPoints,
    AlphaFitFailed,
}

/// Fit outcome for one segment. `rho_scale` appears only on a successful
/// fit; the metric blocks echo the split sizes even when the fit failed.
#[derive(Clone, Debug, Serialize)]
pub struct SegmentCalibration {
    pub segment_id: i64,
    pub alpha_seg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rho_scale: Option<f64>,
    pub train_metrics_seg: PairedMetrics,
    pub test_metrics_seg: PairedMetrics,
    pub note: CalibrationStatus,
}

/// Human-readable definitions embedded in every report.
#[derive(Clone, Debug, Serialize)]
pub struct Formulas {
    #[serde(rename = "score_H(t)")]
    pub score_h: &'static str,
    #[serde(rename = "obs_snow_H(t)")]
    pub obs_snow_h: &'static str,
    pub alpha_seg: &'static str,
    pub alpha_global: &'static str,
    #[serde(rename = "pred_snow_H_seg(t)")]
    pub pred_snow_h_seg: &'static str,
    #[serde(rename = "pred_snow_H_global(t)")]
    pub pred_snow_h_global: &'static str,
    #[serde(rename = "pred_depth_H_*")]
    pub pred_depth_h: &'static str,
}

impl Default for Formulas {
    fn default() -> Self {
        Self {
            score_h: "sum_{h=t..t+H-1} corridor_score(h)",
            obs_snow_h: "sum_{h=t..t+H-1} snowfall_cm(h)",
            alpha_seg: "a = (score^T obs) / (score^T score) fitted inside each segment on train split",
            alpha_global: "median(alpha_seg over segments where alpha_seg exists)",
            pred_snow_h_seg: "alpha_seg * score_H(t)",
            pred_snow_h_global: "alpha_global * score_H(t)",
            pred_depth_h: "rho_scale * pred_snow_H_*",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CalibrationReport {
    pub input_rows: usize,
    pub start: Option<String>,
    pub end: Option<String>,
    pub horizon_hours: usize,
    pub train_frac: f64,
    pub rho_scale: f64,
    pub global_alpha_median: Option<f64>,
    pub global_metrics: PairedMetrics,
    pub per_segment: Vec<SegmentCalibration>,
    pub formulas: Formulas,
}

/// Columns appended to the calibration input by the prediction stage.
pub const PREDICTION_COLUMNS: [&str; 6] = [
    "score_H",
    "obs_snow_H",
    "pred_snow_H_seg",
    "pred_depth_H_seg",
    "pred_snow_H_global",
    "pred_depth_H_global",
];

/// Calibration result: the input table, the derived forward sums and
/// predictions aligned with it, and the report document.
#[derive(Clone, Debug)]
pub struct CalibrationOutcome {
    pub table: CalibrationTable,
    pub score_h: Vec<Option<f64>>,
    pub obs_snow_h: Vec<Option<f64>>,
    pub pred_snow_seg: Vec<Option<f64>>,
    pub pred_depth_seg: Vec<Option<f64>>,
    pub pred_snow_global: Vec<Option<f64>>,
    pub pred_depth_global: Vec<Option<f64>>,
    pub report: CalibrationReport,
}

impl CalibrationOutcome {
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Input columns, then the derived columns not already present. A
    /// colliding derived name keeps its input position and is overwritten
    /// row by row, so calibrate can re-read its own predictions table.
    pub fn csv_header(&self) -> Vec<String> {
        let mut header = self.table.header.clone();
        for column in PREDICTION_COLUMNS {
            if !header.iter().any(|h| h == column) {
                header.push(column.to_string());
            }
        }
        header
    }

    pub fn csv_row(&self, idx: usize) -> Vec<String> {
        let derived = [
            float_cell(self.score_h[idx]),
            float_cell(self.obs_snow_h[idx]),
            float_cell(self.pred_snow_seg[idx]),
            float_cell(self.pred_depth_seg[idx]),
            float_cell(self.pred_snow_global[idx]),
            float_cell(self.pred_depth_global[idx]),
        ];
        let mut row = self.table.raw_rows[idx].clone();
        for (column, value) in PREDICTION_COLUMNS.into_iter().zip(derived) {
            match self.table.header.iter().position(|h| h == column) {
                Some(slot) => row[slot] = value,
                None => row.push(value),
            }
        }
        row
    }
}

/// Calibrate forward corridor scores against observed snowfall, per segment
/// and globally.
pub fn calibrate(
    table: CalibrationTable,
    params: &CalibrationParams,
) -> Result<CalibrationOutcome, CorridorError> {
    params.validate()?;
    let n = table.len();
    if n == 0 {
        return Err(CorridorError::EmptyInput);
    }

    let mut score_h = vec![None; n];
    let mut obs_snow_h = vec![None; n];
    let mut pred_snow_seg = vec![None; n];
    let mut pred_depth_seg = vec![None; n];
    let mut pred_snow_global = vec![None; n];
    let mut pred_depth_global = vec![None; n];

    let groups = group_indices(&table.segment_ids);
    let mut per_segment = Vec::with_capacity(groups.len());
    let mut segment_alphas: Vec<f64> = Vec::new();

    for (&segment_id, rows) in &groups {
        let seg_scores: Vec<Option<f64>> = rows.iter().map(|&i| table.scores[i]).collect();
        let seg_snow: Vec<f64> = rows.iter().map(|&i| table.snow[i]).collect();
        let (seg_score_h, seg_obs_h) = horizon_sums(&seg_scores, &seg_snow, params.horizon_hours);
        for (k, &i) in rows.iter().enumerate() {
            score_h[i] = seg_score_h[k];
            obs_snow_h[i] = seg_obs_h[k];
        }

        // fit candidates: rows where both forward sums are defined
        let valid: Vec<(f64, f64)> = seg_score_h
            .iter()
            .zip(seg_obs_h.iter())
            .filter_map(|(s, o)| match (s, o) {
                (Some(s), Some(o)) => Some((*s, *o)),
                _ => None,
            })
            .collect();

        if valid.len() < params.min_valid_points {
            per_segment.push(SegmentCalibration {
                segment_id,
                alpha_seg: None,
                rho_scale: None,
                train_metrics_seg: PairedMetrics::empty(0),
                test_metrics_seg: PairedMetrics::empty(0),
                note: CalibrationStatus::InsufficientValidPoints,
            });
            continue;
        }

        let n_valid = valid.len();
        let n_train = ((params.train_frac * n_valid as f64).round() as usize)
            .max(10)
            .min(n_valid);
        let (train, test) = valid.split_at(n_train);
        let train_scores: Vec<f64> = train.iter().map(|p| p.0).collect();
        let train_obs: Vec<f64> = train.iter().map(|p| p.1).collect();

        match metrics::fit_origin_slope(&train_scores, &train_obs) {
            Some(alpha) => {
                for (k, &i) in rows.iter().enumerate() {
                    if let Some(s) = seg_score_h[k] {
                        let snow_pred = alpha * s;
                        pred_snow_seg[i] = Some(snow_pred);
                        pred_depth_seg[i] = Some(params.rho_scale * snow_pred);
                    }
                }
                let train_pred: Vec<f64> = train_scores.iter().map(|s| alpha * s).collect();
                let test_obs: Vec<f64> = test.iter().map(|p| p.1).collect();
                let test_pred: Vec<f64> = test.iter().map(|p| alpha * p.0).collect();
                segment_alphas.push(alpha);
                per_segment.push(SegmentCalibration {
                    segment_id,
                    alpha_seg: Some(alpha),
                    rho_scale: Some(params.rho_scale),
                    train_metrics_seg: metrics::paired_metrics(&train_obs, &train_pred),
                    test_metrics_seg: metrics::paired_metrics(&test_obs, &test_pred),
                    note: CalibrationStatus::Ok,
                });
            }
            None => {
                per_segment.push(SegmentCalibration {
                    segment_id,
                    alpha_seg: None,
                    rho_scale: None,
                    train_metrics_seg: PairedMetrics::empty(train.len()),
                    test_metrics_seg: PairedMetrics::empty(test.len()),
                    note: CalibrationStatus::AlphaFitFailed,
                });
            }
        }
    }

    let global_alpha = metrics::median(&segment_alphas);
    let mut global_metrics = PairedMetrics::empty(0);
    if let Some(alpha) = global_alpha {
        for i in 0..n {
            if let Some(s) = score_h[i] {
                let snow_pred = alpha * s;
                pred_snow_global[i] = Some(snow_pred);
                pred_depth_global[i] = Some(params.rho_scale * snow_pred);
            }
        }
        let mut obs = Vec::new();
        let mut pred = Vec::new();
        for i in 0..n {
            if let (Some(o), Some(p)) = (obs_snow_h[i], pred_snow_global[i]) {
                obs.push(o);
                pred.push(p);
            }
        }
        if obs.len() >= metrics::MIN_POINTS {
            global_metrics = metrics::paired_metrics(&obs, &pred);
        }
    }

    let report = CalibrationReport {
        input_rows: n,
        start: table.times.first().map(|&t| format_time(t)),
        end: table.times.last().map(|&t| format_time(t)),
        horizon_hours: params.horizon_hours,
        train_frac: params.train_frac,
        rho_scale: params.rho_scale,
        global_alpha_median: global_alpha,
        global_metrics,
        per_segment,
        formulas: Formulas::default(),
    };

    Ok(CalibrationOutcome {
        table,
        score_h,
        obs_snow_h,
        pred_snow_seg,
        pred_depth_seg,
        pred_snow_global,
        pred_depth_global,
        report,
    })
}

fn group_indices(segment_ids: &[i64]) -> BTreeMap<i64, Vec<usize>> {
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, id) in segment_ids.iter().enumerate() {
        groups.entry(*id).or_default().push(i);
    }
    groups
}

/// Forward horizon sums inside one segment. `score_h[k]` is defined only
/// when `horizon` rows remain from `k` and every one of their scores is
/// defined; `obs_snow_h[k]` needs only the rows to remain.
fn horizon_sums(
    scores: &[Option<f64>],
    snow: &[f64],
    horizon: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let n = scores.len();
    let mut score_prefix = vec![0.0; n + 1];
    let mut undef_prefix = vec![0usize; n + 1];
    let mut snow_prefix = vec![0.0; n + 1];
    for i in 0..n {
        score_prefix[i + 1] = score_prefix[i] + scores[i].unwrap_or(0.0);
        undef_prefix[i + 1] = undef_prefix[i] + usize::from(scores[i].is_none());
        snow_prefix[i + 1] = snow_prefix[i] + snow[i];
    }
    let mut score_h = vec![None; n];
    let mut obs_h = vec![None; n];
    for k in 0..n {
        let end = k + horizon;
        if end > n {
            continue;
        }
        if undef_prefix[end] == undef_prefix[k] {
            score_h[k] = Some(score_prefix[end] - score_prefix[k]);
        }
        obs_h[k] = Some(snow_prefix[end] - snow_prefix[k]);
    }
    (score_h, obs_h)
}
