//! Corridor-score feature engine for snow accumulation forecasting.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod calibration;
pub mod metrics;
pub mod summary;

pub use calibration::{
    calibrate, load_calibration_csv, CalibrationOutcome, CalibrationParams, CalibrationReport,
    CalibrationStatus, CalibrationTable, SegmentCalibration,
};
pub use metrics::{fit_origin_slope, median, paired_metrics, PairedMetrics};
pub use summary::{build_summary, RankedRow, Summary};

#[derive(Error, Debug)]
pub enum CorridorError {
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("failed to read CSV: {0}")]
    Csv(String),
    #[error("no usable rows in input")]
    EmptyInput,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Feature-stage configuration with the standard defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureParams {
    pub tct_window_hours: usize,
    pub stress_window_hours: Option<usize>,
    pub cp_threshold: f64,
    pub s_max: f64,
    pub k_depth: f64,
    pub gap_hours: f64,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            tct_window_hours: 24,
            stress_window_hours: None,
            cp_threshold: 0.08,
            s_max: 2.5,
            k_depth: 13.0,
            gap_hours: 6.0,
        }
    }
}

impl FeatureParams {
    /// Stress window falls back to the range window when unset.
    pub fn stress_window(&self) -> usize {
        self.stress_window_hours.unwrap_or(self.tct_window_hours)
    }

    pub fn validate(&self) -> Result<(), CorridorError> {
        if self.tct_window_hours == 0 {
            return Err(CorridorError::InvalidParameter(
                "tct_window_hours must be at least 1".into(),
            ));
        }
        if self.stress_window() == 0 {
            return Err(CorridorError::InvalidParameter(
                "stress_window_hours must be at least 1".into(),
            ));
        }
        if !self.gap_hours.is_finite() {
            return Err(CorridorError::InvalidParameter(
                "gap_hours must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Input table schema: required columns plus the optional ones that are
/// parsed into the record when present.
#[derive(Clone, Debug)]
pub struct InputSchema {
    pub time_col: String,
    pub temperature_col: String,
    pub humidity_col: String,
    pub snowfall_col: String,
    pub precip_col: String,
    pub dewpoint_col: String,
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            time_col: "time".to_string(),
            temperature_col: "temperature_C".to_string(),
            humidity_col: "humidity_pct".to_string(),
            snowfall_col: "snowfall_cm".to_string(),
            precip_col: "precip_mm".to_string(),
            dewpoint_col: "dewpoint_C".to_string(),
        }
    }
}

struct ColumnIndices {
    time: usize,
    temperature: usize,
    humidity: usize,
    snowfall: usize,
    precip: Option<usize>,
    dewpoint: Option<usize>,
}

impl InputSchema {
    fn required_cols(&self) -> [&str; 4] {
        [
            &self.time_col,
            &self.temperature_col,
            &self.humidity_col,
            &self.snowfall_col,
        ]
    }

    fn resolve(&self, header: &[String]) -> Result<ColumnIndices, CorridorError> {
        let find = |name: &str| header.iter().position(|h| h == name);
        let missing: Vec<String> = self
            .required_cols()
            .iter()
            .filter(|name| find(name).is_none())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(CorridorError::MissingColumns(missing));
        }
        Ok(ColumnIndices {
            time: find(&self.time_col).unwrap_or(0),
            temperature: find(&self.temperature_col).unwrap_or(0),
            humidity: find(&self.humidity_col).unwrap_or(0),
            snowfall: find(&self.snowfall_col).unwrap_or(0),
            precip: find(&self.precip_col),
            dewpoint: find(&self.dewpoint_col),
        })
    }
}

/// One weather observation. Numeric fields are `None` when the source cell
/// was empty or unparseable, the optional fields also when their column is
/// absent; that undefined state is distinct from zero.
#[derive(Clone, Debug)]
pub struct WeatherRecord {
    pub time: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub snowfall_cm: Option<f64>,
    pub precip_mm: Option<f64>,
    pub dewpoint_c: Option<f64>,
}

/// Loaded input table: parsed records plus the verbatim cells for output
/// passthrough, both in stable time order.
#[derive(Clone, Debug)]
pub struct WeatherTable {
    pub header: Vec<String>,
    pub raw_rows: Vec<Vec<String>>,
    pub records: Vec<WeatherRecord>,
    pub dropped_rows: usize,
}

/// Derived per-record features. `segment_id` ties the row back to its
/// gap-free run; rolling values never cross a run boundary.
#[derive(Clone, Debug)]
pub struct FeatureRow {
    pub segment_id: i64,
    pub cp: Option<f64>,
    pub s_struct: Option<f64>,
    pub sce: Option<f64>,
    pub admissible: bool,
    pub depth_est_cm: f64,
    pub depth_min_cm: Option<f64>,
    pub depth_max_cm: Option<f64>,
    pub corridor_score: Option<f64>,
}

/// Columns appended to the input table by the feature stage, in order.
pub const FEATURE_COLUMNS: [&str; 9] = [
    "segment_id",
    "CP",
    "S_struct",
    "SCE",
    "admissible",
    "depth_est_cm",
    "depth_min_cm",
    "depth_max_cm",
    "corridor_score",
];

#[derive(Clone, Debug)]
pub struct EnrichedSeries {
    pub table: WeatherTable,
    pub features: Vec<FeatureRow>,
}

impl EnrichedSeries {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Number of distinct segments; ids are non-decreasing in time order.
    pub fn segment_count(&self) -> usize {
        if self.features.is_empty() {
            return 0;
        }
        1 + self
            .features
            .windows(2)
            .filter(|pair| pair[0].segment_id != pair[1].segment_id)
            .count()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.table.records.first().map(|r| r.time)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.table.records.last().map(|r| r.time)
    }

    /// Header for the enriched series table: input columns, then the derived
    /// columns not already present. An input column named like a derived one
    /// keeps its position and is overwritten row by row, so re-running the
    /// feature stage over its own output refreshes the stale columns instead
    /// of duplicating them.
    pub fn csv_header(&self) -> Vec<String> {
        let mut header = self.table.header.clone();
        for column in FEATURE_COLUMNS {
            if !header.iter().any(|h| h == column) {
                header.push(column.to_string());
            }
        }
        header
    }

    /// One enriched row: input cells passed through, derived cells written
    /// over colliding input columns or appended.
    pub fn csv_row(&self, idx: usize) -> Vec<String> {
        let feature = &self.features[idx];
        let derived = [
            feature.segment_id.to_string(),
            float_cell(feature.cp),
            float_cell(feature.s_struct),
            float_cell(feature.sce),
            feature.admissible.to_string(),
            feature.depth_est_cm.to_string(),
            float_cell(feature.depth_min_cm),
            float_cell(feature.depth_max_cm),
            float_cell(feature.corridor_score),
        ];
        let mut row = self.table.raw_rows[idx].clone();
        for (column, value) in FEATURE_COLUMNS.into_iter().zip(derived) {
            match self.table.header.iter().position(|h| h == column) {
                Some(slot) => row[slot] = value,
                None => row.push(value),
            }
        }
        row
    }
}

/// Load a weather CSV, validate required columns, drop rows with
/// unparseable timestamps and stably sort the remainder by time.
pub fn load_weather_csv(path: &Path, schema: &InputSchema) -> Result<WeatherTable, CorridorError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| CorridorError::Csv(e.to_string()))?;
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| CorridorError::Csv(e.to_string()))?
        .iter()
        .map(|s| s.to_string())
        .collect();
    let columns = schema.resolve(&header)?;

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    let mut records: Vec<WeatherRecord> = Vec::new();
    let mut dropped_rows = 0usize;
    for result in reader.records() {
        let record = result.map_err(|e| CorridorError::Csv(e.to_string()))?;
        let cells: Vec<String> = record.iter().map(|s| s.to_string()).collect();
        let time = match parse_time(cell(&cells, columns.time)) {
            Some(time) => time,
            None => {
                dropped_rows += 1;
                continue;
            }
        };
        records.push(WeatherRecord {
            time,
            temperature_c: parse_numeric(cell(&cells, columns.temperature)),
            humidity_pct: parse_numeric(cell(&cells, columns.humidity)),
            snowfall_cm: parse_numeric(cell(&cells, columns.snowfall)),
            precip_mm: columns.precip.and_then(|i| parse_numeric(cell(&cells, i))),
            dewpoint_c: columns.dewpoint.and_then(|i| parse_numeric(cell(&cells, i))),
        });
        raw_rows.push(cells);
    }
    if records.is_empty() {
        return Err(CorridorError::EmptyInput);
    }

    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by_key(|&i| records[i].time);
    let records: Vec<WeatherRecord> = order.iter().map(|&i| records[i].clone()).collect();
    let raw_rows: Vec<Vec<String>> = order.iter().map(|&i| raw_rows[i].clone()).collect();

    Ok(WeatherTable {
        header,
        raw_rows,
        records,
        dropped_rows,
    })
}

pub(crate) fn cell(cells: &[String], idx: usize) -> &str {
    cells.get(idx).map(String::as_str).unwrap_or("")
}

const TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a timestamp from RFC 3339 or common date-time layouts; naive
/// values are taken as UTC.
pub fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

/// Parse a numeric cell; empty, unparseable or non-finite text is undefined.
pub fn parse_numeric(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Render an optional float for CSV output; undefined becomes an empty cell.
pub fn float_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Assign segment ids over time-sorted records: the id starts at 0 and
/// increments whenever the gap to the previous record exceeds `gap_hours`.
pub fn assign_segment_ids(times: &[DateTime<Utc>], gap_hours: f64) -> Vec<i64> {
    let mut ids = Vec::with_capacity(times.len());
    let mut current = 0i64;
    for (i, time) in times.iter().enumerate() {
        if i > 0 {
            let elapsed_hours = (*time - times[i - 1]).num_milliseconds() as f64 / 3_600_000.0;
            if elapsed_hours > gap_hours {
                current += 1;
            }
        }
        ids.push(current);
    }
    ids
}

/// Segment the table and derive corridor features for every record.
pub fn enrich(table: WeatherTable, params: &FeatureParams) -> Result<EnrichedSeries, CorridorError> {
    params.validate()?;
    let times: Vec<DateTime<Utc>> = table.records.iter().map(|r| r.time).collect();
    let ids = assign_segment_ids(&times, params.gap_hours);
    let ranges = segment_ranges(&ids);
    let features: Vec<FeatureRow> = ranges
        .par_iter()
        .map(|&(start, end)| segment_features(&table.records[start..end], ids[start], params))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();
    Ok(EnrichedSeries { table, features })
}

fn segment_ranges(ids: &[i64]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    for i in 1..=ids.len() {
        if i == ids.len() || ids[i] != ids[start] {
            ranges.push((start, i));
            start = i;
        }
    }
    ranges
}

fn window_min_samples(window: usize) -> usize {
    (window / 3).max(6)
}

fn depth_estimate(cp: Option<f64>, k_depth: f64) -> f64 {
    cp.map(|c| (k_depth * (c + 1.0).ln()).max(0.0)).unwrap_or(0.0)
}

fn segment_features(records: &[WeatherRecord], segment_id: i64, params: &FeatureParams) -> Vec<FeatureRow> {
    let n = records.len();
    let window = params.tct_window_hours;
    let stress_window = params.stress_window();
    let min_samples = window_min_samples(window);
    let stress_min_samples = window_min_samples(stress_window);

    let temps: Vec<Option<f64>> = records.iter().map(|r| r.temperature_c).collect();
    let hums: Vec<Option<f64>> = records.iter().map(|r| r.humidity_pct).collect();

    let dt = rolling_range(&temps, window, min_samples);
    let dh = rolling_range(&hums, window, min_samples);

    let denom = window.max(1) as f64;
    let mut cp = Vec::with_capacity(n);
    for i in 0..n {
        cp.push(match (dt[i], dh[i]) {
            (Some(t), Some(h)) => Some(t * h / denom),
            _ => None,
        });
    }

    let mut jerk = vec![None; n];
    for i in 1..n {
        if let (Some(curr), Some(prev)) = (cp[i], cp[i - 1]) {
            jerk[i] = Some((curr - prev).abs());
        }
    }

    let stress = rolling_sum(&jerk, stress_window, stress_min_samples);

    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let s_struct = stress[i];
        let sce = s_struct.map(|s| (-s).exp());
        let admissible = match (cp[i], s_struct) {
            (Some(c), Some(s)) => c >= params.cp_threshold && s <= params.s_max,
            _ => false,
        };
        let depth_est_cm = depth_estimate(cp[i], params.k_depth);
        let confidence = sce.map(|s| s.clamp(0.0, 1.0));
        rows.push(FeatureRow {
            segment_id,
            cp: cp[i],
            s_struct,
            sce,
            admissible,
            depth_est_cm,
            depth_min_cm: confidence.map(|c| depth_est_cm * c),
            depth_max_cm: confidence.map(|c| depth_est_cm * (2.0 - c)),
            corridor_score: confidence.map(|c| depth_est_cm * c),
        });
    }
    rows
}

/// Trailing max-minus-min over a window, skipping undefined values. The
/// result is defined only when at least `min_samples` defined values lie in
/// the window. Monotonic deques keep the pass O(n).
fn rolling_range(values: &[Option<f64>], window: usize, min_samples: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut maxima: VecDeque<(usize, f64)> = VecDeque::new();
    let mut minima: VecDeque<(usize, f64)> = VecDeque::new();
    let mut defined = 0usize;
    for i in 0..values.len() {
        if let Some(value) = values[i] {
            defined += 1;
            while maxima.back().map_or(false, |&(_, v)| v <= value) {
                maxima.pop_back();
            }
            maxima.push_back((i, value));
            while minima.back().map_or(false, |&(_, v)| v >= value) {
                minima.pop_back();
            }
            minima.push_back((i, value));
        }
        if i >= window && values[i - window].is_some() {
            defined -= 1;
        }
        let window_start = (i + 1).saturating_sub(window);
        while maxima.front().map_or(false, |&(j, _)| j < window_start) {
            maxima.pop_front();
        }
        while minima.front().map_or(false, |&(j, _)| j < window_start) {
            minima.pop_front();
        }
        let range = if defined >= min_samples {
            match (maxima.front(), minima.front()) {
                (Some(&(_, hi)), Some(&(_, lo))) => Some(hi - lo),
                _ => None,
            }
        } else {
            None
        };
        out.push(range);
    }
    out
}

/// Trailing sum over a window, skipping undefined values, defined only when
/// at least `min_samples` defined values lie in the window.
fn rolling_sum(values: &[Option<f64>], window: usize, min_samples: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    let mut defined = 0usize;
    for i in 0..values.len() {
        if let Some(value) = values[i] {
            sum += value;
            defined += 1;
        }
        if i >= window {
            if let Some(value) = values[i - window] {
                sum -= value;
                defined -= 1;
            }
        }
        out.push(if defined >= min_samples { Some(sum) } else { None });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn build_table(
        times: Vec<DateTime<Utc>>,
        temp: impl Fn(usize) -> Option<f64>,
        hum: impl Fn(usize) -> Option<f64>,
        snow: impl Fn(usize) -> Option<f64>,
    ) -> WeatherTable {
        let header = ["time", "temperature_C", "humidity_pct", "snowfall_cm"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut records = Vec::new();
        let mut raw_rows = Vec::new();
        for (i, time) in times.iter().enumerate() {
            let (t, h, s) = (temp(i), hum(i), snow(i));
            records.push(WeatherRecord {
                time: *time,
                temperature_c: t,
                humidity_pct: h,
                snowfall_cm: s,
                precip_mm: None,
                dewpoint_c: None,
            });
            raw_rows.push(vec![format_time(*time), float_cell(t), float_cell(h), float_cell(s)]);
        }
        WeatherTable {
            header,
            raw_rows,
            records,
            dropped_rows: 0,
        }
    }

    fn hourly_times(n: usize) -> Vec<DateTime<Utc>> {
        (0..n).map(|i| base_time() + Duration::hours(i as i64)).collect()
    }

    #[test]
    fn parse_time_accepts_common_layouts() {
        let utc = parse_time("2024-01-02T03:04:05+01:00").unwrap();
        assert_eq!(format_time(utc), "2024-01-02 02:04:05");
        assert!(parse_time("2024-01-02 03:04:05").is_some());
        assert!(parse_time("2024-01-02T03:04:05").is_some());
        assert!(parse_time("2024-01-02 03:04:05.250").is_some());
        assert_eq!(format_time(parse_time("2024-01-02").unwrap()), "2024-01-02 00:00:00");
        assert!(parse_time("not a time").is_none());
        assert!(parse_time("").is_none());
    }

    #[test]
    fn parse_numeric_treats_bad_cells_as_undefined() {
        assert_eq!(parse_numeric("1.5"), Some(1.5));
        assert_eq!(parse_numeric(" 2 "), Some(2.0));
        assert_eq!(parse_numeric(""), None);
        assert_eq!(parse_numeric("abc"), None);
        assert_eq!(parse_numeric("NaN"), None);
        assert_eq!(parse_numeric("inf"), None);
    }

    #[test]
    fn segment_id_increments_once_at_a_seven_hour_gap() {
        let mut times = hourly_times(12);
        let resume = times[11] + Duration::hours(7);
        for i in 0..12 {
            times.push(resume + Duration::hours(i));
        }
        let ids = assign_segment_ids(&times, 6.0);
        assert_eq!(&ids[..12], &[0; 12]);
        assert_eq!(&ids[12..], &[1; 12]);
    }

    #[test]
    fn gap_equal_to_threshold_does_not_split() {
        let times = vec![base_time(), base_time() + Duration::hours(6)];
        assert_eq!(assign_segment_ids(&times, 6.0), vec![0, 0]);
    }

    #[test]
    fn rolling_range_requires_min_samples() {
        let values: Vec<Option<f64>> = (0..30).map(|i| Some(i as f64)).collect();
        let out = rolling_range(&values, 24, 8);
        assert_eq!(out[6], None);
        assert_eq!(out[7], Some(7.0));
        assert_eq!(out[23], Some(23.0));
        // window has slid: [6..29] -> 29 - 6
        assert_eq!(out[29], Some(23.0));
    }

    #[test]
    fn rolling_range_skips_undefined_values() {
        let values: Vec<Option<f64>> = (0..24)
            .map(|i| if i % 2 == 0 { Some(i as f64) } else { None })
            .collect();
        let out = rolling_range(&values, 24, 8);
        // seven defined values in [0..13], eight in [0..14]
        assert_eq!(out[13], None);
        assert_eq!(out[14], Some(14.0));
    }

    #[test]
    fn rolling_sum_window_arithmetic() {
        let values: Vec<Option<f64>> = vec![Some(1.0); 5];
        let out = rolling_sum(&values, 3, 1);
        assert_eq!(out, vec![Some(1.0), Some(2.0), Some(3.0), Some(3.0), Some(3.0)]);
        let gated = rolling_sum(&values, 3, 2);
        assert_eq!(gated[0], None);
        assert_eq!(gated[1], Some(2.0));
    }

    #[test]
    fn features_reset_at_segment_boundaries() {
        let mut times = hourly_times(30);
        let resume = times[29] + Duration::hours(10);
        for i in 0..30 {
            times.push(resume + Duration::hours(i));
        }
        let temp = |i: usize| Some(((i * 7) % 13) as f64 - 5.0);
        let hum = |i: usize| Some(40.0 + ((i * 11) % 17) as f64);
        let table = build_table(times, temp, hum, |_| Some(0.0));
        let full = enrich(table, &FeatureParams::default()).unwrap();
        assert_eq!(full.segment_count(), 2);

        let solo_table = build_table(
            (0..30).map(|i| resume_time() + Duration::hours(i as i64)).collect(),
            |i| temp(i + 30),
            |i| hum(i + 30),
            |_| Some(0.0),
        );
        let solo = enrich(solo_table, &FeatureParams::default()).unwrap();
        for k in 0..30 {
            let a = &full.features[30 + k];
            let b = &solo.features[k];
            assert_eq!(a.cp, b.cp);
            assert_eq!(a.s_struct, b.s_struct);
            assert_eq!(a.sce, b.sce);
            assert_eq!(a.admissible, b.admissible);
            assert_eq!(a.corridor_score, b.corridor_score);
        }
    }

    fn resume_time() -> DateTime<Utc> {
        base_time() + Duration::hours(29) + Duration::hours(10)
    }

    #[test]
    fn definedness_chain_holds() {
        let table = build_table(
            hourly_times(60),
            |i| if i % 9 == 4 { None } else { Some((i % 11) as f64) },
            |i| if i % 13 == 2 { None } else { Some(50.0 + (i % 7) as f64) },
            |_| Some(0.0),
        );
        let series = enrich(table, &FeatureParams::default()).unwrap();
        for row in &series.features {
            assert_eq!(row.corridor_score.is_some(), row.sce.is_some());
            assert_eq!(row.sce.is_some(), row.s_struct.is_some());
            assert_eq!(row.depth_min_cm.is_some(), row.sce.is_some());
            assert_eq!(row.depth_max_cm.is_some(), row.sce.is_some());
            assert!(row.depth_est_cm >= 0.0);
            if let Some(sce) = row.sce {
                assert!(sce > 0.0 && sce <= 1.0);
            }
        }
    }

    #[test]
    fn shorter_stress_window_defines_stress_sooner() {
        // ramping temperature against a short humidity cycle keeps every CP
        // step at exactly 1/8, so the stress sums stay exact
        let table = build_table(
            hourly_times(26),
            |i| Some(i as f64),
            |i| Some(50.0 + (i % 4) as f64),
            |_| Some(0.0),
        );
        let mut params = FeatureParams::default();
        params.stress_window_hours = Some(12);
        let series = enrich(table.clone(), &params).unwrap();
        // six defined jerks fit a 12-row window at index 13
        assert_eq!(series.features[12].s_struct, None);
        assert_eq!(series.features[13].s_struct, Some(0.75));
        assert!(series.features[13].sce.is_some());
        // once the range window saturates the short stress window forgets
        // the early jerks that the full-width default still sums
        assert_eq!(series.features[25].s_struct, Some(1.25));

        let default_series = enrich(table, &FeatureParams::default()).unwrap();
        assert_eq!(default_series.features[14].s_struct, None);
        assert_eq!(default_series.features[15].s_struct, Some(1.0));
        assert_eq!(default_series.features[25].s_struct, Some(2.0));

        let summary = build_summary(&series, &params);
        assert_eq!(summary.params.stress_window_hours, 12);
        assert_eq!(summary.params.tct_window_hours, 24);
    }

    #[test]
    fn admissible_rows_satisfy_both_thresholds() {
        let params = FeatureParams::default();
        // periodic series: rolling ranges saturate, so later rows carry a
        // high CP with near-zero stress
        let table = build_table(
            hourly_times(120),
            |i| Some((i % 12) as f64),
            |i| Some(50.0 + (i % 10) as f64),
            |_| Some(0.0),
        );
        let series = enrich(table, &params).unwrap();
        let mut admitted = 0;
        for row in &series.features {
            if row.admissible {
                admitted += 1;
                assert!(row.cp.unwrap() >= params.cp_threshold);
                assert!(row.s_struct.unwrap() <= params.s_max);
            }
            if row.cp.is_none() || row.s_struct.is_none() {
                assert!(!row.admissible);
            }
        }
        assert!(admitted > 0);
    }

    #[test]
    fn depth_estimate_is_monotone_and_clamped() {
        let cps = [0.0, 0.01, 0.08, 0.3, 1.0, 4.2, 9.5, 60.0];
        let depths: Vec<f64> = cps.iter().map(|&c| depth_estimate(Some(c), 13.0)).collect();
        for pair in depths.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(depth_estimate(None, 13.0), 0.0);
        assert_eq!(depth_estimate(Some(-0.5), 13.0), 0.0);
    }

    #[test]
    fn constant_temperature_yields_zero_scores() {
        let table = build_table(
            hourly_times(48),
            |_| Some(0.0),
            |i| Some(50.0 + (i % 7) as f64),
            |_| Some(0.0),
        );
        let series = enrich(table, &FeatureParams::default()).unwrap();
        for (i, row) in series.features.iter().enumerate() {
            assert_eq!(row.depth_est_cm, 0.0);
            assert!(!row.admissible);
            if i < 7 {
                assert_eq!(row.cp, None);
            } else {
                assert_eq!(row.cp, Some(0.0));
            }
            if i < 15 {
                assert_eq!(row.corridor_score, None);
            } else {
                assert_eq!(row.sce, Some(1.0));
                assert_eq!(row.corridor_score, Some(0.0));
            }
        }
    }

    #[test]
    fn missing_columns_are_all_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,temperature_C").unwrap();
        writeln!(file, "2024-01-01 00:00:00,1.0").unwrap();
        let err = load_weather_csv(file.path(), &InputSchema::default()).unwrap_err();
        match err {
            CorridorError::MissingColumns(cols) => {
                assert_eq!(cols, vec!["humidity_pct".to_string(), "snowfall_cm".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_drops_bad_timestamps_and_sorts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,temperature_C,humidity_pct,snowfall_cm,precip_mm").unwrap();
        writeln!(file, "2024-01-01 02:00:00,-1.0,81,0.0,0.4").unwrap();
        writeln!(file, "not-a-time,-2.0,82,0.0,0.0").unwrap();
        writeln!(file, "2024-01-01 00:00:00,-3.0,83,,0.1").unwrap();
        writeln!(file, "2024-01-01 01:00:00,bad,84,0.2,").unwrap();
        let table = load_weather_csv(file.path(), &InputSchema::default()).unwrap();
        assert_eq!(table.dropped_rows, 1);
        assert_eq!(table.records.len(), 3);
        assert_eq!(format_time(table.records[0].time), "2024-01-01 00:00:00");
        assert_eq!(table.records[0].snowfall_cm, None);
        assert_eq!(table.records[1].temperature_c, None);
        assert_eq!(table.records[2].temperature_c, Some(-1.0));
        // passthrough keeps the original cells, including the optional column
        assert_eq!(table.raw_rows[0][4], "0.1");
        assert_eq!(table.records[0].precip_mm, Some(0.1));
        assert_eq!(table.records[1].precip_mm, None);
    }

    #[test]
    fn optional_columns_parse_when_present() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,temperature_C,humidity_pct,snowfall_cm,dewpoint_C").unwrap();
        writeln!(file, "2024-01-01 00:00:00,-1.0,80,0.0,-4.5").unwrap();
        writeln!(file, "2024-01-01 01:00:00,-1.5,82,0.0,bad").unwrap();
        let table = load_weather_csv(file.path(), &InputSchema::default()).unwrap();
        assert_eq!(table.records[0].dewpoint_c, Some(-4.5));
        assert_eq!(table.records[1].dewpoint_c, None);
        // no precip column at all leaves the field undefined everywhere
        assert!(table.records.iter().all(|r| r.precip_mm.is_none()));
    }

    #[test]
    fn empty_input_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,temperature_C,humidity_pct,snowfall_cm").unwrap();
        writeln!(file, "garbage,1.0,50,0.0").unwrap();
        let err = load_weather_csv(file.path(), &InputSchema::default()).unwrap_err();
        assert!(matches!(err, CorridorError::EmptyInput));
    }

    #[test]
    fn enrich_is_deterministic() {
        let table = build_table(
            hourly_times(80),
            |i| Some(((i * 7) % 23) as f64 - 11.0),
            |i| Some(35.0 + ((i * 5) % 29) as f64),
            |i| Some((i % 4) as f64 * 0.3),
        );
        let first = enrich(table.clone(), &FeatureParams::default()).unwrap();
        let second = enrich(table, &FeatureParams::default()).unwrap();
        assert_eq!(first.csv_header(), second.csv_header());
        for i in 0..first.len() {
            assert_eq!(first.csv_row(i), second.csv_row(i));
        }
    }

    #[test]
    fn csv_shape_appends_feature_columns() {
        let table = build_table(hourly_times(20), |_| Some(1.0), |_| Some(50.0), |_| None);
        let series = enrich(table, &FeatureParams::default()).unwrap();
        let header = series.csv_header();
        assert_eq!(header.len(), 4 + FEATURE_COLUMNS.len());
        assert_eq!(header[4], "segment_id");
        assert_eq!(header.last().map(String::as_str), Some("corridor_score"));
        let row = series.csv_row(0);
        assert_eq!(row.len(), header.len());
        assert_eq!(row[4], "0");
        // admissible renders as a plain boolean
        assert_eq!(row[8], "false");
    }

    #[test]
    fn rerunning_features_overwrites_stale_derived_columns() {
        // input already carrying derived columns, as when the feature stage
        // reads its own series.csv back in
        let mut table = build_table(
            hourly_times(10),
            |i| Some(i as f64),
            |_| Some(50.0),
            |_| Some(0.0),
        );
        table.header.insert(4, "segment_id".to_string());
        table.header.push("CP".to_string());
        for row in &mut table.raw_rows {
            row.insert(4, "9".to_string());
            row.push("7.7".to_string());
        }
        let series = enrich(table, &FeatureParams::default()).unwrap();
        let header = series.csv_header();
        assert_eq!(header.len(), 6 + FEATURE_COLUMNS.len() - 2);
        assert_eq!(header.iter().filter(|h| *h == "segment_id").count(), 1);
        assert_eq!(header.iter().filter(|h| *h == "CP").count(), 1);
        assert_eq!(header[4], "segment_id");
        assert_eq!(header[5], "CP");
        assert_eq!(header[6], "S_struct");
        let first = series.csv_row(0);
        assert_eq!(first.len(), header.len());
        // the stale id and CP cells are replaced, not duplicated
        assert_eq!(first[4], "0");
        assert_eq!(first[5], "");
        let last = series.csv_row(9);
        assert_eq!(last[4], "0");
        assert_eq!(last[5], "0");
    }
}
