//! Ranked summary document for an enriched series.

use std::cmp::Ordering;

use serde::Serialize;

use crate::{format_time, EnrichedSeries, FeatureParams};

/// Cap on each ranked list.
const TOP_N: usize = 12;
/// Cap on the observed snow event listing.
const SNOW_EVENTS_CAP: usize = 200;

/// One row as it appears in the summary lists.
#[derive(Clone, Debug, Serialize)]
pub struct RankedRow {
    pub time: String,
    #[serde(rename = "CP")]
    pub cp: Option<f64>,
    #[serde(rename = "SCE")]
    pub sce: Option<f64>,
    #[serde(rename = "S_struct")]
    pub s_struct: Option<f64>,
    pub admissible: bool,
    pub snowfall_cm: Option<f64>,
    pub depth_est_cm: f64,
    pub corridor_score: Option<f64>,
    pub segment_id: i64,
}

/// Parameter echo with the stress window resolved to its effective value.
#[derive(Clone, Debug, Serialize)]
pub struct SummaryParams {
    pub tct_window_hours: usize,
    pub stress_window_hours: usize,
    pub cp_threshold: f64,
    pub s_max: f64,
    pub k_depth: f64,
    pub gap_hours: f64,
}

impl SummaryParams {
    fn from_feature_params(params: &FeatureParams) -> Self {
        Self {
            tct_window_hours: params.tct_window_hours,
            stress_window_hours: params.stress_window(),
            cp_threshold: params.cp_threshold,
            s_max: params.s_max,
            k_depth: params.k_depth,
            gap_hours: params.gap_hours,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    pub rows: usize,
    pub start: Option<String>,
    pub end: Option<String>,
    pub segments: usize,
    pub params: SummaryParams,
    #[serde(rename = "top_CP")]
    pub top_cp: Vec<RankedRow>,
    pub top_depth_any: Vec<RankedRow>,
    pub top_depth_admissible: Vec<RankedRow>,
    pub top_depth_admissible_snow: Vec<RankedRow>,
    pub top_corridor_any: Vec<RankedRow>,
    pub top_corridor_admissible: Vec<RankedRow>,
    pub top_corridor_admissible_snow: Vec<RankedRow>,
    pub observed_snow_events_first200: Vec<RankedRow>,
}

/// Build the summary over the stable rows of a series. A row is stable when
/// CP, S_struct, SCE and the corridor score are all defined; only stable
/// rows are candidates for the ranked lists and the snow event listing.
pub fn build_summary(series: &EnrichedSeries, params: &FeatureParams) -> Summary {
    let stable: Vec<RankedRow> = series
        .features
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            f.cp.is_some() && f.s_struct.is_some() && f.sce.is_some() && f.corridor_score.is_some()
        })
        .map(|(i, f)| RankedRow {
            time: format_time(series.table.records[i].time),
            cp: f.cp,
            sce: f.sce,
            s_struct: f.s_struct,
            admissible: f.admissible,
            snowfall_cm: series.table.records[i].snowfall_cm,
            depth_est_cm: f.depth_est_cm,
            corridor_score: f.corridor_score,
            segment_id: f.segment_id,
        })
        .collect();

    let has_snow = |row: &RankedRow| row.snowfall_cm.map_or(false, |v| v > 0.0);
    let by_cp = |row: &RankedRow| row.cp;
    let by_depth = |row: &RankedRow| Some(row.depth_est_cm);
    let by_corridor = |row: &RankedRow| row.corridor_score;

    Summary {
        rows: series.len(),
        start: series.start_time().map(format_time),
        end: series.end_time().map(format_time),
        segments: series.segment_count(),
        params: SummaryParams::from_feature_params(params),
        top_cp: top_by(&stable, by_cp, |_| true),
        top_depth_any: top_by(&stable, by_depth, |_| true),
        top_depth_admissible: top_by(&stable, by_depth, |r| r.admissible),
        top_depth_admissible_snow: top_by(&stable, by_depth, |r| r.admissible && has_snow(r)),
        top_corridor_any: top_by(&stable, by_corridor, |_| true),
        top_corridor_admissible: top_by(&stable, by_corridor, |r| r.admissible),
        top_corridor_admissible_snow: top_by(&stable, by_corridor, |r| r.admissible && has_snow(r)),
        observed_snow_events_first200: stable
            .iter()
            .filter(|r| has_snow(r))
            .take(SNOW_EVENTS_CAP)
            .cloned()
            .collect(),
    }
}

/// Filter, stable-sort descending by key and keep the head. Ties keep time
/// order because the candidates arrive time-sorted.
fn top_by(
    rows: &[RankedRow],
    key: impl Fn(&RankedRow) -> Option<f64>,
    keep: impl Fn(&RankedRow) -> bool,
) -> Vec<RankedRow> {
    let mut picked: Vec<RankedRow> = rows.iter().filter(|r| keep(r)).cloned().collect();
    picked.sort_by(|a, b| key(b).partial_cmp(&key(a)).unwrap_or(Ordering::Equal));
    picked.truncate(TOP_N);
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{float_cell, FeatureRow, WeatherRecord, WeatherTable};
    use chrono::{Duration, TimeZone, Utc};

    fn series_from(features: Vec<FeatureRow>, snow: Vec<Option<f64>>) -> EnrichedSeries {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let records: Vec<WeatherRecord> = snow
            .iter()
            .enumerate()
            .map(|(i, s)| WeatherRecord {
                time: base + Duration::hours(i as i64),
                temperature_c: Some(0.0),
                humidity_pct: Some(50.0),
                snowfall_cm: *s,
                precip_mm: None,
                dewpoint_c: None,
            })
            .collect();
        let raw_rows = records
            .iter()
            .map(|r| {
                vec![
                    format_time(r.time),
                    "0".to_string(),
                    "50".to_string(),
                    float_cell(r.snowfall_cm),
                ]
            })
            .collect();
        let header = ["time", "temperature_C", "humidity_pct", "snowfall_cm"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        EnrichedSeries {
            table: WeatherTable {
                header,
                raw_rows,
                records,
                dropped_rows: 0,
            },
            features,
        }
    }

    fn stable_row(cp: f64, s_struct: f64, depth: f64, corridor: f64, admissible: bool) -> FeatureRow {
        FeatureRow {
            segment_id: 0,
            cp: Some(cp),
            s_struct: Some(s_struct),
            sce: Some((-s_struct).exp()),
            admissible,
            depth_est_cm: depth,
            depth_min_cm: Some(corridor),
            depth_max_cm: Some(depth),
            corridor_score: Some(corridor),
        }
    }

    fn undefined_row() -> FeatureRow {
        FeatureRow {
            segment_id: 0,
            cp: None,
            s_struct: None,
            sce: None,
            admissible: false,
            depth_est_cm: 0.0,
            depth_min_cm: None,
            depth_max_cm: None,
            corridor_score: None,
        }
    }

    #[test]
    fn unstable_rows_never_rank() {
        let features = vec![
            undefined_row(),
            stable_row(1.0, 0.1, 6.0, 5.0, true),
            undefined_row(),
            stable_row(0.5, 0.2, 4.0, 3.0, true),
        ];
        let series = series_from(features, vec![Some(1.0); 4]);
        let summary = build_summary(&series, &FeatureParams::default());
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.top_corridor_any.len(), 2);
        assert_eq!(summary.top_corridor_any[0].time, "2024-01-01 01:00:00");
        assert_eq!(summary.top_corridor_any[1].time, "2024-01-01 03:00:00");
        assert_eq!(summary.observed_snow_events_first200.len(), 2);
    }

    #[test]
    fn ranking_is_descending_with_time_order_ties() {
        let features = vec![
            stable_row(0.1, 0.0, 1.0, 1.0, false),
            stable_row(0.1, 0.0, 3.0, 3.0, false),
            stable_row(0.1, 0.0, 3.0, 3.0, false),
            stable_row(0.1, 0.0, 2.0, 2.0, false),
        ];
        let series = series_from(features, vec![None; 4]);
        let summary = build_summary(&series, &FeatureParams::default());
        let times: Vec<&str> = summary
            .top_corridor_any
            .iter()
            .map(|r| r.time.as_str())
            .collect();
        assert_eq!(
            times,
            vec![
                "2024-01-01 01:00:00",
                "2024-01-01 02:00:00",
                "2024-01-01 03:00:00",
                "2024-01-01 00:00:00",
            ]
        );
    }

    #[test]
    fn ranked_lists_truncate() {
        let features: Vec<FeatureRow> = (0..20)
            .map(|i| stable_row(0.1, 0.0, i as f64, i as f64, false))
            .collect();
        let series = series_from(features, vec![None; 20]);
        let summary = build_summary(&series, &FeatureParams::default());
        assert_eq!(summary.top_depth_any.len(), 12);
        assert_eq!(summary.top_depth_any[0].depth_est_cm, 19.0);
        assert_eq!(summary.top_depth_any[11].depth_est_cm, 8.0);
    }

    #[test]
    fn admissible_and_snow_filters_apply() {
        let features = vec![
            stable_row(1.0, 0.0, 9.0, 9.0, false),
            stable_row(1.0, 0.0, 8.0, 8.0, true),
            stable_row(1.0, 0.0, 7.0, 7.0, true),
            stable_row(1.0, 0.0, 6.0, 6.0, true),
        ];
        // snow: undefined, zero, positive, positive
        let snow = vec![None, Some(0.0), Some(0.4), Some(1.2)];
        let series = series_from(features, snow);
        let summary = build_summary(&series, &FeatureParams::default());
        assert_eq!(summary.top_depth_any.len(), 4);
        assert_eq!(summary.top_depth_admissible.len(), 3);
        let snow_depths: Vec<f64> = summary
            .top_depth_admissible_snow
            .iter()
            .map(|r| r.depth_est_cm)
            .collect();
        assert_eq!(snow_depths, vec![7.0, 6.0]);
        assert_eq!(summary.observed_snow_events_first200.len(), 2);
    }

    #[test]
    fn snow_events_cap_at_two_hundred_in_time_order() {
        let features: Vec<FeatureRow> = (0..230)
            .map(|_| stable_row(0.5, 0.0, 2.0, 2.0, true))
            .collect();
        let series = series_from(features, vec![Some(1.0); 230]);
        let summary = build_summary(&series, &FeatureParams::default());
        let events = &summary.observed_snow_events_first200;
        assert_eq!(events.len(), 200);
        assert_eq!(events[0].time, "2024-01-01 00:00:00");
        for pair in events.windows(2) {
            assert!(pair[0].time < pair[1].time);
        }
    }

    #[test]
    fn summary_serializes_with_expected_keys() {
        let features = vec![stable_row(1.0, 0.1, 5.0, 4.0, true)];
        let series = series_from(features, vec![Some(0.6)]);
        let summary = build_summary(&series, &FeatureParams::default());
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["rows"], 1);
        assert_eq!(value["segments"], 1);
        assert_eq!(value["params"]["tct_window_hours"], 24);
        assert_eq!(value["params"]["stress_window_hours"], 24);
        assert!(value["top_CP"].is_array());
        assert!(value["observed_snow_events_first200"].is_array());
        let row = &value["top_CP"][0];
        assert_eq!(row["CP"], 1.0);
        assert!(row["SCE"].is_number());
        assert!(row["S_struct"].is_number());
        assert_eq!(row["admissible"], true);
        assert_eq!(row["segment_id"], 0);
    }
}
