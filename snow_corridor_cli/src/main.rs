use std::fs;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use snow_corridor::{
    build_summary, calibrate, enrich, load_calibration_csv, load_weather_csv, CalibrationOutcome,
    CalibrationParams, CalibrationReport, CalibrationStatus, CalibrationTable, EnrichedSeries,
    FeatureParams, InputSchema, Summary,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Corridor score derivation and snowfall calibration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive corridor features from a weather CSV and write series/summary artifacts
    Features(FeatureArgs),
    /// Calibrate forward corridor scores against observed snowfall
    Calibrate(CalibrateArgs),
    /// Run the feature stage and feed it straight into calibration
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct FeatureArgs {
    /// Weather CSV with time, temperature_C, humidity_pct and snowfall_cm columns
    #[arg(long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output directory for series.csv and summary.json
    #[arg(long, default_value = "out", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    /// Trailing window (hours) for the temperature/humidity ranges
    #[arg(long, default_value_t = 24)]
    tct_window_hours: usize,

    /// Trailing window (hours) for structural stress (defaults to the range window)
    #[arg(long)]
    stress_window_hours: Option<usize>,

    /// Minimum CP for admissibility
    #[arg(long, default_value_t = 0.08)]
    cp_threshold: f64,

    /// Maximum structural stress for admissibility
    #[arg(long, default_value_t = 2.5)]
    s_max: f64,

    /// Depth scaling constant (cm)
    #[arg(long, default_value_t = 13.0)]
    k_depth: f64,

    /// Gap (hours) that starts a new segment
    #[arg(long, default_value_t = 6.0)]
    gap_hours: f64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CalibrateArgs {
    /// Series CSV carrying timestamp, corridor score and snowfall columns
    #[arg(long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output directory for predictions.csv and calibration_report.json
    #[arg(long, default_value = "out", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    /// Forward horizon (hours)
    #[arg(long, default_value_t = 24)]
    horizon_hours: usize,

    /// Leading fraction of valid rows used for each per-segment fit
    #[arg(long, default_value_t = 0.7)]
    train_frac: f64,

    /// Minimum valid rows a segment needs before fitting
    #[arg(long, default_value_t = 48)]
    min_valid_points: usize,

    /// Scale applied to snow predictions to express settled depth
    #[arg(long, default_value_t = 1.0)]
    rho_scale: f64,

    /// Timestamp column name
    #[arg(long, default_value = "time")]
    time_col: String,

    /// Segment id column name (all rows share one segment when absent)
    #[arg(long, default_value = "segment_id")]
    segment_col: String,

    /// Corridor score column name
    #[arg(long, default_value = "corridor_score")]
    score_col: String,

    /// Observed snowfall column name
    #[arg(long, default_value = "snowfall_cm")]
    snow_col: String,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Weather CSV with time, temperature_C, humidity_pct and snowfall_cm columns
    #[arg(long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output directory for all four artifacts
    #[arg(long, default_value = "out", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    /// Trailing window (hours) for the temperature/humidity ranges
    #[arg(long, default_value_t = 24)]
    tct_window_hours: usize,

    /// Trailing window (hours) for structural stress (defaults to the range window)
    #[arg(long)]
    stress_window_hours: Option<usize>,

    /// Minimum CP for admissibility
    #[arg(long, default_value_t = 0.08)]
    cp_threshold: f64,

    /// Maximum structural stress for admissibility
    #[arg(long, default_value_t = 2.5)]
    s_max: f64,

    /// Depth scaling constant (cm)
    #[arg(long, default_value_t = 13.0)]
    k_depth: f64,

    /// Gap (hours) that starts a new segment
    #[arg(long, default_value_t = 6.0)]
    gap_hours: f64,

    /// Forward horizon (hours)
    #[arg(long, default_value_t = 24)]
    horizon_hours: usize,

    /// Leading fraction of valid rows used for each per-segment fit
    #[arg(long, default_value_t = 0.7)]
    train_frac: f64,

    /// Minimum valid rows a segment needs before fitting
    #[arg(long, default_value_t = 48)]
    min_valid_points: usize,

    /// Scale applied to snow predictions to express settled depth
    #[arg(long, default_value_t = 1.0)]
    rho_scale: f64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Features(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
        Command::Calibrate(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
        Command::Run(args) => {
            if args.verbose {
                "debug"
            } else {
                "info"
            }
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Features(args) => handle_features(args),
        Command::Calibrate(args) => handle_calibrate(args),
        Command::Run(args) => handle_run(args),
    }
}

fn handle_features(args: FeatureArgs) -> Result<()> {
    let mut params = FeatureParams::default();
    params.tct_window_hours = args.tct_window_hours;
    params.stress_window_hours = args.stress_window_hours;
    params.cp_threshold = args.cp_threshold;
    params.s_max = args.s_max;
    params.k_depth = args.k_depth;
    params.gap_hours = args.gap_hours;

    let table = load_weather_csv(&args.input, &InputSchema::default())
        .with_context(|| format!("failed to load {}", args.input.display()))?;
    if table.dropped_rows > 0 {
        warn!(
            "Dropped {} rows with unparseable timestamps",
            table.dropped_rows
        );
    }
    let series = enrich(table, &params)?;
    let summary = build_summary(&series, &params);
    let summary_json =
        serde_json::to_string_pretty(&summary).context("failed to encode summary")?;

    log_feature_summary(&summary);
    write_feature_outputs(&series, &summary_json, &args.out_dir)?;
    Ok(())
}

fn handle_calibrate(args: CalibrateArgs) -> Result<()> {
    let mut params = CalibrationParams::default();
    params.horizon_hours = args.horizon_hours;
    params.train_frac = args.train_frac;
    params.min_valid_points = args.min_valid_points;
    params.rho_scale = args.rho_scale;
    params.time_col = args.time_col;
    params.segment_col = args.segment_col;
    params.score_col = args.score_col;
    params.snow_col = args.snow_col;

    let table = load_calibration_csv(&args.input, &params)
        .with_context(|| format!("failed to load {}", args.input.display()))?;
    if table.dropped_rows > 0 {
        warn!(
            "Dropped {} rows with unparseable timestamps or segment ids",
            table.dropped_rows
        );
    }
    let outcome = calibrate(table, &params)?;
    write_calibration_outputs(&outcome, &args.out_dir)?;
    log_calibration_summary(&outcome.report);
    Ok(())
}

fn handle_run(args: RunArgs) -> Result<()> {
    let mut feature_params = FeatureParams::default();
    feature_params.tct_window_hours = args.tct_window_hours;
    feature_params.stress_window_hours = args.stress_window_hours;
    feature_params.cp_threshold = args.cp_threshold;
    feature_params.s_max = args.s_max;
    feature_params.k_depth = args.k_depth;
    feature_params.gap_hours = args.gap_hours;

    let mut calib_params = CalibrationParams::default();
    calib_params.horizon_hours = args.horizon_hours;
    calib_params.train_frac = args.train_frac;
    calib_params.min_valid_points = args.min_valid_points;
    calib_params.rho_scale = args.rho_scale;

    let table = load_weather_csv(&args.input, &InputSchema::default())
        .with_context(|| format!("failed to load {}", args.input.display()))?;
    if table.dropped_rows > 0 {
        warn!(
            "Dropped {} rows with unparseable timestamps",
            table.dropped_rows
        );
    }
    let series = enrich(table, &feature_params)?;
    let summary = build_summary(&series, &feature_params);
    let summary_json =
        serde_json::to_string_pretty(&summary).context("failed to encode summary")?;
    let outcome = calibrate(CalibrationTable::from_enriched(&series), &calib_params)?;

    log_feature_summary(&summary);
    write_feature_outputs(&series, &summary_json, &args.out_dir)?;
    write_calibration_outputs(&outcome, &args.out_dir)?;
    log_calibration_summary(&outcome.report);
    Ok(())
}

fn write_feature_outputs(series: &EnrichedSeries, summary_json: &str, out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let series_path = out_dir.join("series.csv");
    let summary_path = out_dir.join("summary.json");
    write_series_csv(series, &series_path)?;
    fs::write(&summary_path, summary_json)
        .with_context(|| format!("failed to write {}", summary_path.display()))?;
    info!("Wrote series CSV: {}", series_path.display());
    info!("Wrote summary JSON: {}", summary_path.display());
    Ok(())
}

fn write_series_csv(series: &EnrichedSeries, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(series.csv_header())?;
    for i in 0..series.len() {
        writer.write_record(series.csv_row(i))?;
    }
    writer.flush()?;
    Ok(())
}

fn write_calibration_outputs(outcome: &CalibrationOutcome, out_dir: &Path) -> Result<()> {
    let report_json = serde_json::to_string_pretty(&outcome.report)
        .context("failed to encode calibration report")?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let predictions_path = out_dir.join("predictions.csv");
    let report_path = out_dir.join("calibration_report.json");
    let file = File::create(&predictions_path)
        .with_context(|| format!("failed to create {}", predictions_path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(outcome.csv_header())?;
    for i in 0..outcome.len() {
        writer.write_record(outcome.csv_row(i))?;
    }
    writer.flush()?;
    fs::write(&report_path, report_json)
        .with_context(|| format!("failed to write {}", report_path.display()))?;
    info!("Wrote predictions CSV: {}", predictions_path.display());
    info!("Wrote calibration report: {}", report_path.display());
    Ok(())
}

fn log_feature_summary(summary: &Summary) {
    info!("Corridor feature run complete");
    info!("Rows: {} Segments: {}", summary.rows, summary.segments);
    if let (Some(start), Some(end)) = (&summary.start, &summary.end) {
        info!("Time: {} -> {}", start, end);
    }
    if let Some(best) = summary.top_depth_any.first() {
        info!(
            "Best depth overall (may be inadmissible): {:.2} cm at {}",
            best.depth_est_cm, best.time
        );
    }
    if let Some(best) = summary.top_depth_admissible.first() {
        info!(
            "Best admissible depth: {:.2} cm at {} (CP {:.3})",
            best.depth_est_cm,
            best.time,
            best.cp.unwrap_or(0.0)
        );
    }
    if let Some(best) = summary.top_corridor_any.first() {
        info!(
            "Best corridor score overall: {:.2} at {}",
            best.corridor_score.unwrap_or(0.0),
            best.time
        );
    }
    if let Some(best) = summary.top_corridor_admissible.first() {
        info!(
            "Best admissible corridor score: {:.2} at {}",
            best.corridor_score.unwrap_or(0.0),
            best.time
        );
    }
}

fn log_calibration_summary(report: &CalibrationReport) {
    info!("Calibration run complete");
    info!(
        "Rows: {} Segments: {}",
        report.input_rows,
        report.per_segment.len()
    );
    if let (Some(start), Some(end)) = (&report.start, &report.end) {
        info!("Time: {} -> {}", start, end);
    }
    match report.global_alpha_median {
        Some(alpha) => info!("Global alpha (median across segments): {:.6}", alpha),
        None => warn!("No segment produced a fitted alpha"),
    }
    if report.global_metrics.n > 0 {
        info!(
            "Global fit: n {} mae {} rmse {} corr {}",
            report.global_metrics.n,
            metric_cell(report.global_metrics.mae),
            metric_cell(report.global_metrics.rmse),
            metric_cell(report.global_metrics.corr)
        );
    }
    let example = report
        .per_segment
        .iter()
        .filter(|s| s.note == CalibrationStatus::Ok)
        .max_by(|a, b| {
            let ca = a.test_metrics_seg.corr.unwrap_or(f64::NEG_INFINITY);
            let cb = b.test_metrics_seg.corr.unwrap_or(f64::NEG_INFINITY);
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });
    if let Some(seg) = example {
        info!(
            "Example segment {}: alpha {:.6} test mae {} corr {}",
            seg.segment_id,
            seg.alpha_seg.unwrap_or(0.0),
            metric_cell(seg.test_metrics_seg.mae),
            metric_cell(seg.test_metrics_seg.corr)
        );
    }
}

fn metric_cell(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.4}", v))
        .unwrap_or_else(|| "null".to_string())
}
