use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use travel_mode::classify::rule_table;
use travel_mode::records::read_samples_file;
use travel_mode::{
    process_batch, write_partitioned, EntityOutcome, EntityTrack, ExtendedPattern, ModeLabels,
    OutputOptions, Params, ReadReport, Sample, SmoothingSchedule,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Walking/transit mode estimation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify trajectories and write entity-partitioned CSV output
    Classify(ClassifyArgs),
    /// Report per-entity pipeline statistics without writing partitions
    Diagnose(DiagnoseArgs),
    /// Print the effective parameters as JSON
    Params(ParamsArgs),
}

#[derive(Args, Debug, Default)]
struct ParamArgs {
    /// JSON parameter file; flags below override its values
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Shortest accepted sampling interval (seconds)
    #[arg(long)]
    min_interval: Option<i64>,

    /// Longest accepted sampling interval (seconds)
    #[arg(long)]
    max_interval: Option<i64>,

    /// Highest plausible pedometer speed (steps/s)
    #[arg(long)]
    max_step_rate: Option<f64>,

    /// Highest plausible geodesic speed (m/s)
    #[arg(long)]
    max_geo_speed: Option<f64>,

    /// Time window for mode smoothing (seconds)
    #[arg(long)]
    smoothing_window: Option<i64>,

    /// Number of neighbour smoothing passes
    #[arg(long, conflicts_with = "until_stable")]
    smoothing_passes: Option<usize>,

    /// Repeat neighbour smoothing until stable, up to this many passes
    #[arg(long)]
    until_stable: Option<usize>,

    /// Skip the extended smoothing pass
    #[arg(long, action = ArgAction::SetTrue)]
    no_extended_smoothing: bool,

    /// Neighbour the extended pass compares against
    #[arg(long, value_enum)]
    extended_pattern: Option<ExtendedPatternOpt>,

    /// Minimum distance between dwell locations (meters)
    #[arg(long)]
    activity_separation: Option<f64>,
}

#[derive(Parser, Debug)]
struct ClassifyArgs {
    /// CSV files or directories of CSV files
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Output directory for entity partitions
    #[arg(short, long, default_value = "mode_output", value_hint = ValueHint::DirPath)]
    output: PathBuf,

    /// Replace an existing, non-empty output directory
    #[arg(long, action = ArgAction::SetTrue)]
    overwrite: bool,

    /// Encoding of the mode column
    #[arg(long, value_enum, default_value_t = ModeLabelsOpt::Numeric)]
    mode_labels: ModeLabelsOpt,

    /// Include the timestamp column in output rows
    #[arg(long, action = ArgAction::SetTrue)]
    with_timestamp: bool,

    /// Worker threads (defaults to one per core)
    #[arg(long)]
    threads: Option<usize>,

    #[command(flatten)]
    params: ParamArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// CSV files or directories of CSV files
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "mode_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    params: ParamArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ParamsArgs {
    #[command(flatten)]
    params: ParamArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ExtendedPatternOpt {
    Continuation,
    Bracket,
}

impl From<ExtendedPatternOpt> for ExtendedPattern {
    fn from(value: ExtendedPatternOpt) -> Self {
        match value {
            ExtendedPatternOpt::Continuation => ExtendedPattern::RunContinuation,
            ExtendedPatternOpt::Bracket => ExtendedPattern::RunBracket,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeLabelsOpt {
    Numeric,
    Named,
}

impl From<ModeLabelsOpt> for ModeLabels {
    fn from(value: ModeLabelsOpt) -> Self {
        match value {
            ModeLabelsOpt::Numeric => ModeLabels::Numeric,
            ModeLabelsOpt::Named => ModeLabels::Named,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Classify(args) => args.verbose,
        Command::Diagnose(args) => args.verbose,
        Command::Params(_) => false,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Classify(args) => handle_classify(args),
        Command::Diagnose(args) => handle_diagnose(args),
        Command::Params(args) => handle_params(args),
    }
}

fn resolve_params(args: &ParamArgs) -> Result<Params> {
    let mut params = match args.config.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Params::from_json(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => Params::default(),
    };

    if let Some(v) = args.min_interval {
        params.min_interval_s = v;
    }
    if let Some(v) = args.max_interval {
        params.max_interval_s = v;
    }
    if let Some(v) = args.max_step_rate {
        params.max_step_rate = v;
    }
    if let Some(v) = args.max_geo_speed {
        params.max_geo_speed_mps = v;
    }
    if let Some(v) = args.smoothing_window {
        params.smoothing_window_s = v;
    }
    if let Some(passes) = args.smoothing_passes {
        params.smoothing = SmoothingSchedule::Fixed { passes };
    }
    if let Some(max_passes) = args.until_stable {
        params.smoothing = SmoothingSchedule::UntilStable { max_passes };
    }
    if args.no_extended_smoothing {
        params.extended_smoothing = false;
    }
    if let Some(pattern) = args.extended_pattern {
        params.extended_pattern = pattern.into();
    }
    if let Some(v) = args.activity_separation {
        params.activity_separation_m = v;
    }

    params.validate().context("invalid parameters")?;
    Ok(params)
}

/// Expand directories into the CSV files beneath them, sorted by path.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(input).follow_links(true) {
                let entry =
                    entry.with_context(|| format!("failed to walk {}", input.display()))?;
                let is_csv = entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false);
                if entry.file_type().is_file() && is_csv {
                    found.push(entry.into_path());
                }
            }
            if found.is_empty() {
                warn!("No CSV files under {}", input.display());
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    if files.is_empty() {
        return Err(anyhow!("no input files found"));
    }
    Ok(files)
}

struct LoadedInputs {
    samples: Vec<Sample>,
    summaries: Vec<InputSummary>,
}

#[derive(Serialize, Debug)]
struct InputSummary {
    path: String,
    rows: usize,
    malformed: usize,
}

fn load_inputs(files: &[PathBuf]) -> Result<LoadedInputs> {
    let reports: Vec<(PathBuf, ReadReport)> = files
        .par_iter()
        .map(|path| -> Result<(PathBuf, ReadReport)> {
            let report = read_samples_file(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok((path.clone(), report))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut samples = Vec::new();
    let mut summaries = Vec::with_capacity(reports.len());
    for (path, report) in reports {
        if !report.malformed.is_empty() {
            warn!(
                "{}: skipped {} malformed row(s)",
                path.display(),
                report.malformed.len()
            );
            for row in report.malformed.iter().take(5) {
                debug!("{}:{}: {}", path.display(), row.line, row.reason);
            }
        }
        summaries.push(InputSummary {
            path: path.display().to_string(),
            rows: report.samples.len() + report.malformed.len(),
            malformed: report.malformed.len(),
        });
        samples.extend(report.samples);
    }
    Ok(LoadedInputs { samples, summaries })
}

#[derive(Serialize, Debug)]
struct FailedEntity {
    entity_id: String,
    error: String,
}

/// Separate successful tracks from failed entities, logging each failure.
fn split_outcomes(outcomes: Vec<EntityOutcome>) -> (Vec<EntityTrack>, Vec<FailedEntity>) {
    let mut tracks = Vec::with_capacity(outcomes.len());
    let mut failed = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(track) => tracks.push(track),
            Err(err) => {
                warn!("Skipping entity {}: {}", outcome.entity_id, err);
                failed.push(FailedEntity {
                    entity_id: outcome.entity_id,
                    error: err.to_string(),
                });
            }
        }
    }
    (tracks, failed)
}

#[derive(Serialize, Debug)]
struct RunManifest<'a> {
    tool: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    params: &'a Params,
    params_sha256: String,
    inputs: Vec<InputSummary>,
    entities: usize,
    failed_entities: Vec<FailedEntity>,
    partitions: usize,
    output_rows: usize,
}

fn prepare_output_dir(path: &Path, overwrite: bool) -> Result<()> {
    if path.is_file() {
        return Err(anyhow!("output path {} is a file", path.display()));
    }
    if path.is_dir() {
        let occupied = fs::read_dir(path)
            .with_context(|| format!("failed to list {}", path.display()))?
            .next()
            .is_some();
        if occupied {
            if !overwrite {
                return Err(anyhow!(
                    "output directory {} is not empty (pass --overwrite to replace it)",
                    path.display()
                ));
            }
            fs::remove_dir_all(path)
                .with_context(|| format!("failed to clear {}", path.display()))?;
        }
    }
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(())
}

fn handle_classify(args: ClassifyArgs) -> Result<()> {
    let started_at = Utc::now();
    let params = resolve_params(&args.params)?;
    let fingerprint = params.fingerprint()?;
    info!("Parameters fingerprint {}", &fingerprint[..12]);

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build_global()
            .context("failed to configure worker threads")?;
    }

    let files = collect_inputs(&args.inputs)?;
    let t_parse = Instant::now();
    let loaded = load_inputs(&files)?;
    if args.profile || args.verbose {
        info!(
            "Parse stage: {:.1} ms ({} files, {} samples)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            files.len(),
            loaded.samples.len()
        );
    }

    let t_compute = Instant::now();
    let outcomes = process_batch(loaded.samples, &params)?;
    let entities = outcomes.len();
    let (tracks, failed) = split_outcomes(outcomes);
    if args.profile || args.verbose {
        info!(
            "Compute stage: {:.1} ms ({} entities)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            entities
        );
    }

    prepare_output_dir(&args.output, args.overwrite)?;
    let options = OutputOptions {
        mode_labels: args.mode_labels.into(),
        with_timestamp: args.with_timestamp,
    };
    let t_write = Instant::now();
    let written = write_partitioned(&args.output, &tracks, &options)
        .with_context(|| format!("failed to write partitions under {}", args.output.display()))?;
    let output_rows: usize = tracks.iter().map(|t| t.points.len()).sum();
    if args.profile || args.verbose {
        info!(
            "Write stage: {:.1} ms ({} partitions)",
            t_write.elapsed().as_secs_f64() * 1000.0,
            written.len()
        );
    }

    let failed_count = failed.len();
    let manifest = RunManifest {
        tool: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        started_at,
        finished_at: Utc::now(),
        params: &params,
        params_sha256: fingerprint,
        inputs: loaded.summaries,
        entities,
        failed_entities: failed,
        partitions: written.len(),
        output_rows,
    };
    let manifest_path = args.output.join("_manifest.json");
    let text = serde_json::to_string_pretty(&manifest)?;
    fs::write(&manifest_path, text)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;
    let success_path = args.output.join("_SUCCESS");
    fs::write(&success_path, b"")
        .with_context(|| format!("failed to write {}", success_path.display()))?;

    if failed_count > 0 {
        warn!("{} of {} entities failed", failed_count, entities);
    }
    info!(
        "Wrote {} rows in {} partitions: {}",
        output_rows,
        written.len(),
        args.output.display()
    );
    Ok(())
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let files = collect_inputs(&args.inputs)?;
    let loaded = load_inputs(&files)?;
    let outcomes = process_batch(loaded.samples, &params)?;
    let report = render_report(&loaded.summaries, &outcomes);

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Diagnostic report written: {}", args.output.display());
    }
    Ok(())
}

fn render_report(inputs: &[InputSummary], outcomes: &[EntityOutcome]) -> String {
    let mut report = String::new();
    for input in inputs {
        report.push_str(&format!("FILE: {}\n", input.path));
        report.push_str(&format!("  rows: {}\n", input.rows));
        report.push_str(&format!("  malformed: {}\n", input.malformed));
    }
    report.push('\n');

    report.push_str("RULES:\n");
    for (rule, mode) in rule_table() {
        report.push_str(&format!(
            "  {}. {:?} -> {} ({})\n",
            rule.number(),
            rule,
            mode,
            rule.description()
        ));
    }
    report.push('\n');

    for outcome in outcomes {
        report.push_str(&format!("ENTITY: {}\n", outcome.entity_id));
        let track = match &outcome.result {
            Ok(track) => track,
            Err(err) => {
                report.push_str(&format!("  error: {}\n\n", err));
                continue;
            }
        };
        let stats = &track.stats;
        report.push_str(&format!("  input: {}\n", stats.input_samples));
        report.push_str(&format!(
            "  noise: retained={} dropped={} (first={}, interval={}, step_rate={}, geo_speed={})\n",
            stats.noise.retained,
            stats.noise.dropped(),
            stats.noise.no_reference,
            stats.noise.interval,
            stats.noise.step_rate,
            stats.noise.geo_speed
        ));
        if !stats.rule_hits.is_empty() {
            let hits: Vec<String> = stats
                .rule_hits
                .iter()
                .map(|(rule, count)| format!("{}={}", rule.number(), count))
                .collect();
            report.push_str(&format!("  rules: {}\n", hits.join(", ")));
        }
        report.push_str(&format!("  smoothing_changes: {}\n", stats.smoothing_changes));
        report.push_str(&format!(
            "  stationary: candidates={} activity_areas={}\n",
            stats.stationary_candidates, stats.activity_areas
        ));
        let transit = track
            .points
            .iter()
            .filter(|p| p.mode == travel_mode::Mode::Transit)
            .count();
        report.push_str(&format!(
            "  output: {} (transit={}, walking={}, dropped_walking={})\n",
            stats.output_points,
            transit,
            stats.output_points - transit,
            stats.dropped_walking
        ));
        report.push('\n');
    }
    report
}

fn handle_params(args: ParamsArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", params.to_json()?)?;
    Ok(())
}
