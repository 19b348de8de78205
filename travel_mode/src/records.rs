//! CSV input rows and entity-partitioned CSV output.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{EntityTrack, ModeError, Sample, TrackPoint};

/// Columns every input file must carry, with the accepted header aliases.
const REQUIRED_COLUMNS: [(&str, &[&str]); 5] = [
    ("entity_id", &["entity_id", "nid"]),
    ("timestamp", &["timestamp"]),
    ("latitude", &["latitude", "lat"]),
    ("longitude", &["longitude", "lon"]),
    ("step_count", &["step_count", "steps"]),
];

pub const OUTPUT_COLUMNS: [&str; 8] = [
    "entity_id",
    "latitude",
    "longitude",
    "time_delta",
    "pedometer_speed",
    "geo_speed",
    "mode",
    "is_activity_area",
];

pub const PART_FILE_NAME: &str = "part-00000.csv";
const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(alias = "nid")]
    entity_id: Option<String>,
    timestamp: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<String>,
    #[serde(alias = "lon")]
    longitude: Option<String>,
    #[serde(alias = "steps")]
    step_count: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MalformedRow {
    pub line: u64,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct ReadReport {
    pub samples: Vec<Sample>,
    pub malformed: Vec<MalformedRow>,
}

/// Read samples from CSV with a header row. Unknown columns are ignored and
/// rows that cannot be parsed are reported instead of failing the read.
pub fn read_samples<R: Read>(input: R) -> Result<ReadReport, ModeError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let headers = reader.headers()?.clone();
    for (name, aliases) in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| aliases.contains(&h)) {
            return Err(ModeError::MissingColumn(name));
        }
    }

    let mut report = ReadReport::default();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let line = err.position().map(|p| p.line()).unwrap_or(0);
                report.malformed.push(MalformedRow {
                    line,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let parsed = record
            .deserialize::<RawRow>(Some(&headers))
            .map_err(|e| e.to_string())
            .and_then(parse_row);
        match parsed {
            Ok(sample) => report.samples.push(sample),
            Err(reason) => report.malformed.push(MalformedRow { line, reason }),
        }
    }
    Ok(report)
}

pub fn read_samples_file(path: &Path) -> Result<ReadReport, ModeError> {
    read_samples(File::open(path)?)
}

fn parse_row(row: RawRow) -> Result<Sample, String> {
    let entity_id = required("entity_id", row.entity_id)?;
    let timestamp_raw = required("timestamp", row.timestamp)?;
    let timestamp = parse_timestamp(&timestamp_raw)
        .ok_or_else(|| format!("unparseable timestamp '{timestamp_raw}'"))?;
    let latitude = parse_float("latitude", required("latitude", row.latitude)?)?;
    let longitude = parse_float("longitude", required("longitude", row.longitude)?)?;
    let steps_raw = required("step_count", row.step_count)?;
    let step_count = parse_count(&steps_raw)
        .ok_or_else(|| format!("unparseable step_count '{steps_raw}'"))?;
    Ok(Sample {
        entity_id,
        timestamp,
        latitude,
        longitude,
        step_count,
    })
}

fn required(name: &str, value: Option<String>) -> Result<String, String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("missing {name}")),
    }
}

fn parse_float(name: &str, raw: String) -> Result<f64, String> {
    raw.parse::<f64>()
        .map_err(|_| format!("unparseable {name} '{raw}'"))
}

/// Epoch seconds from integer or fractional seconds, RFC 3339, or
/// `YYYY-MM-DD HH:MM:SS` taken as UTC.
///
/// Sub-second precision is dropped per value, so intervals are always measured
/// between whole seconds.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if let Some(v) = parse_count(s) {
        return Some(v);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

/// Integer, or a float truncated toward zero. Floats outside the `i64` range
/// are rejected rather than saturated.
fn parse_count(raw: &str) -> Option<i64> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= -LIMIT && v < LIMIT => Some(v.trunc() as i64),
        _ => None,
    }
}

/// How the `mode` column is rendered.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModeLabels {
    /// `1` for WALKING, `0` for TRANSIT.
    Numeric,
    Named,
}

impl Default for ModeLabels {
    fn default() -> Self {
        ModeLabels::Numeric
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutputOptions {
    pub mode_labels: ModeLabels,
    pub with_timestamp: bool,
}

pub fn write_track_csv<W: Write>(
    points: &[TrackPoint],
    output: W,
    options: &OutputOptions,
) -> Result<(), ModeError> {
    let mut writer = csv::Writer::from_writer(output);
    let mut header: Vec<&str> = OUTPUT_COLUMNS.to_vec();
    if options.with_timestamp {
        header.insert(1, "timestamp");
    }
    writer.write_record(&header)?;

    for p in points {
        let mode = match options.mode_labels {
            ModeLabels::Numeric => p.mode.code().to_string(),
            ModeLabels::Named => p.mode.label().to_string(),
        };
        let mut row = vec![
            p.entity_id.clone(),
            p.latitude.to_string(),
            p.longitude.to_string(),
            p.time_delta.to_string(),
            format!("{:.2}", p.pedometer_speed),
            format!("{:.2}", p.geo_speed),
            mode,
            if p.is_activity_area { "1" } else { "0" }.to_string(),
        ];
        if options.with_timestamp {
            row.insert(1, p.timestamp.to_string());
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Directory name for one entity's partition: `entity_id=<value>`, with every
/// byte outside `[A-Za-z0-9._-]` percent-encoded.
pub fn partition_dir_name(entity_id: &str) -> String {
    if entity_id.is_empty() {
        return format!("entity_id={NULL_PARTITION}");
    }
    let mut escaped = String::with_capacity(entity_id.len());
    for b in entity_id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            escaped.push(b as char);
        } else {
            escaped.push_str(&format!("%{:02X}", b));
        }
    }
    // "." and ".." would resolve to existing directories.
    if escaped.chars().all(|c| c == '.') {
        escaped = escaped.replace('.', "%2E");
    }
    format!("entity_id={escaped}")
}

/// Write each non-empty track to `<out_dir>/entity_id=<id>/part-00000.csv`.
pub fn write_partitioned(
    out_dir: &Path,
    tracks: &[EntityTrack],
    options: &OutputOptions,
) -> Result<Vec<PathBuf>, ModeError> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();
    for track in tracks {
        if track.points.is_empty() {
            continue;
        }
        let dir = out_dir.join(partition_dir_name(&track.entity_id));
        fs::create_dir_all(&dir)?;
        let path = dir.join(PART_FILE_NAME);
        write_track_csv(&track.points, File::create(&path)?, options)?;
        written.push(path);
    }
    Ok(written)
}
