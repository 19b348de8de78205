//! Travel-mode estimation and activity-area recognition for GPS + pedometer trajectories.
//!
//! Each entity's samples run through a fixed sequence of pure stages:
//! ordering, kinematics, noise rejection, rule-based classification, mode
//! smoothing and activity-area detection. Entities never interact, so a batch
//! is processed one entity per rayon task.

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub mod activity;
pub mod classify;
pub mod geo;
pub mod kinematics;
pub mod noise;
pub mod records;
pub mod sequence;
pub mod smooth;

pub use classify::{classify, RuleId, Speeds};
pub use geo::{haversine_distance, EARTH_RADIUS_M};
pub use noise::{DropReason, NoiseStats};
pub use records::{read_samples, write_partitioned, write_track_csv, MalformedRow, ModeLabels, OutputOptions, ReadReport};

#[derive(Error, Debug)]
pub enum ModeError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("entity {entity}: invalid sample at timestamp {timestamp}: {reason}")]
    InvalidSample {
        entity: String,
        timestamp: i64,
        reason: String,
    },
    #[error("input is missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Binary travel mode. The discriminants are the numeric output encoding.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Transit = 0,
    Walking = 1,
}

impl Mode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Mode::Transit),
            1 => Some(Mode::Walking),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::Transit => "TRANSIT",
            Mode::Walking => "WALKING",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How many times the neighbour-flip smoothing pass is applied.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmoothingSchedule {
    /// Exactly `passes` passes.
    Fixed { passes: usize },
    /// Repeat until a pass changes nothing, at most `max_passes` times.
    UntilStable { max_passes: usize },
}

impl Default for SmoothingSchedule {
    fn default() -> Self {
        SmoothingSchedule::Fixed { passes: 2 }
    }
}

/// Which neighbour the extended smoothing pass compares the adjacent sample against.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedPattern {
    /// `next` must agree with `next_next` (and `prev` with `prev_prev`).
    RunContinuation,
    /// `next` must agree with `prev_prev` (and `prev` with `next_next`), absorbing
    /// two-sample runs bracketed by the other mode.
    RunBracket,
}

impl Default for ExtendedPattern {
    fn default() -> Self {
        ExtendedPattern::RunContinuation
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub min_interval_s: i64,
    pub max_interval_s: i64,
    pub min_step_rate: f64,
    pub max_step_rate: f64,
    pub max_geo_speed_mps: f64,
    pub earth_radius_m: f64,
    pub transit_speed_mps: f64,
    pub idle_step_rate: f64,
    pub idle_drift_mps: f64,
    pub transit_ratio: f64,
    pub smoothing_window_s: i64,
    pub smoothing: SmoothingSchedule,
    pub extended_smoothing: bool,
    pub extended_pattern: ExtendedPattern,
    pub activity_separation_m: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            min_interval_s: 20,
            max_interval_s: 60,
            min_step_rate: 0.0,
            max_step_rate: 5.0,
            max_geo_speed_mps: 55.0,
            earth_radius_m: EARTH_RADIUS_M,
            transit_speed_mps: 4.0,
            idle_step_rate: 0.3,
            idle_drift_mps: 1.0,
            transit_ratio: 4.0,
            smoothing_window_s: 300,
            smoothing: SmoothingSchedule::default(),
            extended_smoothing: true,
            extended_pattern: ExtendedPattern::default(),
            activity_separation_m: 300.0,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), ModeError> {
        // Pedometer speed divides by the interval, so zero must stay out of range.
        if self.min_interval_s < 1 {
            return Err(ModeError::InvalidParameter(
                "min_interval_s must be at least 1".into(),
            ));
        }
        if self.max_interval_s < self.min_interval_s {
            return Err(ModeError::InvalidParameter(format!(
                "max_interval_s ({}) is below min_interval_s ({})",
                self.max_interval_s, self.min_interval_s
            )));
        }
        let finite = [
            ("min_step_rate", self.min_step_rate),
            ("max_step_rate", self.max_step_rate),
            ("max_geo_speed_mps", self.max_geo_speed_mps),
            ("earth_radius_m", self.earth_radius_m),
            ("transit_speed_mps", self.transit_speed_mps),
            ("idle_step_rate", self.idle_step_rate),
            ("idle_drift_mps", self.idle_drift_mps),
            ("transit_ratio", self.transit_ratio),
            ("activity_separation_m", self.activity_separation_m),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(ModeError::InvalidParameter(format!("{name} must be finite")));
            }
        }
        if self.max_step_rate < self.min_step_rate {
            return Err(ModeError::InvalidParameter(
                "max_step_rate is below min_step_rate".into(),
            ));
        }
        if self.earth_radius_m <= 0.0 {
            return Err(ModeError::InvalidParameter(
                "earth_radius_m must be positive".into(),
            ));
        }
        // The ratio rules divide by pedometer speed once it exceeds this bound.
        if self.idle_step_rate < 0.0 {
            return Err(ModeError::InvalidParameter(
                "idle_step_rate must be non-negative".into(),
            ));
        }
        if self.smoothing_window_s < 0 {
            return Err(ModeError::InvalidParameter(
                "smoothing_window_s must be non-negative".into(),
            ));
        }
        if let SmoothingSchedule::UntilStable { max_passes: 0 } = self.smoothing {
            return Err(ModeError::InvalidParameter(
                "until_stable smoothing needs max_passes >= 1".into(),
            ));
        }
        if self.activity_separation_m < 0.0 {
            return Err(ModeError::InvalidParameter(
                "activity_separation_m must be non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn interval_in_range(&self, time_delta: i64) -> bool {
        time_delta >= self.min_interval_s && time_delta <= self.max_interval_s
    }

    pub fn to_json(&self) -> Result<String, ModeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ModeError> {
        let params: Params = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    /// SHA-256 of the compact JSON encoding, used to tag run outputs.
    pub fn fingerprint(&self) -> Result<String, ModeError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(sha256_hex(&bytes))
    }
}

/// One raw observation of one entity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub entity_id: String,
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub step_count: i64,
}

impl Sample {
    pub fn new(
        entity_id: impl Into<String>,
        timestamp: i64,
        latitude: f64,
        longitude: f64,
        step_count: i64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            latitude,
            longitude,
            step_count,
        }
    }
}

/// A fully enriched sample that survived both filtering points.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    pub entity_id: String,
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Interval the speeds were derived from; always within the accepted interval range.
    pub time_delta: i64,
    /// Spacing to the previous sample that passed the interval check.
    pub gap_s: Option<i64>,
    pub pedometer_speed: f64,
    pub geo_speed: f64,
    pub mode: Mode,
    /// Classifier rule that produced the initial label, before smoothing.
    pub rule: RuleId,
    pub is_stationary_candidate: bool,
    pub is_activity_area: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityStats {
    pub input_samples: usize,
    pub noise: NoiseStats,
    pub rule_hits: BTreeMap<RuleId, usize>,
    pub smoothing_changes: usize,
    pub stationary_candidates: usize,
    pub activity_areas: usize,
    pub dropped_walking: usize,
    pub output_points: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntityTrack {
    pub entity_id: String,
    pub points: Vec<TrackPoint>,
    pub stats: EntityStats,
}

/// Per-entity result of a batch run; one entity failing never affects the others.
#[derive(Debug)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub result: Result<EntityTrack, ModeError>,
}

/// Run the full pipeline over one entity's samples (any order).
pub fn process_entity(
    entity_id: &str,
    samples: Vec<Sample>,
    params: &Params,
) -> Result<EntityTrack, ModeError> {
    params.validate()?;
    run_entity(entity_id, samples, params)
}

fn run_entity(
    entity_id: &str,
    samples: Vec<Sample>,
    params: &Params,
) -> Result<EntityTrack, ModeError> {
    let mut stats = EntityStats {
        input_samples: samples.len(),
        ..EntityStats::default()
    };

    let ordered = sequence::order_entity(entity_id, samples)?;
    let kinematic = kinematics::estimate(ordered, params)?;
    let (filtered, noise_stats) = noise::filter(kinematic, params);
    stats.noise = noise_stats;

    let labeled = classify::classify_points(filtered, params);
    for point in &labeled {
        *stats.rule_hits.entry(point.rule).or_insert(0) += 1;
    }

    let (smoothed, changes) = smooth::smooth_points(labeled, params);
    stats.smoothing_changes = changes;

    let (points, activity_stats) = activity::detect(smoothed, params);
    stats.stationary_candidates = activity_stats.stationary_candidates;
    stats.activity_areas = activity_stats.activity_areas;
    stats.dropped_walking = activity_stats.dropped_walking;
    stats.output_points = points.len();

    debug!(
        entity = entity_id,
        input = stats.input_samples,
        retained = stats.noise.retained,
        smoothed = stats.smoothing_changes,
        activity_areas = stats.activity_areas,
        output = stats.output_points,
        "entity processed"
    );

    Ok(EntityTrack {
        entity_id: entity_id.to_string(),
        points,
        stats,
    })
}

/// Group samples by entity and process every entity in parallel.
///
/// Outcomes are returned in ascending entity-id order. Invalid parameters fail
/// the whole call; anything wrong with one entity's samples only fails that entity.
pub fn process_batch(
    samples: Vec<Sample>,
    params: &Params,
) -> Result<Vec<EntityOutcome>, ModeError> {
    params.validate()?;
    let groups: Vec<(String, Vec<Sample>)> =
        sequence::group_by_entity(samples).into_iter().collect();
    Ok(groups
        .into_par_iter()
        .map(|(entity_id, samples)| {
            let result = run_entity(&entity_id, samples, params);
            EntityOutcome { entity_id, result }
        })
        .collect())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(entity: &str, t0: i64, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                Sample::new(
                    entity,
                    t0 + 30 * i as i64,
                    13.7563 + 0.0001 * i as f64,
                    100.5018,
                    (i as i64) * 40,
                )
            })
            .collect()
    }

    #[test]
    fn test_mode_encoding() {
        assert_eq!(Mode::Walking.code(), 1);
        assert_eq!(Mode::Transit.code(), 0);
        assert_eq!(Mode::from_code(1), Some(Mode::Walking));
        assert_eq!(Mode::from_code(0), Some(Mode::Transit));
        assert_eq!(Mode::from_code(2), None);
        assert_eq!(Mode::Walking.to_string(), "WALKING");
    }

    #[test]
    fn test_default_params_are_valid() {
        let params = Params::default();
        params.validate().expect("defaults validate");
        assert_eq!(params.smoothing, SmoothingSchedule::Fixed { passes: 2 });
        assert!(params.interval_in_range(20));
        assert!(params.interval_in_range(60));
        assert!(!params.interval_in_range(19));
        assert!(!params.interval_in_range(61));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut params = Params::default();
        params.min_interval_s = 0;
        assert!(matches!(params.validate(), Err(ModeError::InvalidParameter(_))));

        let mut params = Params::default();
        params.max_interval_s = 10;
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.idle_step_rate = -0.1;
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.smoothing = SmoothingSchedule::UntilStable { max_passes: 0 };
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.max_geo_speed_mps = f64::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_params_json_partial_config_uses_defaults() {
        let params = Params::from_json(r#"{ "max_interval_s": 90 }"#).unwrap();
        assert_eq!(params.max_interval_s, 90);
        assert_eq!(params.min_interval_s, 20);
        assert_eq!(params.activity_separation_m, 300.0);
    }

    #[test]
    fn test_params_json_schedule_tagging() {
        let params =
            Params::from_json(r#"{ "smoothing": { "kind": "until_stable", "max_passes": 5 } }"#)
                .unwrap();
        assert_eq!(params.smoothing, SmoothingSchedule::UntilStable { max_passes: 5 });
        let back = Params::from_json(&params.to_json().unwrap()).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_fingerprint_tracks_parameters() {
        let a = Params::default();
        let mut b = Params::default();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        b.activity_separation_m = 250.0;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn test_process_entity_walking_without_activity_is_dropped() {
        // Steady walk: ~11 m per 30 s at 1.33 steps/s -> WALKING, no stationary points.
        let track = process_entity("a", walk("a", 1_000, 6), &Params::default()).unwrap();
        assert_eq!(track.stats.input_samples, 6);
        assert_eq!(track.stats.noise.retained, 5);
        assert_eq!(track.stats.noise.no_reference, 1);
        assert!(track.points.is_empty());
        assert_eq!(track.stats.dropped_walking, 5);
    }

    #[test]
    fn test_process_entity_rejects_foreign_samples() {
        let mut samples = walk("a", 0, 3);
        samples.push(Sample::new("b", 500, 13.0, 100.0, 0));
        let err = process_entity("a", samples, &Params::default()).unwrap_err();
        assert!(matches!(err, ModeError::InvalidSample { .. }));
    }

    #[test]
    fn test_process_batch_isolates_failures() {
        let mut samples = walk("good", 0, 4);
        samples.extend(walk("bad", 0, 4));
        samples.push(Sample::new("bad", 500, f64::NAN, 100.0, 0));
        let outcomes = process_batch(samples, &Params::default()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].entity_id, "bad");
        assert!(outcomes[0].result.is_err());
        assert_eq!(outcomes[1].entity_id, "good");
        assert!(outcomes[1].result.is_ok());
    }

    #[test]
    fn test_process_batch_survives_extreme_timestamps() {
        let mut samples = walk("good", 0, 4);
        samples.push(Sample::new("bad", i64::MIN, 13.0, 100.0, 0));
        samples.push(Sample::new("bad", i64::MAX, 13.0, 100.0, 0));
        let outcomes = process_batch(samples, &Params::default()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].entity_id, "bad");
        assert!(matches!(
            outcomes[0].result,
            Err(ModeError::InvalidSample { timestamp: i64::MAX, .. })
        ));
        assert_eq!(outcomes[1].entity_id, "good");
        assert!(outcomes[1].result.is_ok());
    }

    #[test]
    fn test_process_batch_rejects_invalid_params() {
        let mut params = Params::default();
        params.min_interval_s = 0;
        assert!(process_batch(walk("a", 0, 3), &params).is_err());
    }
}
