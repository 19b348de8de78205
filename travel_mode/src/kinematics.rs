//! Elapsed time, pedometer speed and geodesic speed between adjacent samples.

use crate::geo::{haversine_distance, round2};
use crate::{ModeError, Params, Sample};

/// A sample enriched with the interval and speeds relative to its predecessor.
///
/// `time_delta` is `None` only for the first sample of an entity. The speeds are
/// `None` whenever the interval falls outside the accepted range.
#[derive(Clone, Debug, PartialEq)]
pub struct Kinematic {
    pub sample: Sample,
    pub time_delta: Option<i64>,
    pub pedometer_speed: Option<f64>,
    pub geo_speed: Option<f64>,
}

/// Steps per second between two cumulative pedometer readings, rounded to 0.01.
pub fn pedometer_speed(prev_steps: i64, steps: i64, time_delta: i64) -> f64 {
    round2((steps as f64 - prev_steps as f64) / time_delta as f64)
}

/// Meters per second between two fixes. The distance is rounded to centimeters
/// before dividing, and the speed to 0.01 m/s.
pub fn geo_speed(prev: &Sample, cur: &Sample, time_delta: i64, radius_m: f64) -> f64 {
    let dist = round2(haversine_distance(
        prev.latitude,
        prev.longitude,
        cur.latitude,
        cur.longitude,
        radius_m,
    ));
    round2(dist / time_delta as f64)
}

/// Enrich a time-ordered entity sequence. Fails when two adjacent timestamps are
/// too far apart to subtract.
pub fn estimate(ordered: Vec<Sample>, params: &Params) -> Result<Vec<Kinematic>, ModeError> {
    let mut out: Vec<Kinematic> = Vec::with_capacity(ordered.len());
    for sample in ordered {
        let mut row = Kinematic {
            sample,
            time_delta: None,
            pedometer_speed: None,
            geo_speed: None,
        };
        if let Some(prev) = out.last().map(|k| &k.sample) {
            let dt = row
                .sample
                .timestamp
                .checked_sub(prev.timestamp)
                .ok_or_else(|| ModeError::InvalidSample {
                    entity: row.sample.entity_id.clone(),
                    timestamp: row.sample.timestamp,
                    reason: format!("interval from timestamp {} overflows", prev.timestamp),
                })?;
            row.time_delta = Some(dt);
            if params.interval_in_range(dt) {
                row.pedometer_speed = Some(pedometer_speed(prev.step_count, row.sample.step_count, dt));
                row.geo_speed = Some(geo_speed(prev, &row.sample, dt, params.earth_radius_m));
            }
        }
        out.push(row);
    }
    Ok(out)
}
