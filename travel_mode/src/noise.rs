//! Rejection of samples with implausible timing or speeds.

use serde::{Deserialize, Serialize};

use crate::kinematics::Kinematic;
use crate::{Params, Sample};

/// A sample that passed noise rejection. Both speeds are always present here.
#[derive(Clone, Debug, PartialEq)]
pub struct FilteredPoint {
    pub sample: Sample,
    pub time_delta: i64,
    /// Seconds since the previous sample that passed the interval check; `None`
    /// for the first one.
    pub gap_s: Option<i64>,
    pub pedometer_speed: f64,
    pub geo_speed: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// First sample of the entity, nothing to measure against.
    NoReference,
    Interval,
    StepRate,
    GeoSpeed,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoiseStats {
    pub no_reference: usize,
    pub interval: usize,
    pub step_rate: usize,
    pub geo_speed: usize,
    pub retained: usize,
}

impl NoiseStats {
    pub fn dropped(&self) -> usize {
        self.no_reference + self.interval + self.step_rate + self.geo_speed
    }

    fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::NoReference => self.no_reference += 1,
            DropReason::Interval => self.interval += 1,
            DropReason::StepRate => self.step_rate += 1,
            DropReason::GeoSpeed => self.geo_speed += 1,
        }
    }
}

/// Interval check: the row needs a predecessor inside the accepted interval
/// range, which is also what makes both speeds defined.
pub fn check_interval(row: &Kinematic, params: &Params) -> Result<(i64, f64, f64), DropReason> {
    let dt = row.time_delta.ok_or(DropReason::NoReference)?;
    if !params.interval_in_range(dt) {
        return Err(DropReason::Interval);
    }
    match (row.pedometer_speed, row.geo_speed) {
        (Some(ped), Some(geo)) => Ok((dt, ped, geo)),
        _ => Err(DropReason::Interval),
    }
}

/// Speed plausibility: step rate within bounds, geodesic speed under the cap.
pub fn check_speeds(
    pedometer_speed: f64,
    geo_speed: f64,
    params: &Params,
) -> Result<(), DropReason> {
    if !(pedometer_speed >= params.min_step_rate && pedometer_speed <= params.max_step_rate) {
        return Err(DropReason::StepRate);
    }
    if !(geo_speed <= params.max_geo_speed_mps) {
        return Err(DropReason::GeoSpeed);
    }
    Ok(())
}

/// Drop implausible rows in two stages.
///
/// Rows outside the interval range go first, and each remaining row's spacing
/// to the previous interval survivor becomes its `gap_s`. The speed checks run
/// afterwards and do not recompute it, so a speed outlier still counts as the
/// predecessor of the row after it.
pub fn filter(rows: Vec<Kinematic>, params: &Params) -> (Vec<FilteredPoint>, NoiseStats) {
    let mut stats = NoiseStats::default();
    let mut out: Vec<FilteredPoint> = Vec::with_capacity(rows.len());
    let mut last_in_range: Option<i64> = None;
    for row in rows {
        let (time_delta, pedometer_speed, geo_speed) = match check_interval(&row, params) {
            Ok(checked) => checked,
            Err(reason) => {
                stats.record(reason);
                continue;
            }
        };
        let timestamp = row.sample.timestamp;
        // An unrepresentable spacing leaves the gap undefined.
        let gap_s = last_in_range.and_then(|prev| timestamp.checked_sub(prev));
        last_in_range = Some(timestamp);

        if let Err(reason) = check_speeds(pedometer_speed, geo_speed, params) {
            stats.record(reason);
            continue;
        }
        out.push(FilteredPoint {
            sample: row.sample,
            time_delta,
            gap_s,
            pedometer_speed,
            geo_speed,
        });
    }
    stats.retained = out.len();
    (out, stats)
}
