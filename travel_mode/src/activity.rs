//! Activity-area recognition and the final retention rule.

use crate::classify::LabeledPoint;
use crate::geo::{haversine_distance, round2};
use crate::noise::FilteredPoint;
use crate::{Mode, Params, TrackPoint};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivityStats {
    pub stationary_candidates: usize,
    pub activity_areas: usize,
    pub dropped_walking: usize,
}

impl AsRef<FilteredPoint> for FilteredPoint {
    fn as_ref(&self) -> &FilteredPoint {
        self
    }
}

impl AsRef<FilteredPoint> for LabeledPoint {
    fn as_ref(&self) -> &FilteredPoint {
        &self.point
    }
}

/// Both speed estimates read exactly zero.
pub fn is_stationary_candidate(point: &FilteredPoint) -> bool {
    point.geo_speed == 0.0 && point.pedometer_speed == 0.0
}

/// Flag activity areas among time-ordered points.
///
/// Only stationary candidates are compared, each against the next candidate in
/// time. A candidate at least `activity_separation_m` from that successor marks
/// the departure from one dwell location and is flagged. The last candidate has
/// no successor and is never flagged.
pub fn flag_activity_areas<P: AsRef<FilteredPoint>>(points: &[P], params: &Params) -> Vec<bool> {
    let mut flags = vec![false; points.len()];
    let candidates: Vec<usize> = points
        .iter()
        .enumerate()
        .filter(|&(_, p)| is_stationary_candidate(p.as_ref()))
        .map(|(i, _)| i)
        .collect();
    for pair in candidates.windows(2) {
        let a = &points[pair[0]].as_ref().sample;
        let b = &points[pair[1]].as_ref().sample;
        let dist = round2(haversine_distance(
            a.latitude,
            a.longitude,
            b.latitude,
            b.longitude,
            params.earth_radius_m,
        ));
        flags[pair[0]] = dist >= params.activity_separation_m;
    }
    flags
}

/// Flag activity areas, then drop walking points that are not one.
pub fn detect(points: Vec<LabeledPoint>, params: &Params) -> (Vec<TrackPoint>, ActivityStats) {
    let flags = flag_activity_areas(&points, params);

    let mut stats = ActivityStats::default();
    let mut out = Vec::with_capacity(points.len());
    for (labeled, is_activity_area) in points.into_iter().zip(flags) {
        let candidate = is_stationary_candidate(&labeled.point);
        if candidate {
            stats.stationary_candidates += 1;
        }
        if is_activity_area {
            stats.activity_areas += 1;
        }
        if labeled.mode == Mode::Walking && !is_activity_area {
            stats.dropped_walking += 1;
            continue;
        }
        let LabeledPoint { point, mode, rule } = labeled;
        out.push(TrackPoint {
            entity_id: point.sample.entity_id,
            timestamp: point.sample.timestamp,
            latitude: point.sample.latitude,
            longitude: point.sample.longitude,
            time_delta: point.time_delta,
            gap_s: point.gap_s,
            pedometer_speed: point.pedometer_speed,
            geo_speed: point.geo_speed,
            mode,
            rule,
            is_stationary_candidate: candidate,
            is_activity_area,
        });
    }
    (out, stats)
}
