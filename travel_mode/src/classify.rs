//! Rule-table mode classifier.
//!
//! Geodesic speed is the primary signal. Pedometer speed separates the slow
//! cases (standing, slow walking, a vehicle idling in traffic) and the ratio
//! cases (walking with incidental device motion vs riding while stepping).
//! Rules are evaluated top to bottom and the first match wins; a rule whose
//! inputs are missing never matches.

use serde::{Deserialize, Serialize};

use crate::noise::FilteredPoint;
use crate::{Mode, Params};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    Static,
    FastTransit,
    IdleTransit,
    SlowWalk,
    RatioTransit,
    RatioWalk,
    Fallback,
}

impl RuleId {
    /// 1-based priority position in the table.
    pub fn number(self) -> u8 {
        match self {
            RuleId::Static => 1,
            RuleId::FastTransit => 2,
            RuleId::IdleTransit => 3,
            RuleId::SlowWalk => 4,
            RuleId::RatioTransit => 5,
            RuleId::RatioWalk => 6,
            RuleId::Fallback => 7,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            RuleId::Static => "no displacement",
            RuleId::FastTransit => "geo speed at or above transit speed",
            RuleId::IdleTransit => "moving without stepping (traffic, red light)",
            RuleId::SlowWalk => "slow drift without stepping",
            RuleId::RatioTransit => "displacement far exceeds stepping rate",
            RuleId::RatioWalk => "displacement consistent with stepping rate",
            RuleId::Fallback => "no rule matched",
        }
    }
}

/// Speeds fed to the classifier.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Speeds {
    pub pedometer: Option<f64>,
    pub geo: Option<f64>,
}

impl Speeds {
    pub fn new(pedometer: f64, geo: f64) -> Self {
        Self {
            pedometer: Some(pedometer),
            geo: Some(geo),
        }
    }
}

struct ModeRule {
    id: RuleId,
    mode: Mode,
    applies: fn(&Speeds, &Params) -> bool,
}

const RULES: [ModeRule; 6] = [
    ModeRule {
        id: RuleId::Static,
        mode: Mode::Walking,
        applies: is_static,
    },
    ModeRule {
        id: RuleId::FastTransit,
        mode: Mode::Transit,
        applies: is_fast,
    },
    ModeRule {
        id: RuleId::IdleTransit,
        mode: Mode::Transit,
        applies: is_idle_drift,
    },
    ModeRule {
        id: RuleId::SlowWalk,
        mode: Mode::Walking,
        applies: is_slow_walk,
    },
    ModeRule {
        id: RuleId::RatioTransit,
        mode: Mode::Transit,
        applies: is_ratio_transit,
    },
    ModeRule {
        id: RuleId::RatioWalk,
        mode: Mode::Walking,
        applies: is_ratio_walk,
    },
];

const FALLBACK_MODE: Mode = Mode::Walking;

fn is_static(s: &Speeds, _: &Params) -> bool {
    matches!(s.geo, Some(geo) if geo == 0.0)
}

fn is_fast(s: &Speeds, p: &Params) -> bool {
    matches!(s.geo, Some(geo) if geo >= p.transit_speed_mps)
}

fn is_idle_drift(s: &Speeds, p: &Params) -> bool {
    matches!((s.pedometer, s.geo), (Some(ped), Some(geo)) if ped <= p.idle_step_rate && geo > p.idle_drift_mps)
}

fn is_slow_walk(s: &Speeds, p: &Params) -> bool {
    matches!((s.pedometer, s.geo), (Some(ped), Some(geo)) if ped <= p.idle_step_rate && geo <= p.idle_drift_mps)
}

// The ratio rules only divide once pedometer speed exceeds a non-negative bound.
fn is_ratio_transit(s: &Speeds, p: &Params) -> bool {
    matches!((s.pedometer, s.geo), (Some(ped), Some(geo)) if ped > p.idle_step_rate && geo / ped >= p.transit_ratio)
}

fn is_ratio_walk(s: &Speeds, p: &Params) -> bool {
    matches!((s.pedometer, s.geo), (Some(ped), Some(geo)) if ped > p.idle_step_rate && geo / ped < p.transit_ratio)
}

/// Classify one pair of speeds, returning the mode and the rule that decided it.
pub fn classify(speeds: Speeds, params: &Params) -> (Mode, RuleId) {
    RULES
        .iter()
        .find(|rule| (rule.applies)(&speeds, params))
        .map(|rule| (rule.mode, rule.id))
        .unwrap_or((FALLBACK_MODE, RuleId::Fallback))
}

/// The table in priority order, fallback last.
pub fn rule_table() -> Vec<(RuleId, Mode)> {
    RULES
        .iter()
        .map(|rule| (rule.id, rule.mode))
        .chain(std::iter::once((RuleId::Fallback, FALLBACK_MODE)))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabeledPoint {
    pub point: FilteredPoint,
    pub mode: Mode,
    pub rule: RuleId,
}

pub fn classify_points(points: Vec<FilteredPoint>, params: &Params) -> Vec<LabeledPoint> {
    points
        .into_iter()
        .map(|point| {
            let (mode, rule) = classify(Speeds::new(point.pedometer_speed, point.geo_speed), params);
            LabeledPoint { point, mode, rule }
        })
        .collect()
}
