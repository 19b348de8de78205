//! Temporal correction of isolated mode flips.
//!
//! Every pass reads a snapshot of the modes and writes a fresh vector, so a
//! correction made at index `i` is never visible to index `i + 1` within the
//! same pass. Time windows use the spacing between retained points.

use crate::classify::LabeledPoint;
use crate::{ExtendedPattern, Mode, Params, SmoothingSchedule};

fn within_window(a: Option<i64>, b: Option<i64>, window_s: i64) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.checked_add(b).map_or(false, |span| span <= window_s),
        _ => false,
    }
}

/// One neighbour pass: a sample that disagrees with both neighbours, and whose
/// span to the next sample fits the window, takes the previous sample's mode.
pub fn neighbour_pass(modes: &[Mode], gaps: &[Option<i64>], window_s: i64) -> Vec<Mode> {
    debug_assert_eq!(modes.len(), gaps.len());
    let mut out = modes.to_vec();
    for i in 1..modes.len().saturating_sub(1) {
        let (prev, cur, next) = (modes[i - 1], modes[i], modes[i + 1]);
        if within_window(gaps[i], gaps[i + 1], window_s) && cur != next && cur != prev {
            out[i] = prev;
        }
    }
    out
}

/// The single extended pass for two-sample patterns at a mode boundary.
pub fn extended_pass(
    modes: &[Mode],
    gaps: &[Option<i64>],
    window_s: i64,
    pattern: ExtendedPattern,
) -> Vec<Mode> {
    debug_assert_eq!(modes.len(), gaps.len());
    let n = modes.len();
    let mut out = modes.to_vec();
    for i in 0..n {
        let cur = modes[i];
        let prev = i.checked_sub(1).map(|j| modes[j]);
        let prev_prev = i.checked_sub(2).map(|j| modes[j]);
        let next = modes.get(i + 1).copied();
        let next_next = modes.get(i + 2).copied();

        let (forward_anchor, backward_anchor) = match pattern {
            ExtendedPattern::RunContinuation => (next_next, prev_prev),
            ExtendedPattern::RunBracket => (prev_prev, next_next),
        };

        let prev_gap = i.checked_sub(1).and_then(|j| gaps[j]);
        let next_gap = gaps.get(i + 1).copied().flatten();

        if let (Some(prev), Some(next), Some(anchor)) = (prev, next, forward_anchor) {
            if within_window(gaps[i], prev_gap, window_s)
                && cur == prev
                && cur != next
                && next == anchor
            {
                out[i] = next;
                continue;
            }
        }
        if let (Some(prev), Some(next), Some(anchor)) = (prev, next, backward_anchor) {
            if within_window(gaps[i], next_gap, window_s)
                && cur == next
                && cur != prev
                && prev == anchor
            {
                out[i] = prev;
            }
        }
    }
    out
}

/// Neighbour passes per the schedule, then the optional extended pass.
pub fn smooth_modes(modes: &[Mode], gaps: &[Option<i64>], params: &Params) -> Vec<Mode> {
    let window = params.smoothing_window_s;
    let mut current = modes.to_vec();
    match params.smoothing {
        SmoothingSchedule::Fixed { passes } => {
            for _ in 0..passes {
                current = neighbour_pass(&current, gaps, window);
            }
        }
        SmoothingSchedule::UntilStable { max_passes } => {
            for _ in 0..max_passes {
                let next = neighbour_pass(&current, gaps, window);
                if next == current {
                    break;
                }
                current = next;
            }
        }
    }
    if params.extended_smoothing {
        current = extended_pass(&current, gaps, window, params.extended_pattern);
    }
    current
}

/// Smooth an entity's labelled points in place, returning how many modes changed.
pub fn smooth_points(mut points: Vec<LabeledPoint>, params: &Params) -> (Vec<LabeledPoint>, usize) {
    let modes: Vec<Mode> = points.iter().map(|p| p.mode).collect();
    let gaps: Vec<Option<i64>> = points.iter().map(|p| p.point.gap_s).collect();
    let smoothed = smooth_modes(&modes, &gaps, params);
    let mut changes = 0;
    for (point, mode) in points.iter_mut().zip(smoothed) {
        if point.mode != mode {
            changes += 1;
            point.mode = mode;
        }
    }
    (points, changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode::{Transit as T, Walking as W};

    fn gaps(n: usize, gap: i64) -> Vec<Option<i64>> {
        (0..n).map(|i| if i == 0 { None } else { Some(gap) }).collect()
    }

    #[test]
    fn test_isolated_flip_is_corrected() {
        let modes = [T, W, T];
        assert_eq!(neighbour_pass(&modes, &gaps(3, 40), 300), vec![T, T, T]);
    }

    #[test]
    fn test_flip_outside_window_is_kept() {
        let modes = [T, W, T];
        let g = vec![None, Some(160), Some(150)];
        assert_eq!(neighbour_pass(&modes, &g, 300), vec![T, W, T]);
        let g = vec![None, Some(150), Some(150)];
        assert_eq!(neighbour_pass(&modes, &g, 300), vec![T, T, T]);
    }

    #[test]
    fn test_overflowing_span_is_outside_window() {
        assert!(within_window(Some(150), Some(150), 300));
        assert!(!within_window(Some(i64::MAX), Some(1), 300));
        assert!(!within_window(Some(i64::MIN), Some(-1), 300));
        let g = vec![None, Some(i64::MAX), Some(i64::MAX)];
        assert_eq!(neighbour_pass(&[T, W, T], &g, 300), vec![T, W, T]);
    }

    #[test]
    fn test_edges_are_untouched() {
        let modes = [W, T];
        assert_eq!(neighbour_pass(&modes, &gaps(2, 30), 300), vec![W, T]);
        assert!(neighbour_pass(&[], &[], 300).is_empty());
        assert_eq!(neighbour_pass(&[T], &[None], 300), vec![T]);
    }

    #[test]
    fn test_pass_reads_a_snapshot() {
        // With live updates index 2 would see T on its left and stay W.
        let modes = [T, W, T, W, T];
        assert_eq!(neighbour_pass(&modes, &gaps(5, 30), 300), vec![T, T, W, T, T]);
    }

    #[test]
    fn test_two_passes_clear_short_alternation() {
        let params = Params {
            extended_smoothing: false,
            ..Params::default()
        };
        let modes = [T, W, T, W, T];
        assert_eq!(smooth_modes(&modes, &gaps(5, 30), &params), vec![T; 5]);
    }

    #[test]
    fn test_until_stable_matches_fixed_on_isolated_flips() {
        let modes = [W, W, T, W, W, W, T, W];
        let g = gaps(modes.len(), 30);
        let fixed = Params {
            extended_smoothing: false,
            ..Params::default()
        };
        let stable = Params {
            smoothing: SmoothingSchedule::UntilStable { max_passes: 10 },
            ..fixed.clone()
        };
        assert_eq!(smooth_modes(&modes, &g, &fixed), smooth_modes(&modes, &g, &stable));
    }

    #[test]
    fn test_extended_run_continuation() {
        // Index 2 matches its predecessor but the following run continues as T.
        let modes = [T, W, W, T, T];
        let out = extended_pass(&modes, &gaps(5, 30), 300, ExtendedPattern::RunContinuation);
        assert_eq!(out[2], T);
        // Index 3 matches its successor, differs from W before it, and W repeats behind.
        assert_eq!(out[3], W);
        assert_eq!(out[0], T);
        assert_eq!(out[4], T);
    }

    #[test]
    fn test_extended_run_bracket_absorbs_pair() {
        let modes = [W, T, T, W];
        let out = extended_pass(&modes, &gaps(4, 30), 300, ExtendedPattern::RunBracket);
        assert_eq!(out, vec![W, W, W, W]);
        let out = extended_pass(&modes, &gaps(4, 30), 300, ExtendedPattern::RunContinuation);
        assert_eq!(out, vec![W, T, T, W]);
    }

    #[test]
    fn test_extended_requires_gaps() {
        let modes = [W, T, T, W];
        let g = vec![None, None, Some(30), Some(30)];
        // Both corrections would need gaps[1], which is undefined.
        let out = extended_pass(&modes, &g, 300, ExtendedPattern::RunBracket);
        assert_eq!(out, vec![W, T, T, W]);
    }

    #[test]
    fn test_smooth_points_counts_changes() {
        use crate::noise::FilteredPoint;
        use crate::{RuleId, Sample};
        let points: Vec<LabeledPoint> = [T, W, T]
            .iter()
            .enumerate()
            .map(|(i, &mode)| LabeledPoint {
                point: FilteredPoint {
                    sample: Sample::new("a", 30 * i as i64, 0.0, 0.0, 0),
                    time_delta: 30,
                    gap_s: if i == 0 { None } else { Some(30) },
                    pedometer_speed: 0.0,
                    geo_speed: 0.0,
                },
                mode,
                rule: RuleId::Static,
            })
            .collect();
        let (smoothed, changes) = smooth_points(points, &Params::default());
        assert_eq!(changes, 1);
        assert!(smoothed.iter().all(|p| p.mode == T));
    }
}
