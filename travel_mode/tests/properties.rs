//! Property tests over randomly generated trajectories.

use proptest::prelude::*;

use travel_mode::smooth::neighbour_pass;
use travel_mode::{process_batch, process_entity, EntityTrack, Mode, Params, Sample};

/// Mostly stationary or short moves, with some long jumps (degrees).
fn delta() -> impl Strategy<Value = f64> {
    prop_oneof![
        3 => Just(0.0f64),
        4 => -0.0005f64..0.0005,
        1 => -0.02f64..0.02,
    ]
}

/// Per-step increments: (seconds, d_lat, d_lon, steps).
fn increments() -> impl Strategy<Value = Vec<(i64, f64, f64, i64)>> {
    let dt = prop_oneof![
        8 => 20i64..=60,
        1 => 0i64..20,
        1 => 61i64..400,
    ];
    let steps = prop_oneof![
        3 => Just(0i64),
        4 => 0i64..150,
        1 => -50i64..400,
    ];
    prop::collection::vec((dt, delta(), delta(), steps), 0..60)
}

fn build(entity: &str, start_lat: f64, incs: &[(i64, f64, f64, i64)]) -> Vec<Sample> {
    let (mut t, mut lat, mut lon, mut steps) = (1_500_000_000i64, start_lat, 100.5, 0i64);
    let mut out = vec![Sample::new(entity, t, lat, lon, steps)];
    for &(dt, dlat, dlon, dsteps) in incs {
        t += dt;
        lat = (lat + dlat).clamp(-89.0, 89.0);
        lon += dlon;
        steps += dsteps;
        out.push(Sample::new(entity, t, lat, lon, steps));
    }
    out
}

fn run(samples: Vec<Sample>) -> EntityTrack {
    process_entity("e", samples, &Params::default()).expect("valid samples")
}

proptest! {
    #[test]
    fn prop_pipeline_is_deterministic(incs in increments()) {
        let samples = build("e", 13.7, &incs);
        prop_assert_eq!(run(samples.clone()), run(samples));
    }

    #[test]
    fn prop_output_invariants(incs in increments()) {
        let params = Params::default();
        let track = run(build("e", 13.7, &incs));
        prop_assert_eq!(track.stats.output_points, track.points.len());
        prop_assert!(track.points.len() <= track.stats.noise.retained);
        let mut last_ts = i64::MIN;
        for p in &track.points {
            prop_assert!(params.interval_in_range(p.time_delta));
            prop_assert!(p.pedometer_speed >= 0.0 && p.pedometer_speed <= 5.0);
            prop_assert!(p.geo_speed <= 55.0);
            prop_assert!(matches!(p.mode, Mode::Walking | Mode::Transit));
            if p.mode == Mode::Walking {
                prop_assert!(p.is_activity_area);
            }
            if p.is_activity_area {
                prop_assert!(p.is_stationary_candidate);
            }
            prop_assert!(p.timestamp > last_ts);
            last_ts = p.timestamp;
        }
    }

    #[test]
    fn prop_entities_are_isolated(
        a in increments(),
        b in increments(),
        corrupt in any::<bool>(),
    ) {
        let params = Params::default();
        let mut batch = build("a", 13.7, &a);
        batch.extend(build("b", 14.2, &b));
        let baseline = process_batch(batch, &params).unwrap();

        let mut other = build("b", 14.2, &b);
        other.reverse();
        if corrupt {
            other.push(Sample::new("b", 0, f64::NAN, 100.0, 0));
        }
        let mut batch = other;
        batch.extend(build("a", 13.7, &a));
        let perturbed = process_batch(batch, &params).unwrap();

        let find = |outcomes: &[travel_mode::EntityOutcome]| {
            outcomes
                .iter()
                .find(|o| o.entity_id == "a")
                .and_then(|o| o.result.as_ref().ok().cloned())
        };
        prop_assert_eq!(find(&baseline), find(&perturbed));
        prop_assert!(find(&baseline).is_some());
    }

    #[test]
    fn prop_smoothing_reaches_fixed_point_for_isolated_flips(
        walking_base in any::<bool>(),
        flips in prop::collection::vec(any::<bool>(), 0..80),
        gap_seed in prop::collection::vec(20i64..400, 80),
    ) {
        let (base, other) = if walking_base {
            (Mode::Walking, Mode::Transit)
        } else {
            (Mode::Transit, Mode::Walking)
        };
        // Keep flips at least three samples apart.
        let mut modes = Vec::with_capacity(flips.len());
        let mut last_flip: Option<usize> = None;
        for (i, &flip) in flips.iter().enumerate() {
            let spaced = last_flip.map_or(true, |j| i >= j + 3);
            if flip && spaced {
                modes.push(other);
                last_flip = Some(i);
            } else {
                modes.push(base);
            }
        }
        let gaps: Vec<Option<i64>> = (0..modes.len())
            .map(|i| if i == 0 { None } else { Some(gap_seed[i]) })
            .collect();

        let twice = neighbour_pass(&neighbour_pass(&modes, &gaps, 300), &gaps, 300);
        let thrice = neighbour_pass(&twice, &gaps, 300);
        prop_assert_eq!(twice, thrice);
    }
}
