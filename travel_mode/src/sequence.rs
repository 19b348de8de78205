//! Grouping samples by entity and ordering each entity's sequence by time.

use std::collections::BTreeMap;

use crate::{ModeError, Sample};

/// Split a flat sample stream into per-entity vectors, keyed in ascending id order.
/// Within an entity the input order is preserved.
pub fn group_by_entity(samples: impl IntoIterator<Item = Sample>) -> BTreeMap<String, Vec<Sample>> {
    let mut groups: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        match groups.get_mut(&sample.entity_id) {
            Some(group) => group.push(sample),
            None => {
                groups.insert(sample.entity_id.clone(), vec![sample]);
            }
        }
    }
    groups
}

/// Validate and time-order one entity's samples.
///
/// The sort is stable, so samples sharing a timestamp keep their input order
/// (and are later rejected by the interval check).
pub fn order_entity(entity_id: &str, mut samples: Vec<Sample>) -> Result<Vec<Sample>, ModeError> {
    for sample in &samples {
        validate_sample(entity_id, sample)?;
    }
    samples.sort_by_key(|s| s.timestamp);
    Ok(samples)
}

fn validate_sample(entity_id: &str, sample: &Sample) -> Result<(), ModeError> {
    let reason = if sample.entity_id != entity_id {
        Some(format!("belongs to entity {}", sample.entity_id))
    } else if !sample.latitude.is_finite() || !(-90.0..=90.0).contains(&sample.latitude) {
        Some(format!("latitude {} out of range", sample.latitude))
    } else if !sample.longitude.is_finite() || !(-180.0..=180.0).contains(&sample.longitude) {
        Some(format!("longitude {} out of range", sample.longitude))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ModeError::InvalidSample {
            entity: entity_id.to_string(),
            timestamp: sample.timestamp,
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_entity_keeps_input_order() {
        let samples = vec![
            Sample::new("b", 30, 0.0, 0.0, 0),
            Sample::new("a", 20, 0.0, 0.0, 0),
            Sample::new("b", 10, 0.0, 0.0, 0),
        ];
        let groups = group_by_entity(samples);
        let keys: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        let b: Vec<i64> = groups["b"].iter().map(|s| s.timestamp).collect();
        assert_eq!(b, vec![30, 10]);
    }

    #[test]
    fn test_order_entity_sorts_by_timestamp() {
        let samples = vec![
            Sample::new("a", 90, 0.0, 0.0, 3),
            Sample::new("a", 30, 0.0, 0.0, 1),
            Sample::new("a", 60, 0.0, 0.0, 2),
        ];
        let ordered = order_entity("a", samples).unwrap();
        let steps: Vec<i64> = ordered.iter().map(|s| s.step_count).collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[test]
    fn test_order_entity_is_stable_on_ties() {
        let samples = vec![
            Sample::new("a", 30, 0.0, 0.0, 7),
            Sample::new("a", 30, 0.0, 0.0, 8),
        ];
        let ordered = order_entity("a", samples).unwrap();
        assert_eq!(ordered[0].step_count, 7);
        assert_eq!(ordered[1].step_count, 8);
    }

    #[test]
    fn test_order_entity_rejects_bad_coordinates() {
        let err = order_entity("a", vec![Sample::new("a", 0, 91.0, 0.0, 0)]).unwrap_err();
        assert!(err.to_string().contains("latitude"));
        let err = order_entity("a", vec![Sample::new("a", 0, 0.0, f64::INFINITY, 0)]).unwrap_err();
        assert!(err.to_string().contains("longitude"));
    }
}
