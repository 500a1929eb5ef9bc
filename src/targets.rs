use std::collections::BTreeMap;

use tracing::info;

use crate::models::{CoId, CoSummary, CourseOutcomeTarget};

/// Attainment must exceed the target by more than this before it is raised.
pub const RAISE_MARGIN: f64 = 10.0;
pub const RAISE_STEP: f64 = 5.0;
pub const MAX_TARGET: f64 = 100.0;

/// Targets already at or above [`MAX_TARGET`] are left where they are.
pub fn next_target(current: f64, attainment: f64) -> f64 {
    if current < MAX_TARGET && attainment > current + RAISE_MARGIN {
        (current + RAISE_STEP).min(MAX_TARGET)
    } else {
        current
    }
}

/// Proposes next-period targets. Targets only move up; a CO missing from
/// `summary` is treated as 0% attainment and keeps its target.
pub fn adjust(
    current: &[CourseOutcomeTarget],
    summary: &BTreeMap<CoId, CoSummary>,
) -> Vec<CourseOutcomeTarget> {
    current
        .iter()
        .map(|target| {
            let attainment = summary
                .get(&target.co_id)
                .map(|co| co.avg_attainment)
                .filter(|value| value.is_finite())
                .unwrap_or(0.0);
            let next = next_target(target.target, attainment);
            if next != target.target {
                info!(
                    co = %target.co_id,
                    from = target.target,
                    to = next,
                    attainment,
                    "raising CO target"
                );
            }
            CourseOutcomeTarget {
                co_id: target.co_id.clone(),
                target: next,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(co: &str, value: f64) -> CourseOutcomeTarget {
        CourseOutcomeTarget {
            co_id: CoId::new(co),
            target: value,
        }
    }

    fn summary_of(entries: &[(&str, f64)]) -> BTreeMap<CoId, CoSummary> {
        entries
            .iter()
            .map(|(co, attainment)| {
                (
                    CoId::new(co),
                    CoSummary {
                        co_id: CoId::new(co),
                        avg_attainment: *attainment,
                        target: 70.0,
                        target_attained: true,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn raises_by_step_when_well_above_target() {
        let adjusted = adjust(&[target("CO1", 70.0)], &summary_of(&[("CO1", 85.0)]));
        assert_eq!(adjusted, vec![target("CO1", 75.0)]);
    }

    #[test]
    fn clamps_at_one_hundred() {
        let adjusted = adjust(&[target("CO1", 95.0)], &summary_of(&[("CO1", 110.0)]));
        assert_eq!(adjusted, vec![target("CO1", 100.0)]);
    }

    #[test]
    fn margin_is_exclusive() {
        let adjusted = adjust(&[target("CO1", 70.0)], &summary_of(&[("CO1", 80.0)]));
        assert_eq!(adjusted, vec![target("CO1", 70.0)]);
    }

    #[test]
    fn stable_once_within_margin() {
        let summary = summary_of(&[("CO1", 78.0)]);
        let first = adjust(&[target("CO1", 70.0)], &summary);
        let second = adjust(&first, &summary);
        assert_eq!(first, second);
    }

    #[test]
    fn never_lowers_targets() {
        let adjusted = adjust(&[target("CO1", 90.0)], &summary_of(&[("CO1", 10.0)]));
        assert_eq!(adjusted, vec![target("CO1", 90.0)]);
    }

    #[test]
    fn target_above_cap_is_not_pulled_down() {
        let adjusted = adjust(&[target("CO1", 120.0)], &summary_of(&[("CO1", 135.0)]));
        assert_eq!(adjusted, vec![target("CO1", 120.0)]);
        assert_eq!(next_target(100.0, 150.0), 100.0);
    }

    #[test]
    fn missing_summary_keeps_target() {
        let adjusted = adjust(
            &[target("CO1", 70.0), target("CO2", 60.0)],
            &summary_of(&[("CO1", 95.0)]),
        );
        assert_eq!(adjusted, vec![target("CO1", 75.0), target("CO2", 60.0)]);
    }
}
