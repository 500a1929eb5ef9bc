use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tracing::{debug, warn};

use crate::config::{AttainmentParameters, IndirectPolicy, LevelThresholds};
use crate::models::{CoId, CoSummary, CourseOutcomeTarget, MarkRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    InternalExam,
    Assignment,
    ClassTest,
    Seminar,
    WorkProject,
    External,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::InternalExam,
        Category::Assignment,
        Category::ClassTest,
        Category::Seminar,
        Category::WorkProject,
        Category::External,
    ];

    /// Categories averaged together into continuous internal assessment.
    pub const CIA: [Category; 3] = [
        Category::InternalExam,
        Category::Assignment,
        Category::ClassTest,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Category::InternalExam => "Internal Assessment",
            Category::Assignment => "Assignment",
            Category::ClassTest => "Class Test/Tutorial",
            Category::Seminar => "Seminar",
            Category::WorkProject => "Work Project/Extra Curricular",
            Category::External => "Semester End Exam",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoScore {
    pub co_id: CoId,
    pub scored: f64,
    pub total: f64,
}

/// One sitting of an assessment category, e.g. the second class test.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub category: Category,
    pub instance: u32,
    pub scores: Vec<CoScore>,
}

/// Per-CO trace of every step of the attainment computation.
#[derive(Debug, Clone, PartialEq)]
pub struct CoBreakdown {
    pub co_id: CoId,
    pub instances: BTreeMap<(Category, u32), f64>,
    pub category_averages: BTreeMap<Category, f64>,
    pub cia: Option<f64>,
    pub see_percentage: Option<f64>,
    pub see_level: Option<u8>,
    pub direct: f64,
    pub indirect: Option<f64>,
    pub overall: f64,
    pub target: f64,
    pub target_attained: bool,
}

impl CoBreakdown {
    pub fn summary(&self) -> CoSummary {
        CoSummary {
            co_id: self.co_id.clone(),
            avg_attainment: self.overall.clamp(0.0, 100.0),
            target: self.target,
            target_attained: self.target_attained,
        }
    }
}

/// Converts a raw score into a percentage in `[0, 100]`.
///
/// Zero, negative or non-finite totals yield 0 rather than NaN or Infinity.
pub fn normalize(scored: f64, total: f64) -> f64 {
    if !total.is_finite() || total <= 0.0 {
        return 0.0;
    }
    let percentage = scored / total * 100.0;
    if percentage.is_finite() {
        percentage.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Maps a percentage onto attainment level 1, 2 or 3 (inclusive lower bounds).
pub fn classify(percentage: f64, thresholds: &LevelThresholds) -> u8 {
    if percentage >= thresholds.level3 {
        3
    } else if percentage >= thresholds.level2 {
        2
    } else {
        1
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Splits stored mark records into assessment sittings: each record's CO
/// internal marks form one internal exam and its CO exam marks one external exam.
pub fn assessments_from_records(records: &[MarkRecord]) -> Vec<Assessment> {
    let mut assessments = Vec::with_capacity(records.len() * 2);

    for (index, record) in records.iter().enumerate() {
        let instance = index as u32 + 1;
        let mut seen = HashSet::new();
        let mut internal = Vec::new();
        let mut external = Vec::new();

        for entry in &record.co_mapping {
            if entry.co_id.is_empty() {
                warn!(year = %record.year, "skipping CO mapping entry without a coId");
                continue;
            }
            if !seen.insert(entry.co_id.clone()) {
                warn!(
                    year = %record.year,
                    co = %entry.co_id,
                    "duplicate coId in mark record; keeping the first"
                );
                continue;
            }
            internal.push(CoScore {
                co_id: entry.co_id.clone(),
                scored: entry.internal,
                total: entry.total_internal,
            });
            external.push(CoScore {
                co_id: entry.co_id.clone(),
                scored: entry.exam,
                total: entry.total_exam,
            });
        }

        assessments.push(Assessment {
            category: Category::InternalExam,
            instance,
            scores: internal,
        });
        assessments.push(Assessment {
            category: Category::External,
            instance,
            scores: external,
        });
    }

    assessments
}

fn target_lookup(targets: &[CourseOutcomeTarget]) -> BTreeMap<CoId, f64> {
    let mut lookup = BTreeMap::new();
    for target in targets {
        lookup.entry(target.co_id.clone()).or_insert(target.target);
    }
    lookup
}

/// Runs the full CO attainment computation over assessment sittings.
///
/// `survey` carries course-exit-survey attainment (0-100) per CO; COs absent
/// from it follow `params.indirect_policy`.
pub fn aggregate_assessments(
    assessments: &[Assessment],
    survey: &BTreeMap<CoId, f64>,
    targets: &[CourseOutcomeTarget],
    params: &AttainmentParameters,
) -> BTreeMap<CoId, CoBreakdown> {
    let mut instances: BTreeMap<CoId, BTreeMap<(Category, u32), Vec<f64>>> = BTreeMap::new();

    for assessment in assessments {
        for score in &assessment.scores {
            if score.co_id.is_empty() {
                warn!(category = %assessment.category, "skipping score without a coId");
                continue;
            }
            if !score.total.is_finite() || score.total <= 0.0 {
                debug!(
                    category = %assessment.category,
                    co = %score.co_id,
                    "missing denominator; counting as 0%"
                );
            }
            instances
                .entry(score.co_id.clone())
                .or_default()
                .entry((assessment.category, assessment.instance))
                .or_default()
                .push(normalize(score.scored, score.total));
        }
    }

    let targets = target_lookup(targets);
    let mut breakdowns = BTreeMap::new();

    for (co_id, per_instance) in instances {
        let instances: BTreeMap<(Category, u32), f64> = per_instance
            .into_iter()
            .filter_map(|(key, values)| mean(values).map(|value| (key, value)))
            .collect();

        let category_averages: BTreeMap<Category, f64> = Category::ALL
            .iter()
            .filter_map(|category| {
                mean(
                    instances
                        .iter()
                        .filter(|((cat, _), _)| cat == category)
                        .map(|(_, value)| *value),
                )
                .map(|value| (*category, value))
            })
            .collect();

        let cia = mean(
            Category::CIA
                .iter()
                .filter_map(|category| category_averages.get(category).copied()),
        );
        let see_percentage = category_averages.get(&Category::External).copied();
        let see_level = see_percentage.map(|pct| classify(pct, &params.level_thresholds));

        let direct = match (see_level, cia) {
            (Some(level), Some(cia)) => params.x * f64::from(level) + params.y * cia,
            (Some(level), None) => f64::from(level),
            (None, Some(cia)) => cia,
            (None, None) => 0.0,
        };

        let indirect = survey.get(&co_id).copied().filter(|value| value.is_finite());
        let overall = match (indirect, params.indirect_policy) {
            (Some(indirect), _) => params.u * direct + params.v * indirect,
            (None, IndirectPolicy::Zero) => params.u * direct,
            (None, IndirectPolicy::Exclude) => direct,
        };

        let target = targets
            .get(&co_id)
            .copied()
            .unwrap_or(params.default_co_target);

        breakdowns.insert(
            co_id.clone(),
            CoBreakdown {
                co_id,
                instances,
                category_averages,
                cia,
                see_percentage,
                see_level,
                direct,
                indirect,
                overall,
                target,
                target_attained: overall >= target,
            },
        );
    }

    for co_id in survey.keys() {
        if !breakdowns.contains_key(co_id) {
            debug!(co = %co_id, "survey value without direct assessment data ignored");
        }
    }

    breakdowns
}

/// Computes the per-CO summary for one student's stored marks.
pub fn aggregate(
    records: &[MarkRecord],
    targets: &[CourseOutcomeTarget],
    params: &AttainmentParameters,
) -> BTreeMap<CoId, CoSummary> {
    aggregate_assessments(
        &assessments_from_records(records),
        &BTreeMap::new(),
        targets,
        params,
    )
    .into_iter()
    .map(|(co_id, breakdown)| (co_id, breakdown.summary()))
    .collect()
}
