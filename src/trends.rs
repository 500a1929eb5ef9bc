use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;
use tracing::warn;

use crate::attainment::round2;
use crate::import::HeaderIndex;

/// Growth applied to the latest mean when projecting the next period.
pub const GROWTH_FACTOR: f64 = 1.05;

#[derive(Debug, Clone, PartialEq)]
pub struct CohortMark {
    pub year: String,
    pub department: String,
    pub course: String,
    pub regno: String,
    pub grade: String,
    pub mark: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TrendAxis {
    Year,
    Department,
    Course,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendPoint {
    pub label: String,
    pub current: f64,
    pub predicted: f64,
    pub students: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CohortTrends {
    pub axis: TrendAxis,
    pub points: Vec<TrendPoint>,
    /// Projection for the year after the latest one; only for the year axis.
    pub forecast: Option<TrendPoint>,
}

pub fn predict(current: f64) -> f64 {
    round2((current * GROWTH_FACTOR).min(100.0))
}

pub fn read_cohort_marks<R: Read>(source: R) -> anyhow::Result<Vec<CohortMark>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(source);
    let headers = HeaderIndex::new(reader.headers().context("failed to read header row")?);
    let mut marks = Vec::new();

    for (index, result) in reader.records().enumerate() {
        let row = index + 2;
        let Ok(record) = result else {
            warn!(row, "skipping unreadable cohort row");
            continue;
        };
        let field = |names: &[&str]| headers.get(&record, names).unwrap_or_default().to_string();
        let year = field(&["year"]);
        let department = field(&["department", "dept"]);
        let course = field(&["course"]);
        if year.is_empty() || department.is_empty() || course.is_empty() {
            warn!(row, "skipping cohort row without year, department and course");
            continue;
        }
        marks.push(CohortMark {
            year,
            department,
            course,
            regno: field(&["regno", "reg no"]),
            grade: field(&["grade"]),
            mark: headers.number(&record, &["mark", "marks"]),
        });
    }

    Ok(marks)
}

pub fn load_cohort_marks(path: &Path) -> anyhow::Result<Vec<CohortMark>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open cohort sheet {}", path.display()))?;
    read_cohort_marks(file)
}

fn sort_key(label: &str) -> (Option<i64>, &str) {
    (label.parse().ok(), label)
}

/// Mean mark per group along `axis`, each with a one-period projection.
pub fn cohort_trends(marks: &[CohortMark], axis: TrendAxis) -> CohortTrends {
    let mut groups: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for mark in marks {
        let label = match axis {
            TrendAxis::Year => mark.year.as_str(),
            TrendAxis::Department => mark.department.as_str(),
            TrendAxis::Course => mark.course.as_str(),
        };
        let entry = groups.entry(label).or_insert((0.0, 0));
        entry.0 += mark.mark;
        entry.1 += 1;
    }

    let mut points: Vec<TrendPoint> = groups
        .into_iter()
        .map(|(label, (total, count))| {
            let current = round2(total / count as f64);
            TrendPoint {
                label: label.to_string(),
                current,
                predicted: predict(current),
                students: count,
            }
        })
        .collect();
    points.sort_by(|a, b| sort_key(&a.label).cmp(&sort_key(&b.label)));

    let forecast = match axis {
        TrendAxis::Year => points.last().and_then(|latest| {
            let year: i64 = latest.label.parse().ok()?;
            Some(TrendPoint {
                label: (year + 1).to_string(),
                current: latest.current,
                predicted: latest.predicted,
                students: 0,
            })
        }),
        _ => None,
    };

    CohortTrends {
        axis,
        points,
        forecast,
    }
}
