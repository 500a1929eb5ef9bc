use crate::attainment::{normalize, round2};
use crate::models::{MarkRecord, Student};

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub label: String,
    pub internal: f64,
    pub exam: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    Above,
    Below,
}

impl Standing {
    fn of(current: f64, average: f64) -> Self {
        if current > average {
            Standing::Above
        } else {
            Standing::Below
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Standing::Above => "Above",
            Standing::Below => "Below",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreeYearComparison {
    pub avg_internal: f64,
    pub avg_exam: f64,
    pub internal: Standing,
    pub exam: Standing,
}

fn record_percentages(record: &MarkRecord) -> (f64, f64) {
    (
        normalize(record.internal, record.total_internal),
        normalize(record.exam, record.total_exam),
    )
}

/// Mean of `(internal% + exam%) / 2` across records, rounded to two decimals.
/// `None` means there is nothing to average and renders as "N/A".
pub fn student_average(marks: &[MarkRecord]) -> Option<f64> {
    if marks.is_empty() {
        return None;
    }
    let total: f64 = marks
        .iter()
        .map(|record| {
            let (internal, exam) = record_percentages(record);
            (internal + exam) / 2.0
        })
        .sum();
    Some(round2(total / marks.len() as f64))
}

pub fn format_average(average: Option<f64>) -> String {
    average
        .map(|value| format!("{value:.2}"))
        .unwrap_or_else(|| "N/A".to_string())
}

pub fn history(marks: &[MarkRecord]) -> Vec<HistoryPoint> {
    marks
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let (internal, exam) = record_percentages(record);
            let label = if record.year.trim().is_empty() {
                format!("Entry {}", index + 1)
            } else {
                record.year.clone()
            };
            HistoryPoint {
                label,
                internal,
                exam,
            }
        })
        .collect()
}

/// Compares the latest record with the mean of the last three.
pub fn three_year_comparison(marks: &[MarkRecord]) -> Option<ThreeYearComparison> {
    let recent = &marks[marks.len().saturating_sub(3)..];
    let latest = recent.last()?;
    let count = recent.len() as f64;
    let (sum_internal, sum_exam) = recent.iter().fold((0.0, 0.0), |(i, e), record| {
        let (internal, exam) = record_percentages(record);
        (i + internal, e + exam)
    });
    let avg_internal = sum_internal / count;
    let avg_exam = sum_exam / count;
    let (current_internal, current_exam) = record_percentages(latest);

    Some(ThreeYearComparison {
        avg_internal: round2(avg_internal),
        avg_exam: round2(avg_exam),
        internal: Standing::of(current_internal, avg_internal),
        exam: Standing::of(current_exam, avg_exam),
    })
}

#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub student_id: Option<String>,
    pub name: Option<String>,
    pub department: Option<String>,
}

impl StudentFilter {
    pub fn matches(&self, student: &Student) -> bool {
        let contains_ci = |haystack: &str, needle: &Option<String>| match needle {
            Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        };
        let id_ok = self
            .student_id
            .as_deref()
            .map_or(true, |needle| student.student_id.contains(needle));
        id_ok
            && contains_ci(&student.name, &self.name)
            && contains_ci(&student.department, &self.department)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        year: &str,
        internal: f64,
        total_internal: f64,
        exam: f64,
        total_exam: f64,
    ) -> MarkRecord {
        MarkRecord {
            year: year.to_string(),
            internal,
            exam,
            total_internal,
            total_exam,
            co_mapping: Vec::new(),
        }
    }

    #[test]
    fn average_of_single_record() {
        let marks = vec![record("2025", 40.0, 50.0, 30.0, 50.0)];
        assert_eq!(student_average(&marks), Some(70.0));
        assert_eq!(format_average(student_average(&marks)), "70.00");
    }

    #[test]
    fn average_without_marks_is_not_available() {
        assert_eq!(student_average(&[]), None);
        assert_eq!(format_average(None), "N/A");
    }

    #[test]
    fn average_survives_zero_totals() {
        let marks = vec![record("2025", 40.0, 0.0, 30.0, 50.0)];
        assert_eq!(student_average(&marks), Some(30.0));
    }

    #[test]
    fn history_labels_missing_years() {
        let marks = vec![record("2024", 5.0, 10.0, 1.0, 4.0), record("", 10.0, 10.0, 0.0, 0.0)];
        let points = history(&marks);
        assert_eq!(points[0].label, "2024");
        assert_eq!(points[0].exam, 25.0);
        assert_eq!(points[1].label, "Entry 2");
        assert_eq!(points[1].exam, 0.0);
    }

    #[test]
    fn comparison_uses_last_three_records() {
        let marks = vec![
            record("2021", 0.0, 10.0, 0.0, 10.0),
            record("2022", 5.0, 10.0, 5.0, 10.0),
            record("2023", 5.0, 10.0, 10.0, 10.0),
            record("2024", 8.0, 10.0, 0.0, 10.0),
        ];
        let comparison = three_year_comparison(&marks).unwrap();
        assert_eq!(comparison.avg_internal, 60.0);
        assert_eq!(comparison.avg_exam, 50.0);
        assert_eq!(comparison.internal, Standing::Above);
        assert_eq!(comparison.exam, Standing::Below);
    }

    #[test]
    fn comparison_needs_records() {
        assert!(three_year_comparison(&[]).is_none());
    }

    #[test]
    fn filter_is_case_insensitive_on_name_and_department() {
        let student = Student {
            student_id: "S-101".to_string(),
            name: "Avery Lee".to_string(),
            department: "CSE".to_string(),
            ..Student::default()
        };
        let filter = StudentFilter {
            student_id: Some("101".to_string()),
            name: Some("avery".to_string()),
            department: Some("cs".to_string()),
        };
        assert!(filter.matches(&student));
        let miss = StudentFilter {
            department: Some("ece".to_string()),
            ..StudentFilter::default()
        };
        assert!(!miss.matches(&student));
    }
}
