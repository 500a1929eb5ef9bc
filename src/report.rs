use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::analytics::student_average;
use crate::attainment::{round2, Category, CoBreakdown};
use crate::config::{AttainmentParameters, IndirectPolicy};
use crate::export::ExportRow;
use crate::models::{CoId, CoSummary, DepartmentSummary, PoSummary, Student};

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn percent(value: Option<f64>) -> String {
    value
        .map(|value| format!("{value:.2}%"))
        .unwrap_or_else(|| "-".to_string())
}

pub fn summarize_by_department(
    students: &[Student],
    summaries: &BTreeMap<String, BTreeMap<CoId, CoSummary>>,
) -> Vec<DepartmentSummary> {
    let mut map: BTreeMap<String, (usize, f64, usize, usize, usize)> = BTreeMap::new();

    for student in students {
        let entry = map
            .entry(student.department.clone())
            .or_insert((0, 0.0, 0, 0, 0));
        entry.0 += 1;
        if let Some(average) = student_average(&student.marks) {
            entry.1 += average;
            entry.2 += 1;
        }
        if let Some(summary) = summaries.get(&student.student_id) {
            entry.3 += summary.values().filter(|co| co.target_attained).count();
            entry.4 += summary.len();
        }
    }

    let mut departments: Vec<DepartmentSummary> = map
        .into_iter()
        .map(
            |(department, (student_count, total, averaged, cos_attained, cos_total))| {
                DepartmentSummary {
                    department,
                    student_count,
                    avg_average: (averaged > 0).then(|| round2(total / averaged as f64)),
                    cos_attained,
                    cos_total,
                }
            },
        )
        .collect();

    departments.sort_by(|a, b| b.student_count.cmp(&a.student_count));
    departments
}

/// Markdown performance report: one table per department plus the COs that
/// missed their targets.
pub fn build_performance_report(
    generated_on: NaiveDate,
    groups: &BTreeMap<String, Vec<ExportRow>>,
    departments: &[DepartmentSummary],
    summaries: &BTreeMap<String, BTreeMap<CoId, CoSummary>>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Student Performance Report");
    let _ = writeln!(output, "Generated on {generated_on}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Department Mix");

    if departments.is_empty() {
        let _ = writeln!(output, "No students recorded.");
    } else {
        for department in departments {
            let average = department
                .avg_average
                .map(|value| format!("{value:.2}"))
                .unwrap_or_else(|| "N/A".to_string());
            let _ = writeln!(
                output,
                "- {}: {} students (avg {}), {}/{} COs on target",
                display_department(&department.department),
                department.student_count,
                average,
                department.cos_attained,
                department.cos_total
            );
        }
    }

    for (department, rows) in groups {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", display_department(department));
        let _ = writeln!(output, "| Student ID | Name | Average | CO Attainment |");
        let _ = writeln!(output, "| --- | --- | --- | --- |");
        for row in rows {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                row.student_id, row.name, row.average, row.co_attainment
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Targets Not Attained");
    let mut missed = 0;
    for (student_id, summary) in summaries {
        for co in summary.values().filter(|co| !co.target_attained) {
            let _ = writeln!(
                output,
                "- {} {}: {:.2}% against target {:.0}%",
                student_id, co.co_id, co.avg_attainment, co.target
            );
            missed += 1;
        }
    }
    if missed == 0 {
        let _ = writeln!(output, "Every computed CO met its target.");
    }

    output
}

fn display_department(department: &str) -> &str {
    if department.trim().is_empty() {
        "Unassigned"
    } else {
        department
    }
}

/// Markdown report of a semester computation: procedure parameters, every
/// category sitting per CO, then the combined CO and PO attainment.
pub fn build_semester_report(
    course: Option<&str>,
    breakdowns: &BTreeMap<CoId, CoBreakdown>,
    params: &AttainmentParameters,
    po_summary: &[PoSummary],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# CO Attainment Report");
    let _ = writeln!(output, "Course: {}", course.unwrap_or("unspecified"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Attainment Procedure");
    let _ = writeln!(output, "| Parameter | Value |");
    let _ = writeln!(output, "| --- | --- |");
    let _ = writeln!(output, "| SEE weight (x) | {} |", params.x);
    let _ = writeln!(output, "| CIA weight (y) | {} |", params.y);
    let _ = writeln!(output, "| Direct weight (u) | {} |", params.u);
    let _ = writeln!(output, "| Indirect weight (v) | {} |", params.v);
    let _ = writeln!(
        output,
        "| Level 2 / Level 3 from | {}% / {}% |",
        params.level_thresholds.level2, params.level_thresholds.level3
    );
    let _ = writeln!(
        output,
        "| Student score target | {}% |",
        params.student_score_target
    );
    let policy = match params.indirect_policy {
        IndirectPolicy::Zero => "counted as 0",
        IndirectPolicy::Exclude => "excluded",
    };
    let _ = writeln!(output, "| Missing survey | {policy} |");

    let _ = writeln!(output);
    let _ = writeln!(output, "## Direct Assessment");

    if breakdowns.is_empty() {
        let _ = writeln!(output, "No assessment scores recorded.");
    } else {
        for breakdown in breakdowns.values() {
            let _ = writeln!(output);
            let _ = writeln!(output, "### {}", breakdown.co_id);
            for category in Category::ALL {
                let sittings: Vec<String> = breakdown
                    .instances
                    .iter()
                    .filter(|((cat, _), _)| *cat == category)
                    .map(|((_, instance), value)| format!("#{instance} {value:.2}%"))
                    .collect();
                if sittings.is_empty() {
                    continue;
                }
                let _ = writeln!(
                    output,
                    "- {}: {} (avg {})",
                    category,
                    sittings.join(", "),
                    percent(breakdown.category_averages.get(&category).copied())
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Total CO Attainment");

    if breakdowns.is_empty() {
        let _ = writeln!(output, "No course outcomes computed.");
    } else {
        let _ = writeln!(
            output,
            "| CO | CIA | SEE | SEE Level | Direct | Indirect | Overall | Target | Attained |"
        );
        let _ = writeln!(output, "| --- | --- | --- | --- | --- | --- | --- | --- | --- |");
        for breakdown in breakdowns.values() {
            let level = breakdown
                .see_level
                .map(|level| level.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {:.2} | {} | {:.2} | {:.0}% | {} |",
                breakdown.co_id,
                percent(breakdown.cia),
                percent(breakdown.see_percentage),
                level,
                breakdown.direct,
                percent(breakdown.indirect),
                breakdown.overall,
                breakdown.target,
                yes_no(breakdown.target_attained)
            );
        }
    }

    if !po_summary.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## PO Attainment");
        let _ = writeln!(output, "| PO | Attainment | Target | Attained |");
        let _ = writeln!(output, "| --- | --- | --- | --- |");
        for po in po_summary {
            let _ = writeln!(
                output,
                "| {} | {:.2}% | {:.0}% | {} |",
                po.po_id,
                po.attainment,
                po.target,
                yes_no(po.target_attained)
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attainment::{aggregate_assessments, Assessment, CoScore};
    use crate::config::LevelThresholds;
    use crate::export::build_export_rows;
    use crate::models::MarkRecord;

    fn student(id: &str, department: &str, internal: f64) -> Student {
        Student {
            student_id: id.to_string(),
            name: format!("Student {id}"),
            department: department.to_string(),
            marks: vec![MarkRecord {
                internal,
                total_internal: 50.0,
                exam: 25.0,
                total_exam: 50.0,
                ..MarkRecord::default()
            }],
            course_outcomes: Vec::new(),
        }
    }

    fn summary(co: &str, attainment: f64) -> BTreeMap<CoId, CoSummary> {
        BTreeMap::from([(
            CoId::new(co),
            CoSummary {
                co_id: CoId::new(co),
                avg_attainment: attainment,
                target: 70.0,
                target_attained: attainment >= 70.0,
            },
        )])
    }

    #[test]
    fn summarizes_departments_by_size() {
        let students = vec![
            student("S1", "ECE", 50.0),
            student("S2", "CSE", 25.0),
            student("S3", "CSE", 50.0),
        ];
        let summaries = BTreeMap::from([
            ("S2".to_string(), summary("CO1", 40.0)),
            ("S3".to_string(), summary("CO1", 80.0)),
        ]);
        let departments = summarize_by_department(&students, &summaries);

        assert_eq!(departments[0].department, "CSE");
        assert_eq!(departments[0].student_count, 2);
        assert_eq!(departments[0].avg_average, Some(62.5));
        assert_eq!(departments[0].cos_attained, 1);
        assert_eq!(departments[0].cos_total, 2);
        assert_eq!(departments[1].avg_average, Some(75.0));
    }

    #[test]
    fn performance_report_lists_departments_and_misses() {
        let students = vec![student("S1", "CSE", 50.0), student("S2", "", 25.0)];
        let summaries = BTreeMap::from([("S1".to_string(), summary("CO1", 55.0))]);
        let groups = build_export_rows(&students, &summaries, &LevelThresholds::default());
        let departments = summarize_by_department(&students, &summaries);
        let date = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();

        let report = build_performance_report(date, &groups, &departments, &summaries);
        assert!(report.starts_with("# Student Performance Report\nGenerated on 2026-05-01"));
        assert!(report.contains("## CSE"));
        assert!(report.contains("## Unassigned"));
        assert!(report.contains("| S1 | Student S1 | 75.00 | CO1: 55.00% (Level 1) |"));
        assert!(report.contains("- S1 CO1: 55.00% against target 70%"));
    }

    #[test]
    fn performance_report_without_misses() {
        let report = build_performance_report(
            NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            &BTreeMap::new(),
            &[],
            &BTreeMap::new(),
        );
        assert!(report.contains("No students recorded."));
        assert!(report.contains("Every computed CO met its target."));
    }

    #[test]
    fn semester_report_traces_each_step() {
        let assessments = vec![
            Assessment {
                category: Category::Assignment,
                instance: 2,
                scores: vec![CoScore {
                    co_id: CoId::new("CO1"),
                    scored: 8.0,
                    total: 10.0,
                }],
            },
            Assessment {
                category: Category::External,
                instance: 1,
                scores: vec![CoScore {
                    co_id: CoId::new("CO1"),
                    scored: 65.0,
                    total: 100.0,
                }],
            },
        ];
        let params = AttainmentParameters::default();
        let breakdowns = aggregate_assessments(&assessments, &BTreeMap::new(), &[], &params);
        let po = vec![PoSummary {
            po_id: "PO1".to_string(),
            attainment: 72.0,
            target: 70.0,
            target_attained: true,
        }];

        let report = build_semester_report(Some("CS301"), &breakdowns, &params, &po);
        assert!(report.contains("Course: CS301"));
        assert!(report.contains("- Assignment: #2 80.00% (avg 80.00%)"));
        assert!(report.contains("| CO1 | 80.00% | 65.00% | 2 |"));
        assert!(report.contains("| Missing survey | counted as 0 |"));
        assert!(report.contains("| PO1 | 72.00% | 70% | Yes |"));
    }

    #[test]
    fn semester_report_handles_no_scores() {
        let report = build_semester_report(
            None,
            &BTreeMap::new(),
            &AttainmentParameters::default(),
            &[],
        );
        assert!(report.contains("No assessment scores recorded."));
        assert!(!report.contains("## PO Attainment"));
    }
}
