use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;
use rust_xlsxwriter::Workbook;
use serde::Serialize;

use crate::analytics::{format_average, student_average};
use crate::attainment::classify;
use crate::config::LevelThresholds;
use crate::models::{CoId, CoSummary, Student};

pub const EXPORT_HEADERS: [&str; 5] = [
    "studentId",
    "name",
    "department",
    "average",
    "coAttainment",
];
const MAX_SHEET_NAME: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Xlsx,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub student_id: String,
    pub name: String,
    pub department: String,
    pub average: String,
    pub co_attainment: String,
}

/// `"CO1: 72.50% (Level 3), CO2: …"`, or `"N/A"` when there is nothing to show.
pub fn describe_co_attainment(
    summary: &BTreeMap<CoId, CoSummary>,
    thresholds: &LevelThresholds,
) -> String {
    if summary.is_empty() {
        return "N/A".to_string();
    }
    summary
        .values()
        .map(|co| {
            format!(
                "{}: {:.2}% (Level {})",
                co.co_id,
                co.avg_attainment,
                classify(co.avg_attainment, thresholds)
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Export rows grouped by department, in student order within each group.
pub fn build_export_rows(
    students: &[Student],
    summaries: &BTreeMap<String, BTreeMap<CoId, CoSummary>>,
    thresholds: &LevelThresholds,
) -> BTreeMap<String, Vec<ExportRow>> {
    let empty = BTreeMap::new();
    let mut groups: BTreeMap<String, Vec<ExportRow>> = BTreeMap::new();
    for student in students {
        let summary = summaries.get(&student.student_id).unwrap_or(&empty);
        groups
            .entry(student.department.clone())
            .or_default()
            .push(ExportRow {
                student_id: student.student_id.clone(),
                name: student.name.clone(),
                department: student.department.clone(),
                average: format_average(student_average(&student.marks)),
                co_attainment: describe_co_attainment(summary, thresholds),
            });
    }
    groups
}

pub fn write_csv(path: &Path, groups: &BTreeMap<String, Vec<ExportRow>>) -> anyhow::Result<usize> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(EXPORT_HEADERS)?;
    let mut written = 0;
    for row in groups.values().flatten() {
        writer.serialize(row)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Worksheet names are limited to 31 characters and may not contain `[]:*?/\`.
pub fn sheet_name(department: &str, taken: &[String]) -> String {
    let cleaned: String = department
        .trim()
        .chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_matches('\'').to_string();
    let base = if cleaned.is_empty() {
        "Unassigned".to_string()
    } else {
        cleaned
    };

    let mut suffix = 1;
    loop {
        let tag = if suffix == 1 {
            String::new()
        } else {
            format!(" ({suffix})")
        };
        let keep = MAX_SHEET_NAME - tag.chars().count();
        let candidate: String = base.chars().take(keep).chain(tag.chars()).collect();
        if !taken.iter().any(|name| name.eq_ignore_ascii_case(&candidate)) {
            return candidate;
        }
        suffix += 1;
    }
}

/// One worksheet per department.
pub fn write_xlsx(path: &Path, groups: &BTreeMap<String, Vec<ExportRow>>) -> anyhow::Result<usize> {
    let mut workbook = Workbook::new();
    let mut taken = Vec::new();
    let mut written = 0;

    for (department, rows) in groups {
        let name = sheet_name(department, &taken);
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&name)?;
        taken.push(name);

        for (col, header) in EXPORT_HEADERS.iter().enumerate() {
            worksheet.write_string(0, col as u16, *header)?;
        }
        for (index, row) in rows.iter().enumerate() {
            let r = index as u32 + 1;
            worksheet.write_string(r, 0, &row.student_id)?;
            worksheet.write_string(r, 1, &row.name)?;
            worksheet.write_string(r, 2, &row.department)?;
            match row.average.parse::<f64>() {
                Ok(average) => worksheet.write_number(r, 3, average)?,
                Err(_) => worksheet.write_string(r, 3, &row.average)?,
            };
            worksheet.write_string(r, 4, &row.co_attainment)?;
            written += 1;
        }
    }

    workbook
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(written)
}
