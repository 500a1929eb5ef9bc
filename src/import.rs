use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use chrono::{Datelike, Utc};
use csv::StringRecord;
use thiserror::Error;
use tracing::{debug, warn};

use crate::attainment::{Assessment, Category, CoScore};
use crate::models::{
    default_target, parse_number, CoId, CoMarkEntry, CourseOutcomeTarget, MarkRecord, Student,
};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("row {row}: missing required field `{field}`")]
    MalformedRow { row: usize, field: &'static str },
    #[error("row {row}: unreadable record: {source}")]
    Unreadable {
        row: usize,
        #[source]
        source: csv::Error,
    },
}

/// Column lookup keyed by header text, case- and whitespace-insensitive.
#[derive(Debug, Clone)]
pub struct HeaderIndex {
    columns: HashMap<String, usize>,
}

fn normalize_header(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl HeaderIndex {
    pub fn new(headers: &StringRecord) -> Self {
        let mut columns = HashMap::new();
        for (index, header) in headers.iter().enumerate() {
            columns.entry(normalize_header(header)).or_insert(index);
        }
        Self { columns }
    }

    pub fn has(&self, name: &str) -> bool {
        self.columns.contains_key(&normalize_header(name))
    }

    /// Trimmed, non-empty cell under the first matching header name.
    pub fn get<'r>(&self, record: &'r StringRecord, names: &[&str]) -> Option<&'r str> {
        names.iter().find_map(|name| {
            let index = *self.columns.get(&normalize_header(name))?;
            record
                .get(index)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
    }

    /// Numeric cell; blank or non-numeric cells read as 0.
    pub fn number(&self, record: &StringRecord, names: &[&str]) -> f64 {
        self.get(record, names).and_then(parse_number).unwrap_or(0.0)
    }

    pub fn co_columns<'a>(&'a self, record: &'a StringRecord) -> CoColumns<'a> {
        CoColumns {
            headers: self,
            record,
            next: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoFields {
    pub internal: f64,
    pub internal_total: f64,
    pub exam: f64,
    pub exam_total: f64,
    pub target: Option<f64>,
}

/// Walks `co1 …`, `co2 …` column groups of one row until a group has no
/// columns at all.
pub struct CoColumns<'a> {
    headers: &'a HeaderIndex,
    record: &'a StringRecord,
    next: usize,
}

impl<'a> Iterator for CoColumns<'a> {
    type Item = (CoId, CoFields);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.next;
        let internal = format!("co{n} internal marks");
        let internal_total = format!("co{n} internal total");
        let exam = format!("co{n} exam marks");
        let exam_total = format!("co{n} exam total");
        let target = format!("co{n} target %");

        let present = [&internal, &internal_total, &exam, &exam_total, &target]
            .iter()
            .any(|name| self.headers.has(name));
        if !present {
            return None;
        }
        self.next += 1;

        let fields = CoFields {
            internal: self.headers.number(self.record, &[internal.as_str()]),
            internal_total: self.headers.number(self.record, &[internal_total.as_str()]),
            exam: self.headers.number(self.record, &[exam.as_str()]),
            exam_total: self.headers.number(self.record, &[exam_total.as_str()]),
            target: self
                .headers
                .get(self.record, &[target.as_str()])
                .and_then(parse_number),
        };
        Some((CoId::numbered(n), fields))
    }
}

#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub students: Vec<Student>,
    pub rejected: Vec<ImportError>,
}

const STUDENT_ID: &[&str] = &["studentId", "student_id", "student id", "id"];
const NAME: &[&str] = &["name", "student name"];
const DEPARTMENT: &[&str] = &["department", "dept"];

fn student_from_row(
    headers: &HeaderIndex,
    record: &StringRecord,
    row: usize,
    default_year: &str,
) -> Result<Student, ImportError> {
    let required = |names: &[&str], field: &'static str| {
        headers
            .get(record, names)
            .map(str::to_string)
            .ok_or(ImportError::MalformedRow { row, field })
    };
    let student_id = required(STUDENT_ID, "studentId")?;
    let name = required(NAME, "name")?;
    let department = required(DEPARTMENT, "department")?;

    let mut co_mapping = Vec::new();
    let mut course_outcomes = Vec::new();
    for (co_id, fields) in headers.co_columns(record) {
        course_outcomes.push(CourseOutcomeTarget {
            co_id: co_id.clone(),
            target: fields.target.unwrap_or_else(default_target),
        });
        co_mapping.push(CoMarkEntry {
            co_id,
            internal: fields.internal,
            exam: fields.exam,
            total_internal: fields.internal_total,
            total_exam: fields.exam_total,
        });
    }

    let marks = MarkRecord {
        year: headers
            .get(record, &["year"])
            .unwrap_or(default_year)
            .to_string(),
        internal: headers.number(record, &["internal marks", "internal"]),
        exam: headers.number(record, &["exam marks", "exam"]),
        total_internal: headers.number(record, &["internal total", "total internal"]),
        total_exam: headers.number(record, &["exam total", "total exam"]),
        co_mapping,
    };

    Ok(Student {
        student_id,
        name,
        department,
        marks: vec![marks],
        course_outcomes,
    })
}

fn merge_into(existing: &mut Student, incoming: Student) {
    existing.marks.extend(incoming.marks);
    for target in incoming.course_outcomes {
        match existing
            .course_outcomes
            .iter_mut()
            .find(|current| current.co_id == target.co_id)
        {
            Some(current) => current.target = target.target,
            None => existing.course_outcomes.push(target),
        }
    }
}

/// Parses student rows. Rows lacking an identity field are rejected
/// individually; rows repeating a student id add another mark record to that
/// student.
pub fn parse_students<R: Read>(source: R) -> anyhow::Result<ImportOutcome> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(source);
    let headers = HeaderIndex::new(reader.headers().context("failed to read header row")?);
    let default_year = Utc::now().year().to_string();

    let mut outcome = ImportOutcome::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (index, result) in reader.records().enumerate() {
        let row = index + 2;
        let parsed = result
            .map_err(|source| ImportError::Unreadable { row, source })
            .and_then(|record| student_from_row(&headers, &record, row, &default_year));

        match parsed {
            Ok(student) => match positions.get(&student.student_id) {
                Some(&position) => {
                    debug!(row, student = %student.student_id, "merging repeated student row");
                    merge_into(&mut outcome.students[position], student);
                }
                None => {
                    positions.insert(student.student_id.clone(), outcome.students.len());
                    outcome.students.push(student);
                }
            },
            Err(err) => {
                warn!(error = %err, "dropping spreadsheet row");
                outcome.rejected.push(err);
            }
        }
    }

    Ok(outcome)
}

pub fn import_students(path: &Path) -> anyhow::Result<ImportOutcome> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    parse_students(file)
}

/// Reads a category worksheet with `assessment`, `co`, `scored` and `total`
/// columns into one assessment per sitting number.
pub fn read_worksheet<R: Read>(source: R, category: Category) -> anyhow::Result<Vec<Assessment>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(source);
    let headers = HeaderIndex::new(reader.headers().context("failed to read header row")?);
    let mut sittings: BTreeMap<u32, Vec<CoScore>> = BTreeMap::new();

    for (index, result) in reader.records().enumerate() {
        let row = index + 2;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                warn!(row, %category, error = %err, "skipping unreadable worksheet row");
                continue;
            }
        };
        let Some(co) = headers.get(&record, &["co", "coId", "co id"]) else {
            warn!(row, %category, "skipping worksheet row without a CO");
            continue;
        };
        let instance = headers
            .get(&record, &["assessment", "instance"])
            .and_then(parse_number)
            .map(|value| value.max(1.0) as u32)
            .unwrap_or(1);

        sittings.entry(instance).or_default().push(CoScore {
            co_id: CoId::new(co),
            scored: headers.number(&record, &["scored", "marks", "obtained"]),
            total: headers.number(&record, &["total", "max"]),
        });
    }

    Ok(sittings
        .into_iter()
        .map(|(instance, scores)| Assessment {
            category,
            instance,
            scores,
        })
        .collect())
}

pub fn load_worksheet(path: &Path, category: Category) -> anyhow::Result<Vec<Assessment>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} worksheet {}", category, path.display()))?;
    read_worksheet(file, category)
}

/// Reads course-exit-survey attainment (`co`, `attainment`) per CO.
pub fn read_survey<R: Read>(source: R) -> anyhow::Result<BTreeMap<CoId, f64>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(source);
    let headers = HeaderIndex::new(reader.headers().context("failed to read header row")?);
    let mut survey = BTreeMap::new();

    for (index, result) in reader.records().enumerate() {
        let row = index + 2;
        let Ok(record) = result else {
            warn!(row, "skipping unreadable survey row");
            continue;
        };
        let Some(co) = headers.get(&record, &["co", "coId", "co id"]) else {
            warn!(row, "skipping survey row without a CO");
            continue;
        };
        match headers
            .get(&record, &["attainment", "attainment %"])
            .and_then(parse_number)
        {
            Some(value) => {
                survey.insert(CoId::new(co), value.clamp(0.0, 100.0));
            }
            None => warn!(row, co, "survey attainment is not numeric"),
        }
    }

    Ok(survey)
}

pub fn load_survey(path: &Path) -> anyhow::Result<BTreeMap<CoId, f64>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open survey {}", path.display()))?;
    read_survey(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "studentId,name,department,year,\
internal marks,internal total,exam marks,exam total,\
co1 internal marks,co1 internal total,co1 exam marks,co1 exam total,co1 target %,\
co2 internal marks,co2 internal total,co2 exam marks,co2 exam total,co2 target %";

    #[test]
    fn drops_rows_missing_identity_but_keeps_the_rest() {
        let data = format!(
            "{HEADER}\n\
S1,Avery Lee,CSE,2025,40,50,30,50,8,10,6,10,75,7,10,5,10,\n\
S2,Jules Moreno,,2025,40,50,30,50,8,10,6,10,75,7,10,5,10,70\n\
S3,Kiara Patel,ECE,2025,20,50,45,50,4,10,9,10,70,3,10,8,10,65\n"
        );
        let outcome = parse_students(data.as_bytes()).unwrap();

        let ids: Vec<&str> = outcome.students.iter().map(|s| s.student_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S3"]);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(matches!(
            outcome.rejected[0],
            ImportError::MalformedRow { row: 3, field: "department" }
        ));
    }

    #[test]
    fn discovers_numbered_co_columns() {
        let data = format!("{HEADER}\nS1,Avery Lee,CSE,2025,40,50,30,50,8,10,6,10,75,7,10,x,10,\n");
        let outcome = parse_students(data.as_bytes()).unwrap();
        let student = &outcome.students[0];
        let record = &student.marks[0];

        assert_eq!(record.internal, 40.0);
        assert_eq!(record.total_exam, 50.0);
        assert_eq!(record.co_mapping.len(), 2);
        assert_eq!(record.co_mapping[1].co_id.as_str(), "CO2");
        assert_eq!(record.co_mapping[1].exam, 0.0);
        assert_eq!(student.course_outcomes[0].target, 75.0);
        assert_eq!(student.course_outcomes[1].target, 70.0);
    }

    #[test]
    fn co_iterator_restarts_per_row() {
        let headers = StringRecord::from(vec![
            "co1 internal marks",
            "co2 internal marks",
            "co4 internal marks",
        ]);
        let index = HeaderIndex::new(&headers);
        let row = StringRecord::from(vec!["1", "2", "4"]);

        let first: Vec<CoId> = index.co_columns(&row).map(|(co, _)| co).collect();
        let second: Vec<CoId> = index.co_columns(&row).map(|(co, _)| co).collect();
        assert_eq!(first, vec![CoId::numbered(1), CoId::numbered(2)]);
        assert_eq!(first, second);
    }

    #[test]
    fn repeated_student_rows_merge_marks() {
        let data = format!(
            "{HEADER}\n\
S1,Avery Lee,CSE,2024,40,50,30,50,8,10,6,10,70,7,10,5,10,70\n\
S1,Avery Lee,CSE,2025,45,50,35,50,9,10,7,10,80,8,10,6,10,70\n"
        );
        let outcome = parse_students(data.as_bytes()).unwrap();
        assert_eq!(outcome.students.len(), 1);
        let student = &outcome.students[0];
        assert_eq!(student.marks.len(), 2);
        assert_eq!(student.marks[1].year, "2025");
        assert_eq!(student.course_outcomes.len(), 2);
        assert_eq!(student.course_outcomes[0].target, 80.0);
    }

    #[test]
    fn missing_year_defaults_to_current() {
        let data = "studentId,name,department\nS1,Avery Lee,CSE\n";
        let outcome = parse_students(data.as_bytes()).unwrap();
        assert_eq!(outcome.students[0].marks[0].year, Utc::now().year().to_string());
        assert!(outcome.students[0].marks[0].co_mapping.is_empty());
    }

    #[test]
    fn worksheet_groups_rows_by_sitting() {
        let data = "assessment,co,scored,total\n\
1,CO1,8,10\n2,CO1,6,10\n1,CO2,5,10\n\
,CO3,4,10\n2,,9,10\n";
        let sittings = read_worksheet(data.as_bytes(), Category::InternalExam).unwrap();

        assert_eq!(sittings.len(), 2);
        assert_eq!(sittings[0].instance, 1);
        assert_eq!(sittings[0].scores.len(), 3);
        assert_eq!(sittings[1].scores.len(), 1);
        assert!(sittings.iter().all(|s| s.category == Category::InternalExam));
    }

    #[test]
    fn survey_file_reads_per_co_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "co,attainment\nCO1,82\nCO2,abc\nCO3,120").unwrap();

        let survey = load_survey(file.path()).unwrap();
        assert_eq!(survey.get(&CoId::new("CO1")), Some(&82.0));
        assert!(!survey.contains_key(&CoId::new("CO2")));
        assert_eq!(survey.get(&CoId::new("CO3")), Some(&100.0));
    }

    #[test]
    fn import_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "studentId,name,department\nS9,Robin Park,MECH\n,No Id,CSE").unwrap();
        let outcome = import_students(file.path()).unwrap();
        assert_eq!(outcome.students.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
    }
}
