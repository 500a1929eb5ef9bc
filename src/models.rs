use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Course outcome identifier such as `CO3`.
///
/// Identifiers are trimmed and upper-cased on construction and order naturally,
/// so `CO2` sorts before `CO10`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CoId(String);

impl CoId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    pub fn numbered(n: usize) -> Self {
        Self(format!("CO{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sort_key(&self) -> (&str, Option<u64>) {
        let split = self
            .0
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(self.0.len());
        let (prefix, digits) = self.0.split_at(split);
        (prefix, digits.parse().ok())
    }
}

impl From<String> for CoId {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<CoId> for String {
    fn from(value: CoId) -> Self {
        value.0
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for CoId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for CoId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoMarkEntry {
    pub co_id: CoId,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub internal: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub exam: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_internal: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_exam: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub year: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub internal: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub exam: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_internal: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_exam: f64,
    #[serde(default, alias = "MarksCoMappings")]
    pub co_mapping: Vec<CoMarkEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseOutcomeTarget {
    pub co_id: CoId,
    #[serde(default = "default_target", deserialize_with = "lenient_target")]
    pub target: f64,
}

pub fn default_target() -> f64 {
    70.0
}

/// Student record as served by the persistence API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Student {
    #[serde(default, deserialize_with = "lenient_string")]
    pub student_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub department: String,
    #[serde(rename = "Marks", alias = "marks", default)]
    pub marks: Vec<MarkRecord>,
    #[serde(rename = "CourseOutcomes", alias = "courseOutcomes", default)]
    pub course_outcomes: Vec<CourseOutcomeTarget>,
}

impl Student {
    pub fn has_valid_id(&self) -> bool {
        !self.student_id.trim().is_empty()
    }
}

/// Body of `POST /students`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub student_id: String,
    pub name: String,
    pub department: String,
    pub marks: Vec<MarkRecord>,
    pub course_outcomes: Vec<CourseOutcomeTarget>,
}

impl From<&Student> for NewStudent {
    fn from(student: &Student) -> Self {
        Self {
            student_id: student.student_id.clone(),
            name: student.name.clone(),
            department: student.department.clone(),
            marks: student.marks.clone(),
            course_outcomes: student.course_outcomes.clone(),
        }
    }
}

/// Body of `PUT /students/{id}`; absent parts are left untouched upstream.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marks: Option<Vec<MarkRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_outcomes: Option<Vec<CourseOutcomeTarget>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoSummary {
    pub co_id: CoId,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub avg_attainment: f64,
    #[serde(default = "default_target", deserialize_with = "lenient_target")]
    pub target: f64,
    #[serde(default)]
    pub target_attained: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoSummary {
    pub po_id: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub attainment: f64,
    #[serde(default = "default_target", deserialize_with = "lenient_target")]
    pub target: f64,
    #[serde(default)]
    pub target_attained: bool,
}

/// Response of `GET /students/calculate-co-po/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttainmentReport {
    #[serde(default)]
    pub co_summary: Vec<CoSummary>,
    #[serde(default)]
    pub po_summary: Vec<PoSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepartmentSummary {
    pub department: String,
    pub student_count: usize,
    pub avg_average: Option<f64>,
    pub cos_attained: usize,
    pub cos_total: usize,
}

/// Accepts numbers, numeric strings and nulls; anything unparseable becomes 0.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_number).unwrap_or(0.0))
}

fn lenient_target<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(json_number)
        .unwrap_or_else(default_target))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_number(s),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Parses a user-supplied numeric cell, tolerating surrounding whitespace and a
/// trailing `%`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}
