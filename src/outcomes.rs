use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use tracing::warn;

use crate::config::AttainmentParameters;
use crate::import::HeaderIndex;
use crate::models::{parse_number, CoId, CoSummary, PoSummary};

pub const MAX_CORRELATION: f64 = 3.0;

/// CO to PO correlation strengths (0 = none, 3 = strong).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoMatrix {
    po_ids: Vec<String>,
    strengths: BTreeMap<CoId, BTreeMap<String, f64>>,
}

impl PoMatrix {
    pub fn set(&mut self, co_id: CoId, po_id: &str, strength: f64) {
        let po_id = po_id.trim().to_ascii_uppercase();
        if !self.po_ids.contains(&po_id) {
            self.po_ids.push(po_id.clone());
        }
        self.strengths
            .entry(co_id)
            .or_default()
            .insert(po_id, strength.clamp(0.0, MAX_CORRELATION));
    }

    pub fn po_ids(&self) -> &[String] {
        &self.po_ids
    }

    pub fn is_empty(&self) -> bool {
        self.strengths.is_empty()
    }
}

/// Reads a matrix with a `co` column followed by one column per PO.
pub fn read_po_matrix<R: Read>(source: R) -> anyhow::Result<PoMatrix> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(source);
    let header_row = reader.headers().context("failed to read header row")?.clone();
    let headers = HeaderIndex::new(&header_row);
    let po_columns: Vec<&str> = header_row
        .iter()
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("co"))
        .collect();

    let mut matrix = PoMatrix::default();
    for (index, result) in reader.records().enumerate() {
        let row = index + 2;
        let Ok(record) = result else {
            warn!(row, "skipping unreadable PO matrix row");
            continue;
        };
        let Some(co) = headers.get(&record, &["co"]) else {
            warn!(row, "skipping PO matrix row without a CO");
            continue;
        };
        for po in &po_columns {
            let strength = headers
                .get(&record, &[*po])
                .and_then(parse_number)
                .unwrap_or(0.0);
            matrix.set(CoId::new(co), po, strength);
        }
    }

    Ok(matrix)
}

pub fn load_po_matrix(path: &Path) -> anyhow::Result<PoMatrix> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open PO matrix {}", path.display()))?;
    read_po_matrix(file)
}

/// Strength-weighted mean of CO attainment for each PO. POs with no
/// correlated CO in `co_summary` are left out.
pub fn po_attainment(
    matrix: &PoMatrix,
    co_summary: &BTreeMap<CoId, CoSummary>,
    params: &AttainmentParameters,
) -> Vec<PoSummary> {
    matrix
        .po_ids()
        .iter()
        .filter_map(|po_id| {
            let (weighted, weight) = matrix
                .strengths
                .iter()
                .filter_map(|(co_id, row)| {
                    let strength = row.get(po_id).copied().unwrap_or(0.0);
                    let co = co_summary.get(co_id)?;
                    (strength > 0.0).then_some((strength * co.avg_attainment, strength))
                })
                .fold((0.0, 0.0), |(sum, total), (value, strength)| {
                    (sum + value, total + strength)
                });
            if weight <= 0.0 {
                return None;
            }
            let attainment = weighted / weight;
            Some(PoSummary {
                po_id: po_id.clone(),
                attainment,
                target: params.default_po_target,
                target_attained: attainment >= params.default_po_target,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(entries: &[(&str, f64)]) -> BTreeMap<CoId, CoSummary> {
        entries
            .iter()
            .map(|(co, value)| {
                (
                    CoId::new(co),
                    CoSummary {
                        co_id: CoId::new(co),
                        avg_attainment: *value,
                        target: 70.0,
                        target_attained: *value >= 70.0,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn weights_co_attainment_by_strength() {
        let data = "co,PO1,PO2,po3\nCO1,3,1,0\nCO2,1,,0\n";
        let matrix = read_po_matrix(data.as_bytes()).unwrap();
        assert_eq!(matrix.po_ids(), &["PO1", "PO2", "PO3"]);

        let pos = po_attainment(
            &matrix,
            &summary(&[("CO1", 80.0), ("CO2", 40.0)]),
            &AttainmentParameters::default(),
        );
        assert_eq!(pos.len(), 2);
        assert_eq!(pos[0].po_id, "PO1");
        assert_eq!(pos[0].attainment, 70.0);
        assert!(pos[0].target_attained);
        assert_eq!(pos[1].attainment, 80.0);
    }

    #[test]
    fn strengths_are_clamped() {
        let mut matrix = PoMatrix::default();
        matrix.set(CoId::new("CO1"), "po1", 9.0);
        matrix.set(CoId::new("CO2"), "po1", 3.0);
        let pos = po_attainment(
            &matrix,
            &summary(&[("CO1", 90.0), ("CO2", 30.0)]),
            &AttainmentParameters::default(),
        );
        assert_eq!(pos[0].attainment, 60.0);
        assert!(!pos[0].target_attained);
    }

    #[test]
    fn missing_cos_leave_po_out() {
        let mut matrix = PoMatrix::default();
        matrix.set(CoId::new("CO5"), "PO1", 2.0);
        let pos = po_attainment(
            &matrix,
            &summary(&[("CO1", 90.0)]),
            &AttainmentParameters::default(),
        );
        assert!(pos.is_empty());
    }
}
