//! Cell-level extraction from metric worksheets.
//!
//! Cells arrive untyped; they are narrowed to a strict tagged variant at the
//! boundary and everything downstream works on that. Numeric blanks read as
//! absent, never as coerced zeros, so a row with no numeric cell is ignored
//! rather than misread.

use calamine::{Data, Range};

use super::{HeadlineTarget, HeadlineTargets, MetricRow};
use crate::models::Distinctiveness;

/// Narrowed cell value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

pub(crate) fn to_cells(range: &Range<Data>) -> Vec<Vec<Cell>> {
    range
        .rows()
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Data::String(s) => {
                        let t = s.trim();
                        if t.is_empty() {
                            Cell::Empty
                        } else {
                            Cell::Text(t.to_string())
                        }
                    }
                    Data::Float(f) => Cell::Number(*f),
                    Data::Int(i) => Cell::Number(*i as f64),
                    _ => Cell::Empty,
                })
                .collect()
        })
        .collect()
}

/// Scan a trading-summary sheet.
///
/// Section headers of the form `<Band> Distinctiveness` open a band; habitat
/// rows below them inherit it. Rows encountered outside any recognised band
/// still flow through, tagged `distinctiveness: None`, and are reported.
pub(crate) fn extract_ledger_rows(rows: &[Vec<Cell>]) -> (Vec<MetricRow>, Vec<String>) {
    let mut out = Vec::new();
    let mut warnings = Vec::new();
    let mut band: Option<Distinctiveness> = None;

    for row in rows {
        let Some(label) = first_text(row) else {
            continue;
        };

        if let Some(section_band) = parse_band_header(label) {
            band = section_band;
            if band.is_none() {
                warnings.push(format!("unrecognised distinctiveness section '{label}'"));
            }
            continue;
        }
        if is_noise_row(label) {
            continue;
        }

        let Some(net_units) = last_number(row) else {
            continue;
        };
        if net_units == 0.0 {
            continue;
        }

        if band.is_none() && net_units < 0.0 {
            warnings.push(format!(
                "deficit row '{label}' has unresolved distinctiveness; carried forward without offsetting"
            ));
        }

        out.push(MetricRow {
            habitat_name: label.to_string(),
            broader_type: broader_type_of(label),
            distinctiveness: band,
            net_units,
        });
    }

    (out, warnings)
}

/// Read the Headline Results targets. One row per ledger: the label names the
/// ledger's units, the first numeric cell is the baseline, the second the
/// target percentage (values >= 1 are percent, < 1 already a fraction).
pub(crate) fn extract_headline(rows: &[Vec<Cell>]) -> HeadlineTargets {
    let mut targets = HeadlineTargets::default();

    for row in rows {
        let Some(label) = first_text(row) else {
            continue;
        };
        let lower = label.to_ascii_lowercase();

        let slot = if lower.contains("hedgerow units") {
            &mut targets.hedgerow
        } else if lower.contains("watercourse units") {
            &mut targets.watercourse
        } else if lower.contains("habitat units") || lower.contains("area units") {
            &mut targets.area
        } else {
            continue;
        };

        let numbers: Vec<f64> = row
            .iter()
            .filter_map(|c| match c {
                Cell::Number(n) => Some(*n),
                _ => None,
            })
            .collect();
        if numbers.len() < 2 {
            continue;
        }

        let baseline_units = numbers[0].max(0.0);
        let raw_target = numbers[1];
        let target_percent = if raw_target >= 1.0 {
            raw_target / 100.0
        } else {
            raw_target
        };

        *slot = Some(HeadlineTarget {
            baseline_units,
            target_percent,
        });
    }

    targets
}

fn first_text(row: &[Cell]) -> Option<&str> {
    row.iter().find_map(|c| match c {
        Cell::Text(s) => Some(s.as_str()),
        _ => None,
    })
}

fn last_number(row: &[Cell]) -> Option<f64> {
    row.iter().rev().find_map(|c| match c {
        Cell::Number(n) => Some(*n),
        _ => None,
    })
}

/// `"Medium Distinctiveness"` → `Some(Some(Medium))`;
/// `"Unknown Distinctiveness"` → `Some(None)`; anything else → `None`.
fn parse_band_header(label: &str) -> Option<Option<Distinctiveness>> {
    let lower = label.to_ascii_lowercase();
    let prefix = lower.strip_suffix("distinctiveness")?.trim_end();
    Some(Distinctiveness::parse(prefix))
}

fn is_noise_row(label: &str) -> bool {
    let lower = label.to_ascii_lowercase();
    lower == "habitat"
        || lower == "habitat type"
        || lower.contains("total")
        || lower.contains("project-wide")
}

/// Metric habitat names read `"Broader type - Habitat"`.
fn broader_type_of(label: &str) -> Option<String> {
    label
        .split_once(" - ")
        .map(|(broader, _)| broader.trim().to_string())
}
