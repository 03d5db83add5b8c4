//! Biodiversity-metric workbook ingestion.
//!
//! Converts a spreadsheet-style metric file into canonical demand lists per
//! ledger, applying permissible on-site offsets first so the engine only ever
//! sees residual (off-site) demand.

mod offsets;
mod workbook;

pub use offsets::{apply_offsets, OffsetOutcome};

use std::io::Cursor;

use calamine::{Reader, Xlsx};
use tracing::debug;

use crate::models::{DemandLine, Distinctiveness, ErrorKind, JobError, Ledger};

/// One habitat row lifted from a ledger sheet. `net_units` is the per-project
/// net unit change: negative = deficit, positive = surplus.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub habitat_name: String,
    pub broader_type: Option<String>,
    pub distinctiveness: Option<Distinctiveness>,
    pub net_units: f64,
}

/// Headline net-gain target for one ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadlineTarget {
    pub baseline_units: f64,
    pub target_percent: f64,
}

/// Parser output: the demand the site must buy off-site, plus any warnings
/// the caller should see.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricOutcome {
    pub demand: Vec<DemandLine>,
    pub warnings: Vec<String>,
}

const SHEET_FRAGMENTS: [(Ledger, &str); 3] = [
    (Ledger::Area, "trading summary area habitats"),
    (Ledger::Hedgerow, "trading summary hedgerows"),
    (Ledger::Watercourse, "trading summary watercourses"),
];

const HEADLINE_FRAGMENT: &str = "headline results";

/// Parse workbook bytes into per-ledger demand.
///
/// Missing sheets degrade to warnings; a workbook with no recognisable sheet
/// at all is rejected as invalid input.
pub fn parse_metric(bytes: &[u8]) -> Result<MetricOutcome, JobError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut wb: Xlsx<_> = Xlsx::new(cursor).map_err(|e| {
        JobError::new(ErrorKind::InputInvalid, format!("unreadable metric workbook: {e}"))
    })?;

    let sheet_names = wb.sheet_names().to_owned();
    let mut outcome = MetricOutcome::default();
    let mut any_sheet = false;

    let headline = match find_sheet(&sheet_names, HEADLINE_FRAGMENT) {
        Some(name) => {
            any_sheet = true;
            let rows = load_rows(&mut wb, &name)?;
            workbook::extract_headline(&rows)
        }
        None => {
            outcome
                .warnings
                .push("metric file has no Headline Results sheet; net-gain targets skipped".to_string());
            Default::default()
        }
    };

    for (ledger, fragment) in SHEET_FRAGMENTS {
        let Some(name) = find_sheet(&sheet_names, fragment) else {
            outcome.warnings.push(format!(
                "metric file has no {} trading summary sheet",
                ledger.as_str()
            ));
            continue;
        };
        any_sheet = true;

        let rows = load_rows(&mut wb, &name)?;
        let (metric_rows, mut sheet_warnings) = workbook::extract_ledger_rows(&rows);
        debug!(
            ledger = ledger.as_str(),
            sheet = %name,
            rows = metric_rows.len(),
            "metric sheet extracted"
        );
        outcome.warnings.append(&mut sheet_warnings);

        let offset = apply_offsets(ledger, metric_rows);
        outcome.warnings.extend(offset.warnings);

        let mut demand = offset.demand;
        if let Some(target) = headline.get(ledger) {
            let residual = target.baseline_units * target.target_percent - offset.remaining_surplus;
            if residual > 1e-9 {
                demand.push(DemandLine::net_gain(ledger, residual));
            }
        }
        outcome.demand.extend(demand);
    }

    if !any_sheet {
        return Err(JobError::new(
            ErrorKind::InputInvalid,
            "metric workbook contains none of the expected sheets",
        ));
    }

    Ok(outcome)
}

fn find_sheet(names: &[String], fragment: &str) -> Option<String> {
    names
        .iter()
        .find(|n| n.to_ascii_lowercase().contains(fragment))
        .cloned()
}

fn load_rows(
    wb: &mut Xlsx<Cursor<Vec<u8>>>,
    name: &str,
) -> Result<Vec<Vec<workbook::Cell>>, JobError> {
    let range = wb.worksheet_range(name).map_err(|e| {
        JobError::new(
            ErrorKind::InputInvalid,
            format!("metric sheet '{name}' unreadable: {e}"),
        )
    })?;
    Ok(workbook::to_cells(&range))
}

/// Per-ledger headline targets, as read from the Headline Results sheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadlineTargets {
    pub area: Option<HeadlineTarget>,
    pub hedgerow: Option<HeadlineTarget>,
    pub watercourse: Option<HeadlineTarget>,
}

impl HeadlineTargets {
    pub fn get(&self, ledger: Ledger) -> Option<HeadlineTarget> {
        match ledger {
            Ledger::Area => self.area,
            Ledger::Hedgerow => self.hedgerow,
            Ledger::Watercourse => self.watercourse,
        }
    }
}
