//! Job submission, caching, and the worker pipeline.

mod cache;
mod fingerprint;
mod queue;

pub use cache::{spawn_cache_pruner, ResultCache};
pub use fingerprint::fingerprint_inputs;
pub use queue::{JobService, SubmitOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geography::SiteInput;
use crate::models::{AllocationReport, Distinctiveness, ErrorKind, JobError, Ledger};

/// One requested demand line as submitted over the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandSpec {
    pub habitat: String,
    pub units: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<Ledger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinctiveness: Option<Distinctiveness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broader_type: Option<String>,
}

/// Submission options. `paired_pricing` exists to detect callers expecting
/// the legacy sum-over-SRM pairing formula, which this engine refuses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_pricing: Option<String>,
}

/// Full canonical inputs of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInputs {
    #[serde(default)]
    pub demand: Vec<DemandSpec>,
    #[serde(default)]
    pub site: SiteInput,
    /// Raw metric workbook bytes, when the caller uploads one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_file: Option<Vec<u8>>,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobInputs {
    /// Submission-time validation; everything here fails fast, before any
    /// work is enqueued.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.demand.is_empty() && self.metric_file.is_none() {
            return Err(JobError::new(
                ErrorKind::InputInvalid,
                "submission needs demand lines or a metric file",
            ));
        }
        for line in &self.demand {
            if line.habitat.trim().is_empty() {
                return Err(JobError::new(
                    ErrorKind::InputInvalid,
                    "demand line with empty habitat name",
                ));
            }
            if !(line.units > 0.0) || !line.units.is_finite() {
                return Err(JobError::new(
                    ErrorKind::InputInvalid,
                    format!("demand for '{}' must have positive units", line.habitat),
                ));
            }
        }
        if let Some(bytes) = &self.metric_file {
            if bytes.is_empty() {
                return Err(JobError::new(
                    ErrorKind::InputInvalid,
                    "metric file is empty",
                ));
            }
        }
        if self.site.is_empty() {
            return Err(JobError::new(
                ErrorKind::GeographyUnresolved,
                "site needs a postcode, an address, or explicit lpa/nca names",
            ));
        }
        if let Some(formula) = &self.options.paired_pricing {
            if formula != "weighted_blend" {
                return Err(JobError::new(
                    ErrorKind::InputInvalid,
                    format!(
                        "paired pricing formula '{formula}' is not supported; \
                         this engine prices pairs as the weighted blend"
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

/// Lifecycle record of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub fingerprint: String,
    pub state: JobState,
    #[serde(skip)]
    pub inputs: JobInputs,
    pub result: Option<AllocationReport>,
    pub error: Option<JobError>,
    pub enqueued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn queued(fingerprint: String, inputs: JobInputs) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            fingerprint,
            state: JobState::Queued,
            inputs,
            result: None,
            error: None,
            enqueued_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Synthetic record for a cache hit: born terminal.
    pub fn completed_from_cache(fingerprint: String, result: AllocationReport) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            fingerprint,
            state: JobState::Done,
            inputs: JobInputs::default(),
            result: Some(result),
            error: None,
            enqueued_at: now,
            completed_at: Some(now),
        }
    }
}
