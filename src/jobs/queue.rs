//! Job table, queue, and worker pool.
//!
//! Submission validates, fingerprints, consults the result cache, then
//! either attaches to an in-flight job or enqueues a new one. Workers pull
//! FIFO and run the whole pipeline (metric parse, geography, reference
//! snapshot, allocation) off the request thread. The request thread only
//! ever fingerprints, reads the cache, enqueues, or polls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{fingerprint_inputs, JobInputs, JobRecord, JobState, ResultCache};
use crate::allocation::{AllocationEngine, EngineSettings};
use crate::geography::GeographyResolver;
use crate::metric::parse_metric;
use crate::models::{AllocationReport, DemandLine, Distinctiveness, ErrorKind, JobError, Ledger};
use crate::reference::ReferenceStore;

/// What `submit` hands back to the API layer.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: Uuid,
    pub state: JobState,
    pub fingerprint: String,
    pub cached: bool,
}

pub struct JobService {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    /// fingerprint -> job currently queued or running under it.
    inflight: Mutex<HashMap<String, Uuid>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    draining: AtomicBool,
    cache: Arc<ResultCache>,
    reference: Arc<ReferenceStore>,
    geography: Arc<GeographyResolver>,
    engine_settings: EngineSettings,
    job_timeout: Duration,
}

impl JobService {
    /// Build the service and spawn its worker pool.
    pub fn start(
        cache: Arc<ResultCache>,
        reference: Arc<ReferenceStore>,
        geography: Arc<GeographyResolver>,
        engine_settings: EngineSettings,
        job_timeout: Duration,
        worker_count: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
            cache,
            reference,
            geography,
            engine_settings,
            job_timeout,
        });

        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = worker_count.max(1);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let svc = service.clone();
            let rx = shared_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job_opt = { rx.lock().await.recv().await };
                    let Some(job_id) = job_opt else {
                        break;
                    };
                    svc.process_job(job_id).await;
                }
                info!(worker = i, "job worker drained and stopped");
            }));
        }
        *service.workers.lock() = handles;

        info!("⚙️  Job queue started with {} workers", workers);
        service
    }

    /// Validate, fingerprint, and either serve from cache, attach to an
    /// in-flight job, or enqueue.
    pub fn submit(&self, inputs: JobInputs) -> Result<SubmitOutcome, JobError> {
        inputs.validate()?;

        if self.draining.load(Ordering::SeqCst) {
            return Err(JobError::new(
                ErrorKind::Internal,
                "service is shutting down and not accepting new work",
            ));
        }

        let fingerprint = fingerprint_inputs(&inputs);

        if let Some(result) = self.cache.get(&fingerprint) {
            let record = JobRecord::completed_from_cache(fingerprint.clone(), result);
            let outcome = SubmitOutcome {
                job_id: record.job_id,
                state: record.state,
                fingerprint,
                cached: true,
            };
            self.jobs.write().insert(record.job_id, record);
            return Ok(outcome);
        }

        // Identical work already queued or running: attach, don't duplicate.
        // (The inflight guard is released before touching the job table;
        // finish_job takes the two locks in the opposite order.)
        let existing = { self.inflight.lock().get(&fingerprint).copied() };
        if let Some(job_id) = existing {
            if let Some(record) = self.jobs.read().get(&job_id) {
                if !record.state.is_terminal() {
                    return Ok(SubmitOutcome {
                        job_id,
                        state: record.state,
                        fingerprint,
                        cached: false,
                    });
                }
            }
        }

        let record = JobRecord::queued(fingerprint.clone(), inputs);
        let job_id = record.job_id;
        self.jobs.write().insert(job_id, record);
        self.inflight.lock().insert(fingerprint.clone(), job_id);

        let sent = {
            let tx = self.tx.lock();
            tx.as_ref()
                .map(|tx| tx.send(job_id).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            self.finish_job(job_id, Err(JobError::internal()));
            return Err(JobError::new(
                ErrorKind::Internal,
                "job queue unavailable",
            ));
        }

        Ok(SubmitOutcome {
            job_id,
            state: JobState::Queued,
            fingerprint,
            cached: false,
        })
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// Cancel a queued job. Running jobs run to completion.
    pub fn cancel(&self, job_id: Uuid) -> Option<bool> {
        let mut jobs = self.jobs.write();
        let record = jobs.get_mut(&job_id)?;
        if record.state != JobState::Queued {
            return Some(false);
        }
        record.state = JobState::Cancelled;
        record.completed_at = Some(Utc::now());
        self.inflight.lock().remove(&record.fingerprint);
        Some(true)
    }

    /// Refuse new work and let workers drain the queue.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        // Dropping the sender closes the channel once buffered jobs are
        // consumed.
        self.tx.lock().take();
        info!("🛑 Job queue draining: no new work accepted");
    }

    /// Drain and wait for every worker to exit.
    pub async fn shutdown(&self) {
        self.begin_drain();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("✅ Job workers stopped");
    }

    async fn process_job(&self, job_id: Uuid) {
        let inputs = {
            let mut jobs = self.jobs.write();
            let Some(record) = jobs.get_mut(&job_id) else {
                return;
            };
            if record.state != JobState::Queued {
                // Cancelled while queued.
                return;
            }
            record.state = JobState::Running;
            record.inputs.clone()
        };

        let outcome = match tokio::time::timeout(self.job_timeout, self.run_pipeline(inputs)).await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::new(
                ErrorKind::Timeout,
                format!("job exceeded the {}s wall-clock limit", self.job_timeout.as_secs()),
            )),
        };

        self.finish_job(job_id, outcome);
    }

    fn finish_job(&self, job_id: Uuid, outcome: Result<AllocationReport, JobError>) {
        let mut jobs = self.jobs.write();
        let Some(record) = jobs.get_mut(&job_id) else {
            return;
        };
        record.completed_at = Some(Utc::now());
        self.inflight.lock().remove(&record.fingerprint);

        match outcome {
            Ok(report) => {
                // A run that allocated nothing against live demand is a total
                // infeasibility and fails the job; partial coverage stays done.
                let had_demand = !report.shortfalls.is_empty() || !report.allocations.is_empty();
                if report.allocations.is_empty() && had_demand {
                    record.state = JobState::Failed;
                    record.error = Some(JobError::new(
                        ErrorKind::Infeasible,
                        "no demand line could be allocated from the reachable banks",
                    ));
                    warn!(job_id = %job_id, "job failed: nothing allocatable");
                    return;
                }
                self.cache.put(&record.fingerprint, &report);
                record.state = JobState::Done;
                record.result = Some(report);
                info!(job_id = %job_id, "job completed");
            }
            Err(e) => {
                record.state = JobState::Failed;
                match e.kind {
                    // Internal detail stays in the log; the caller gets a
                    // generic message.
                    ErrorKind::Internal => {
                        error!(job_id = %job_id, error = %e, "job failed internally");
                        record.error = Some(JobError::internal());
                    }
                    _ => {
                        warn!(job_id = %job_id, error = %e, "job failed");
                        record.error = Some(e);
                    }
                }
            }
        }
    }

    /// The full per-job pipeline, strictly sequential: metric parse,
    /// geography, reference snapshot, allocation.
    async fn run_pipeline(&self, inputs: JobInputs) -> Result<AllocationReport, JobError> {
        let mut warnings: Vec<String> = Vec::new();
        let mut demand: Vec<DemandLine> = Vec::new();

        if let Some(bytes) = inputs.metric_file.clone() {
            let parsed = tokio::task::spawn_blocking(move || parse_metric(&bytes))
                .await
                .map_err(|_| JobError::internal())??;
            warnings.extend(parsed.warnings);
            demand.extend(parsed.demand);
        }

        let (site, geo_warnings) = self.geography.resolve(&inputs.site).await?;
        warnings.extend(geo_warnings);

        let store = self.reference.clone();
        let reference = tokio::task::spawn_blocking(move || store.snapshot())
            .await
            .map_err(|_| JobError::internal())??;

        for spec in &inputs.demand {
            let catalog = reference.habitat_idx(&spec.habitat).map(|i| reference.habitat(i));
            let ledger = spec
                .ledger
                .or_else(|| catalog.map(|h| h.ledger))
                .unwrap_or(Ledger::Area);
            let distinctiveness = match catalog.map(|h| h.distinctiveness).or(spec.distinctiveness)
            {
                Some(d) => d,
                None => {
                    warnings.push(format!(
                        "habitat '{}' not in catalog; assumed Medium distinctiveness",
                        spec.habitat
                    ));
                    Distinctiveness::Medium
                }
            };
            demand.push(DemandLine {
                ledger,
                habitat_name: spec.habitat.clone(),
                units_required: spec.units,
                distinctiveness,
                broader_type: catalog
                    .map(|h| h.broader_type.clone())
                    .or_else(|| spec.broader_type.clone()),
            });
        }

        let settings = self.engine_settings;
        let mut report = tokio::task::spawn_blocking(move || {
            AllocationEngine::new(&reference, &site, settings).run(&demand)
        })
        .await
        .map_err(|_| JobError::internal())?;

        warnings.append(&mut report.warnings);
        report.warnings = warnings;
        Ok(report)
    }
}
