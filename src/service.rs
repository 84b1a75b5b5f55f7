//! Facade the scan pipeline talks to: start, feed, finish and list jobs.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;

use crate::{
    config::{AppConfig, ConfigError},
    credentials::AccountCredentials,
    job::{FinishOutcome, JobDeps, JobError, JobOrchestrator, JobRequest, JobSettings, PollTimer, SystemTimer},
    registry::{JobLedger, JobRegistry, PendingJob, RegistryError},
    remote_api::{ApiError, HttpJobApi, JobApi, PickupRef},
    scan::{MassRange, Peak, Scan, ScanExporter, TextScanExporter},
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ServiceError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Job(err) => err.code(),
            Self::Api(err) => err.code(),
            // Ledger and config trouble are local write failures.
            Self::Registry(_) | Self::Config(_) => -8,
        }
    }
}

/// Scans covered by a pending job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSpan {
    Range { first: u32, last: u32 },
    Count(u32),
}

impl fmt::Display for ScanSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { first, last } => write!(f, "scans {first}..{last}"),
            Self::Count(count) => write!(f, "{count} scans"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJobSummary {
    pub job_id: String,
    pub target: String,
    /// Live phase when the job is open in this process, else the ledger status.
    pub status: String,
    pub scans: ScanSpan,
    /// Name that picks the job up again.
    pub pickup_name: String,
}

impl From<&PendingJob> for PendingJobSummary {
    fn from(job: &PendingJob) -> Self {
        let scans = match (job.first_scan, job.last_scan) {
            (Some(first), Some(last)) => ScanSpan::Range { first, last },
            _ => ScanSpan::Count(job.scan_count),
        };
        Self {
            job_id: job.job_id.clone(),
            target: job.target.clone(),
            status: job.status.clone(),
            scans,
            pickup_name: job.pickup_name(),
        }
    }
}

/// Runs any number of jobs side by side; each job is driven by one caller
/// at a time.
pub struct CentroidService {
    deps: JobDeps,
    registry: JobRegistry,
    ledger: JobLedger,
}

impl CentroidService {
    pub fn new(api: Arc<dyn JobApi>, settings: JobSettings, ledger: JobLedger) -> Self {
        Self {
            deps: JobDeps {
                api,
                timer: Arc::new(SystemTimer),
                exporter: Arc::new(TextScanExporter::default()),
                settings,
            },
            registry: JobRegistry::new(),
            ledger,
        }
    }

    /// HTTP API, configured transport and the default ledger.
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let api = HttpJobApi::new(&config.api_settings())?;
        Ok(Self::new(
            Arc::new(api),
            config.job_settings()?,
            JobLedger::open_default()?,
        ))
    }

    pub fn with_timer(mut self, timer: Arc<dyn PollTimer>) -> Self {
        self.deps.timer = timer;
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn ScanExporter>) -> Self {
        self.deps.exporter = exporter;
        self
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    /// Launch a job sized for `scans`, or pick up `existing`. Returns the
    /// job id every later call is keyed by.
    pub fn start_job(
        &self,
        scans: &[Scan],
        target: &str,
        existing: Option<&str>,
        account: AccountCredentials,
    ) -> Result<String, ServiceError> {
        // Checked up front: a second orchestrator would share the scratch dir.
        if let Some(pickup) = existing.and_then(PickupRef::parse) {
            if self.registry.lookup(&pickup.job_id).is_some() {
                return Err(RegistryError::Duplicate(pickup.job_id).into());
            }
        }
        let scan_count = u32::try_from(scans.len()).unwrap_or(u32::MAX);
        let mass_range = scans
            .iter()
            .filter_map(Scan::mass_range)
            .reduce(MassRange::union)
            .unwrap_or(MassRange { min: 0.0, max: 0.0 });
        let request = JobRequest {
            target: target.to_string(),
            existing: existing.map(str::to_string),
            scan_count,
            mass_range,
            account,
        };
        let job = JobOrchestrator::init(request, self.deps.clone())?;
        let job_id = job.job_id().to_string();
        self.registry.register(job)?;
        Ok(job_id)
    }

    pub fn process_scan(
        &self,
        job_id: &str,
        scan: &Scan,
        selected: bool,
    ) -> Result<Option<Vec<Peak>>, ServiceError> {
        let handle = self.handle(job_id)?;
        let mut job = lock_job(&handle);
        Ok(job.process_scan(scan, selected)?)
    }

    /// Finish the job and update the ledger: launches are remembered,
    /// retrievals forgotten. The job stays open after a resumable error.
    pub fn finish_job(&self, job_id: &str) -> Result<(), ServiceError> {
        let handle = self.handle(job_id)?;
        let result = lock_job(&handle).finish();
        match result {
            Ok(outcome) => {
                self.registry.unregister(job_id);
                match outcome {
                    FinishOutcome::Launched(pending) => self.ledger.record(pending)?,
                    FinishOutcome::Retrieved => {
                        self.ledger.forget(job_id)?;
                    }
                }
                Ok(())
            }
            Err(err) => {
                if !err.is_resumable() {
                    self.registry.unregister(job_id);
                }
                Err(err.into())
            }
        }
    }

    /// Interrupt a status poll in progress for `job_id`.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.registry.cancel(job_id)
    }

    /// Drop an open job without finishing it; its scratch files go with it.
    pub fn abandon_job(&self, job_id: &str) -> bool {
        self.registry.unregister(job_id).is_some()
    }

    pub fn open_jobs(&self) -> Vec<String> {
        self.registry.job_ids()
    }

    /// Launched jobs still awaiting retrieval, oldest first.
    pub fn list_pending_jobs(&self) -> Vec<PendingJobSummary> {
        let pending = match self.ledger.pending() {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read pending jobs");
                return Vec::new();
            }
        };
        pending
            .iter()
            .map(|job| {
                let mut summary = PendingJobSummary::from(job);
                if let Some(handle) = self.registry.lookup(&job.job_id) {
                    // A job busy polling keeps its ledger status.
                    if let Ok(live) = handle.try_lock() {
                        summary.status = live.phase().to_string();
                    }
                }
                summary
            })
            .collect()
    }

    fn handle(&self, job_id: &str) -> Result<Arc<Mutex<JobOrchestrator>>, ServiceError> {
        self.registry
            .lookup(job_id)
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()).into())
    }
}

fn lock_job(handle: &Mutex<JobOrchestrator>) -> MutexGuard<'_, JobOrchestrator> {
    handle.lock().expect("job mutex poisoned")
}
