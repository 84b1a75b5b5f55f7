//! Live job table plus the on-disk ledger of launched jobs awaiting pickup.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    app_dirs::{AppDirError, app_root_dir},
    job::{CancelToken, JobOrchestrator},
};

/// File name of the pending-job ledger inside the app directory.
pub const LEDGER_FILE_NAME: &str = "jobs.json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job {0} is already registered")]
    Duplicate(String),
    #[error("Job ledger {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Job ledger {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    AppDir(#[from] AppDirError),
}

/// A launched job remembered until its results are retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub job_id: String,
    /// Data set the scans came from.
    pub target: String,
    #[serde(default)]
    pub first_scan: Option<u32>,
    #[serde(default)]
    pub last_scan: Option<u32>,
    pub scan_count: u32,
    pub status: String,
    /// Unix seconds.
    pub launched_at: i64,
}

impl PendingJob {
    pub fn new(job_id: &str, target: &str, scans: Option<(u32, u32)>, scan_count: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            target: target.to_string(),
            first_scan: scans.map(|(first, _)| first),
            last_scan: scans.map(|(_, last)| last),
            scan_count,
            status: "running".into(),
            launched_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// Name to hand back to `init` to pick this job up, e.g. `vpi-7[1..40]`.
    pub fn pickup_name(&self) -> String {
        match (self.first_scan, self.last_scan) {
            (Some(first), Some(last)) => format!("{}[{first}..{last}]", self.job_id),
            _ => self.job_id.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    jobs: Vec<PendingJob>,
}

/// JSON ledger of pending jobs, rewritten atomically on every change.
#[derive(Debug, Clone)]
pub struct JobLedger {
    path: PathBuf,
}

impl JobLedger {
    /// Ledger at `<app dir>/jobs.json`.
    pub fn open_default() -> Result<Self, RegistryError> {
        Ok(Self::at(app_root_dir()?.join(LEDGER_FILE_NAME)))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pending jobs in launch order. A missing ledger is empty.
    pub fn pending(&self) -> Result<Vec<PendingJob>, RegistryError> {
        Ok(self.load()?.jobs)
    }

    /// Add `job`, replacing an older entry with the same id.
    pub fn record(&self, job: PendingJob) -> Result<(), RegistryError> {
        let mut ledger = self.load()?;
        ledger.jobs.retain(|entry| entry.job_id != job.job_id);
        tracing::info!(job = %job.job_id, target = %job.target, "job recorded as pending");
        ledger.jobs.push(job);
        self.save(&ledger)
    }

    /// Drop `job_id`; returns whether it was present.
    pub fn forget(&self, job_id: &str) -> Result<bool, RegistryError> {
        let mut ledger = self.load()?;
        let before = ledger.jobs.len();
        ledger.jobs.retain(|entry| entry.job_id != job_id);
        if ledger.jobs.len() == before {
            return Ok(false);
        }
        self.save(&ledger)?;
        tracing::info!(job = job_id, "job removed from pending ledger");
        Ok(true)
    }

    fn load(&self) -> Result<LedgerFile, RegistryError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerFile::default());
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, ledger: &LedgerFile) -> Result<(), RegistryError> {
        let data = serde_json::to_vec_pretty(ledger).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })?;
        atomic_write(&self.path, &data).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Write `data` to a sibling temp file, sync it, then move it over `path`.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

struct Entry {
    job: Arc<Mutex<JobOrchestrator>>,
    cancel: CancelToken,
}

/// In-process table of live orchestrators keyed by job id.
///
/// Each job sits behind its own mutex, so scans of one job run in order
/// while distinct jobs proceed in parallel.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: JobOrchestrator) -> Result<Arc<Mutex<JobOrchestrator>>, RegistryError> {
        let job_id = job.job_id().to_string();
        let cancel = job.cancel_token();
        let mut jobs = self.jobs.lock().expect("job registry mutex poisoned");
        if jobs.contains_key(&job_id) {
            return Err(RegistryError::Duplicate(job_id));
        }
        let handle = Arc::new(Mutex::new(job));
        jobs.insert(
            job_id.clone(),
            Entry {
                job: Arc::clone(&handle),
                cancel,
            },
        );
        tracing::debug!(job = %job_id, "job registered");
        Ok(handle)
    }

    pub fn lookup(&self, job_id: &str) -> Option<Arc<Mutex<JobOrchestrator>>> {
        self.jobs
            .lock()
            .expect("job registry mutex poisoned")
            .get(job_id)
            .map(|entry| Arc::clone(&entry.job))
    }

    pub fn unregister(&self, job_id: &str) -> Option<Arc<Mutex<JobOrchestrator>>> {
        let removed = self
            .jobs
            .lock()
            .expect("job registry mutex poisoned")
            .remove(job_id)
            .map(|entry| entry.job);
        if removed.is_some() {
            tracing::debug!(job = job_id, "job unregistered");
        }
        removed
    }

    /// Interrupt a pending poll of `job_id` without taking the job's lock.
    pub fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().expect("job registry mutex poisoned");
        match jobs.get(job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .lock()
            .expect("job registry mutex poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
