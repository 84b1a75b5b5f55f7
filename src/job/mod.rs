//! Per-job state machine driving a launch or a retrieval.

mod orchestrator;
mod timer;

pub use orchestrator::{FinishOutcome, JobOrchestrator, Lifecycle, LaunchState, RetrieveState};
pub use timer::{CancelToken, PollTimer, SystemTimer, WaitOutcome};

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    archive::ArchiveError,
    checksum::ChecksumError,
    credentials::AccountCredentials,
    remote_api::{ApiError, JobApi, StatusClass},
    scan::{MassRange, PeakParseError, ScanExporter},
    transfer::{TransferError, Transport},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REMOTE_DIR: &str = "accounts/{account}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Uninitialized,
    /// New job granted; scans are being bundled.
    Launching,
    /// Existing job picked up; results not yet available locally.
    AwaitingRemote,
    Running,
    Done,
    Retrieved,
    /// Polling was interrupted; the next call resumes it.
    Cancelled,
    Error(i32),
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Launching => f.write_str("launching"),
            Self::AwaitingRemote => f.write_str("awaiting remote"),
            Self::Running => f.write_str("running"),
            Self::Done => f.write_str("done"),
            Self::Retrieved => f.write_str("retrieved"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Error(code) => write!(f, "error {code}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Job {job_id} cannot be retrieved: service reports {status}")]
    NotRetrievable { job_id: String, status: StatusClass },
    #[error("Job {job_id} was not started: service answered '{message}'")]
    LaunchRejected { job_id: String, message: String },
    #[error("Job {0} has no selected scans to launch")]
    NoScans(String),
    #[error("Failed to export scan {scan}: {source}")]
    ScanExport { scan: u32, source: io::Error },
    #[error("Scan {scan}: result file {path} failed checksum verification")]
    InvalidChecksum { scan: u32, path: PathBuf },
    #[error("Scan {scan}: {source}")]
    ResultParse { scan: u32, source: PeakParseError },
    #[error("Scan {scan}: {source}")]
    ResultRead { scan: u32, source: ChecksumError },
    #[error("Job {job_id}: polling cancelled")]
    Cancelled { job_id: String },
    #[error("Job {job_id} is {phase}; {action} is not possible")]
    InvalidState {
        job_id: String,
        phase: JobPhase,
        action: &'static str,
    },
    #[error("Scratch directory {path}: {source}")]
    Scratch { path: PathBuf, source: io::Error },
    #[error("Unknown job {0}")]
    UnknownJob(String),
}

impl JobError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Api(err) => err.code(),
            Self::Transfer(err) => err.code(),
            Self::Archive(_) | Self::ScanExport { .. } | Self::Scratch { .. } => -7,
            Self::NotRetrievable { status, .. } => status.code(),
            Self::LaunchRejected { .. } => -9,
            Self::NoScans(_) => -6,
            Self::InvalidChecksum { .. } | Self::ResultParse { .. } | Self::ResultRead { .. } => -11,
            Self::Cancelled { .. } => 0,
            Self::InvalidState { .. } => -10,
            Self::UnknownJob(_) => -4,
        }
    }

    /// Errors that concern one scan; the job carries on.
    pub fn is_scan_scoped(&self) -> bool {
        matches!(
            self,
            Self::InvalidChecksum { .. } | Self::ResultParse { .. } | Self::ResultRead { .. }
        )
    }

    /// Whether the job can be continued by a later call after this error.
    pub fn is_resumable(&self) -> bool {
        self.is_scan_scoped()
            || matches!(
                self,
                Self::Cancelled { .. }
                    | Self::Api(ApiError::Transport(_))
                    | Self::Transfer(TransferError::Connect { .. })
                    | Self::InvalidState { .. }
                    | Self::UnknownJob(_)
            )
    }
}

/// Knobs shared by every job of a service instance.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Parent of the per-job scratch directories.
    pub work_root: PathBuf,
    pub poll_interval: Duration,
    pub transport: Transport,
    /// Host of the file drop.
    pub transfer_host: String,
    /// Remote working directory; `{account}` is replaced by the account id.
    pub remote_dir: String,
}

impl JobSettings {
    pub fn remote_dir_for(&self, account_id: u32) -> String {
        self.remote_dir.replace("{account}", &account_id.to_string())
    }
}

/// Collaborators an orchestrator calls out to.
#[derive(Clone)]
pub struct JobDeps {
    pub api: Arc<dyn JobApi>,
    pub timer: Arc<dyn PollTimer>,
    pub exporter: Arc<dyn ScanExporter>,
    pub settings: JobSettings,
}

/// What `init` needs to create or pick up a job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Name of the data set the scans belong to.
    pub target: String,
    /// Existing job name; `vpi-` names are picked up, anything else launches.
    pub existing: Option<String>,
    pub scan_count: u32,
    pub mass_range: MassRange,
    pub account: AccountCredentials,
}

/// Per-job scratch directory, removed with everything in it on drop.
#[derive(Debug)]
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub(crate) fn create(root: &Path, job_id: &str) -> Result<Self, JobError> {
        let path = root.join(job_id);
        std::fs::create_dir_all(&path).map_err(|source| JobError::Scratch {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove scratch dir");
            }
        }
    }
}
