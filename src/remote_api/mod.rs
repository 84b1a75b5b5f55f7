//! Client for the processing service's job-control endpoint.
//!
//! Every call returns its own immutable result; nothing is cached between
//! calls, so one client can serve many jobs at once.

mod http;
mod status;

pub use http::{ApiSettings, HttpJobApi};
pub use status::{JobGrant, JobProgress, PickupRef, ServiceSelection, StatusClass, StatusLine};

use crate::{credentials::AccountCredentials, scan::MassRange};

/// Protocol revision sent as `Version` on every request.
pub const PROTOCOL_VERSION: &str = "2.00";
/// Service host used when the config does not name one.
pub const DEFAULT_HOST: &str = "secure.veritomyx.com";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unable to reach the service: {0}")]
    Transport(String),
    #[error("Service error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("Unrecognized service response: {0}")]
    Protocol(String),
    #[error("Malformed {what} response: {line}")]
    Malformed { what: &'static str, line: String },
    #[error("Expected {expected}, service answered '{}'", .line.raw())]
    Unexpected {
        expected: &'static str,
        line: StatusLine,
    },
}

impl ApiError {
    /// Numeric code matching the service's result classes.
    pub fn code(&self) -> i32 {
        match self {
            Self::Remote { code, .. } => *code,
            Self::Unexpected { line, .. } => line.code(),
            Self::Transport(_) | Self::Protocol(_) | Self::Malformed { .. } => {
                StatusClass::EXCEPTION_CODE
            }
        }
    }

    pub(crate) fn unexpected(expected: &'static str, line: &StatusLine) -> Self {
        Self::Unexpected {
            expected,
            line: line.clone(),
        }
    }
}

/// Result of `init`: a freshly granted job or the status of an existing one.
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    Launched(JobGrant),
    Existing(JobProgress),
}

/// The four job-control actions.
///
/// `run`, `status` and `delete` return the success line; `Error-N` lines
/// and unrecognized responses come back as `Err`.
pub trait JobApi: Send + Sync {
    /// `INIT` for a new job of `scan_count` scans.
    fn create(
        &self,
        account: &AccountCredentials,
        scan_count: u32,
        mass_range: MassRange,
    ) -> Result<JobGrant, ApiError>;

    fn run(
        &self,
        account: &AccountCredentials,
        job_id: &str,
        scan_count: u32,
        selection: &ServiceSelection,
    ) -> Result<StatusLine, ApiError>;

    fn status(&self, account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError>;

    fn delete(&self, account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError>;

    /// Launch a new job, or look up `existing` when it names a job.
    fn init(
        &self,
        account: &AccountCredentials,
        existing: Option<&PickupRef>,
        scan_count: u32,
        mass_range: MassRange,
    ) -> Result<InitOutcome, ApiError> {
        match existing {
            None => self
                .create(account, scan_count, mass_range)
                .map(InitOutcome::Launched),
            Some(pickup) => {
                let line = self.status(account, &pickup.job_id)?;
                JobProgress::parse(&line).map(InitOutcome::Existing)
            }
        }
    }
}
