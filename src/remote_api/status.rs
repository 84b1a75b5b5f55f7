//! Typed parsers for the line-oriented job-control responses.
//!
//! Only the first line of a response is significant. Its leading token picks
//! the result class; success lines carry pipe-delimited payload fields.

use std::{fmt, sync::LazyLock};

use regex::Regex;

use super::ApiError;

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Error-(\d+):\s*(.*)$").expect("error line pattern is valid"));

static PICKUP_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(vpi-[^\s\[\]|]+)\s*(?:\[(\d+)\.\.(\d+)\])?$").expect("pickup pattern is valid")
});

/// Result class of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Info,
    Running,
    Done,
    Deleted,
    /// `Error-N:` reported by the service, stored as `-N`.
    Error(i32),
    /// Anything the grammar does not recognize.
    ProtocolException,
}

impl StatusClass {
    pub const EXCEPTION_CODE: i32 = -99;

    pub fn code(self) -> i32 {
        match self {
            Self::Info => 1,
            Self::Running => 2,
            Self::Done => 3,
            Self::Deleted => 4,
            Self::Error(code) => code,
            Self::ProtocolException => Self::EXCEPTION_CODE,
        }
    }

    pub fn is_success(self) -> bool {
        self.code() > 0
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("Info"),
            Self::Running => f.write_str("Running"),
            Self::Done => f.write_str("Done"),
            Self::Deleted => f.write_str("Deleted"),
            Self::Error(code) => write!(f, "Error{code}"),
            Self::ProtocolException => f.write_str("Exception"),
        }
    }
}

/// First line of a response, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub class: StatusClass,
    /// Text after the class token.
    pub message: String,
    raw: String,
}

impl StatusLine {
    /// Classify the first line of `body`. Never fails; unknown input becomes
    /// a [`StatusClass::ProtocolException`].
    pub fn parse(body: &str) -> Self {
        let raw = body
            .lines()
            .next()
            .unwrap_or_default()
            .trim_end_matches('\r')
            .to_string();
        for (token, class) in [
            ("Info:", StatusClass::Info),
            ("Running:", StatusClass::Running),
            ("Done:", StatusClass::Done),
            ("Deleted:", StatusClass::Deleted),
        ] {
            if let Some(rest) = raw.strip_prefix(token) {
                return Self {
                    class,
                    message: rest.trim().to_string(),
                    raw,
                };
            }
        }
        if let Some(captures) = ERROR_LINE.captures(&raw) {
            if let Some(code) = captures.get(1).and_then(|m| m.as_str().parse::<i32>().ok()) {
                let message = captures.get(2).map_or("", |m| m.as_str()).trim().to_string();
                return Self {
                    class: StatusClass::Error(-code),
                    message,
                    raw,
                };
            }
        }
        Self {
            class: StatusClass::ProtocolException,
            message: raw.clone(),
            raw,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn code(&self) -> i32 {
        self.class.code()
    }

    fn fields(&self) -> Vec<&str> {
        self.raw.split('|').map(str::trim).collect()
    }

    /// Turn error and exception lines into the matching [`ApiError`].
    pub fn into_result(self) -> Result<Self, ApiError> {
        match self.class {
            StatusClass::Error(code) => Err(ApiError::Remote {
                code,
                message: self.message,
            }),
            StatusClass::ProtocolException => Err(ApiError::Protocol(self.raw)),
            _ => Ok(self),
        }
    }
}

/// QoS tier and processing version used for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSelection {
    pub qos: String,
    pub version: String,
}

/// Payload of a successful new-job `INIT`:
/// `prefix|job|account|user|password|reserved|qos=price,...|version,...`.
#[derive(Clone, PartialEq, Eq)]
pub struct JobGrant {
    pub job_id: String,
    pub account_id: u32,
    pub transfer_user: String,
    pub transfer_password: String,
    /// First offered QoS tier and processing version.
    pub selection: ServiceSelection,
}

impl fmt::Debug for JobGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobGrant")
            .field("job_id", &self.job_id)
            .field("account_id", &self.account_id)
            .field("transfer_user", &self.transfer_user)
            .field("transfer_password", &"<redacted>")
            .field("selection", &self.selection)
            .finish()
    }
}

impl JobGrant {
    pub fn parse(line: &StatusLine) -> Result<Self, ApiError> {
        let malformed = || ApiError::Malformed {
            what: "INIT",
            line: line.raw.clone(),
        };
        if line.class != StatusClass::Info {
            return Err(ApiError::unexpected("Info", line));
        }
        let fields = line.fields();
        if fields.len() < 8 {
            return Err(malformed());
        }
        let job_id = non_empty(fields[1]).ok_or_else(malformed)?;
        let account_id = fields[2].parse::<u32>().map_err(|_| malformed())?;
        let qos = fields[6]
            .split(',')
            .next()
            .and_then(|item| item.split_once('=').map(|(name, _)| name.trim()))
            .and_then(non_empty)
            .ok_or_else(malformed)?;
        let version = fields[7]
            .split(',')
            .next()
            .map(str::trim)
            .and_then(non_empty)
            .ok_or_else(malformed)?;
        Ok(Self {
            job_id,
            account_id,
            transfer_user: fields[3].to_string(),
            transfer_password: fields[4].to_string(),
            selection: ServiceSelection { qos, version },
        })
    }
}

/// Payload of a `STATUS` line for an existing job:
/// `prefix|job|account|user|password|scans_in|scans_done|cost|result_file`.
#[derive(Clone, PartialEq)]
pub struct JobProgress {
    pub class: StatusClass,
    pub job_id: String,
    pub account_id: u32,
    pub transfer_user: String,
    pub transfer_password: String,
    pub scans_in: u32,
    pub scans_done: u32,
    pub cost: Option<f64>,
    pub result_file: Option<String>,
}

impl fmt::Debug for JobProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProgress")
            .field("class", &self.class)
            .field("job_id", &self.job_id)
            .field("account_id", &self.account_id)
            .field("transfer_user", &self.transfer_user)
            .field("transfer_password", &"<redacted>")
            .field("scans_in", &self.scans_in)
            .field("scans_done", &self.scans_done)
            .field("cost", &self.cost)
            .field("result_file", &self.result_file)
            .finish()
    }
}

impl JobProgress {
    /// Parse a Running or Done line. Counters and the trailing fields are
    /// optional; the service omits them while a job is still queued.
    pub fn parse(line: &StatusLine) -> Result<Self, ApiError> {
        let malformed = || ApiError::Malformed {
            what: "STATUS",
            line: line.raw.clone(),
        };
        if !matches!(line.class, StatusClass::Running | StatusClass::Done) {
            return Err(ApiError::unexpected("Running or Done", line));
        }
        let fields = line.fields();
        if fields.len() < 5 {
            return Err(malformed());
        }
        let count = |index: usize| -> Result<u32, ApiError> {
            match fields.get(index).copied().and_then(non_empty) {
                Some(value) => value.parse().map_err(|_| malformed()),
                None => Ok(0),
            }
        };
        Ok(Self {
            class: line.class,
            job_id: non_empty(fields[1]).ok_or_else(malformed)?,
            account_id: fields[2].parse().map_err(|_| malformed())?,
            transfer_user: fields[3].to_string(),
            transfer_password: fields[4].to_string(),
            scans_in: count(5)?,
            scans_done: count(6)?,
            cost: fields.get(7).and_then(|value| value.parse().ok()),
            result_file: fields.get(8).copied().and_then(non_empty),
        })
    }
}

/// Reference to a previously launched job, as typed by a user or stored in
/// a target name: `vpi-<id>` with an optional `[first..last]` scan label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickupRef {
    pub job_id: String,
    pub scans: Option<(u32, u32)>,
}

impl PickupRef {
    /// `None` for names that do not follow the job naming convention.
    pub fn parse(name: &str) -> Option<Self> {
        let captures = PICKUP_NAME.captures(name.trim())?;
        let job_id = captures.get(1)?.as_str().to_string();
        let scans = match (captures.get(2), captures.get(3)) {
            (Some(first), Some(last)) => Some((first.as_str().parse().ok()?, last.as_str().parse().ok()?)),
            _ => None,
        };
        Some(Self { job_id, scans })
    }

    pub fn label(&self) -> String {
        match self.scans {
            Some((first, last)) => format!("{}[{first}..{last}]", self.job_id),
            None => self.job_id.clone(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
