//! `JobApi` over HTTPS: POST with every parameter in the query string.

use url::Url;

use crate::{
    credentials::AccountCredentials,
    http_client::{self, HttpTimeouts},
    scan::MassRange,
};

use super::{ApiError, DEFAULT_HOST, JobApi, JobGrant, PROTOCOL_VERSION, ServiceSelection, StatusLine};

const MAX_RESPONSE_BYTES: usize = 64 * 1024;
const USER_AGENT: &str = concat!("peakjob/", env!("CARGO_PKG_VERSION"));

/// Where and how to reach the job-control endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub scheme: String,
    /// Host, optionally with `:port`.
    pub host: String,
    pub path: String,
    pub protocol_version: String,
    pub timeouts: HttpTimeouts,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            scheme: "https".into(),
            host: DEFAULT_HOST.into(),
            path: "/api".into(),
            protocol_version: PROTOCOL_VERSION.into(),
            timeouts: HttpTimeouts::default(),
        }
    }
}

impl ApiSettings {
    pub fn endpoint(&self) -> Result<Url, ApiError> {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        Url::parse(&format!("{}://{}{}", self.scheme, self.host, path))
            .map_err(|err| ApiError::Transport(format!("Invalid service URL: {err}")))
    }
}

pub struct HttpJobApi {
    endpoint: Url,
    protocol_version: String,
    agent: ureq::Agent,
}

impl HttpJobApi {
    pub fn new(settings: &ApiSettings) -> Result<Self, ApiError> {
        Ok(Self {
            endpoint: settings.endpoint()?,
            protocol_version: settings.protocol_version.clone(),
            agent: http_client::build_agent(settings.timeouts),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_url(&self, account: &AccountCredentials, action: &str, extra: &[(&str, String)]) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("Version", &self.protocol_version)
                .append_pair("User", &account.username)
                .append_pair("Code", &account.password)
                .append_pair("Action", action);
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        url
    }

    fn call(
        &self,
        account: &AccountCredentials,
        action: &str,
        extra: &[(&str, String)],
    ) -> Result<StatusLine, ApiError> {
        let url = self.request_url(account, action, extra);
        tracing::debug!(url = %redacted(&url), "service request");
        let response = match self.agent.post(url.as_str()).set("User-Agent", USER_AGENT).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(ApiError::Transport(format!("HTTP {code}")));
            }
            Err(ureq::Error::Transport(err)) => {
                tracing::warn!(action, error = %err, "service unreachable");
                return Err(ApiError::Transport(err.to_string()));
            }
        };
        let bytes = http_client::read_response_bytes(response, MAX_RESPONSE_BYTES)
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let body = String::from_utf8_lossy(&bytes);
        for extra_line in body.lines().skip(1) {
            tracing::trace!(line = extra_line, "ignored response line");
        }
        let line = StatusLine::parse(&body);
        tracing::debug!(action, code = line.code(), line = line.raw(), "service response");
        line.into_result()
    }
}

impl JobApi for HttpJobApi {
    fn create(
        &self,
        account: &AccountCredentials,
        scan_count: u32,
        mass_range: MassRange,
    ) -> Result<JobGrant, ApiError> {
        let line = self.call(
            account,
            "INIT",
            &[
                ("Account", account.account_id.to_string()),
                ("Command", "ckm".to_string()),
                ("Count", scan_count.to_string()),
                ("MinMass", mass_range.min.to_string()),
                ("MaxMass", mass_range.max.to_string()),
            ],
        )?;
        JobGrant::parse(&line)
    }

    fn run(
        &self,
        account: &AccountCredentials,
        job_id: &str,
        scan_count: u32,
        selection: &ServiceSelection,
    ) -> Result<StatusLine, ApiError> {
        self.call(
            account,
            "RUN",
            &[
                ("Job", job_id.to_string()),
                ("Count", scan_count.to_string()),
                ("ArchiveType", "tar".to_string()),
                ("CalibrationScans", "0".to_string()),
                ("QoS", selection.qos.clone()),
                ("PIVersion", selection.version.clone()),
            ],
        )
    }

    fn status(&self, account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError> {
        self.call(account, "STATUS", &[("Job", job_id.to_string())])
    }

    fn delete(&self, account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError> {
        self.call(account, "DELETE", &[("Job", job_id.to_string())])
    }
}

fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == "Code" { "***".to_string() } else { value.into_owned() };
            (key.into_owned(), value)
        })
        .collect();
    clean.query_pairs_mut().clear().extend_pairs(pairs);
    clean.to_string()
}
