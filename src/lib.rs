//! Client for remote centroiding jobs: bundle scans, ship them to the
//! processing service, poll, and read back verified results.
/// Application directory helpers.
pub mod app_dirs;
/// Result archives in and out of the file drop.
pub mod archive;
/// Rolling checksums embedded in exchanged text files.
pub mod checksum;
/// TOML configuration.
pub mod config;
/// Account password storage.
pub mod credentials;
pub(crate) mod http_client;
/// Per-job state machine.
pub mod job;
/// Logging setup.
pub mod logging;
/// Live jobs and the pending-job ledger.
pub mod registry;
/// Job-control API client.
pub mod remote_api;
/// Scans, peaks and the export format.
pub mod scan;
/// Pipeline-facing facade.
pub mod service;
/// File drop sessions.
pub mod transfer;

pub use http_client::HttpTimeouts;
