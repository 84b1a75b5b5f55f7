use std::{
    collections::{BTreeSet, VecDeque},
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Mutex,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use peakjob::{
    checksum::seal_text_file,
    credentials::AccountCredentials,
    remote_api::{ApiError, JobApi, JobGrant, ServiceSelection, StatusLine},
    scan::{MassRange, parse_peak_lines},
};

pub const ACCOUNT_ID: u32 = 42;

/// In-process stand-in for the processing service. It shares a local drop
/// directory with the client and "centroids" each uploaded scan down to its
/// most intense point.
pub struct FakeService {
    drop_root: PathBuf,
    next_id: Mutex<u32>,
    statuses: Mutex<VecDeque<&'static str>>,
    /// Scans the service silently produces no result for.
    skipped: BTreeSet<u32>,
    calls: Mutex<Vec<String>>,
}

impl FakeService {
    pub fn new(drop_root: &Path) -> Self {
        Self {
            drop_root: drop_root.to_path_buf(),
            next_id: Mutex::new(100),
            statuses: Mutex::new(VecDeque::new()),
            skipped: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_statuses(self, statuses: &[&'static str]) -> Self {
        *self.statuses.lock().expect("statuses mutex") = statuses.iter().copied().collect();
        self
    }

    pub fn skipping(mut self, scans: &[u32]) -> Self {
        self.skipped = scans.iter().copied().collect();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex").clone()
    }

    pub fn account_dir(&self) -> PathBuf {
        self.drop_root.join(format!("accounts/{ACCOUNT_ID}"))
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls mutex").push(call);
    }

    fn centroid_upload(&self, job_id: &str) -> usize {
        let upload = self.account_dir().join(format!("{job_id}.scans.tar"));
        let mut archive = tar::Archive::new(File::open(&upload).expect("uploaded archive"));
        let staging = tempfile::tempdir().expect("staging dir");
        let encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let mut results = tar::Builder::new(encoder);
        let mut produced = 0;
        for entry in archive.entries().expect("archive entries") {
            let entry = entry.expect("archive entry");
            let name = entry
                .path()
                .expect("entry path")
                .to_string_lossy()
                .into_owned();
            let stem = name.strip_suffix(".txt.gz").expect("scan entry name");
            let number: u32 = stem[4..8].parse().expect("scan number");
            let mut text = String::new();
            GzDecoder::new(entry)
                .read_to_string(&mut text)
                .expect("gzip scan text");
            if self.skipped.contains(&number) {
                continue;
            }
            let peaks = parse_peak_lines(text.lines()).expect("exported peaks");
            let Some(top) = peaks
                .iter()
                .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
            else {
                continue;
            };
            let result_name = format!("{stem}.vcent.txt");
            let path = staging.path().join(&result_name);
            std::fs::write(&path, format!("# centroided\n{}\t{}\n", top.mass, top.intensity))
                .expect("write result");
            seal_text_file(&path).expect("seal result");
            results
                .append_path_with_name(&path, &result_name)
                .expect("append result");
            produced += 1;
        }
        let bytes = results
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip");
        std::fs::write(self.account_dir().join(format!("{job_id}.vcent.tar")), bytes)
            .expect("write results archive");
        produced
    }
}

impl JobApi for FakeService {
    fn create(
        &self,
        _account: &AccountCredentials,
        scan_count: u32,
        _mass_range: MassRange,
    ) -> Result<JobGrant, ApiError> {
        let mut next = self.next_id.lock().expect("id mutex");
        let job_id = format!("vpi-{}", *next);
        *next += 1;
        self.record(format!("INIT {scan_count}"));
        let line = format!(
            "Info: job created|{job_id}|{ACCOUNT_ID}|xfer|xfer-pw|0|RTO-24=0.25,RTO-8=1.0|1.2.7,1.2.6"
        );
        JobGrant::parse(&StatusLine::parse(&line))
    }

    fn run(
        &self,
        _account: &AccountCredentials,
        job_id: &str,
        scan_count: u32,
        selection: &ServiceSelection,
    ) -> Result<StatusLine, ApiError> {
        self.record(format!("RUN {job_id} {scan_count} {}", selection.qos));
        self.centroid_upload(job_id);
        StatusLine::parse("Running: job started").into_result()
    }

    fn status(&self, _account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError> {
        self.record(format!("STATUS {job_id}"));
        let class = self
            .statuses
            .lock()
            .expect("statuses mutex")
            .pop_front()
            .unwrap_or("Done");
        let line = format!("{class}: progress|{job_id}|{ACCOUNT_ID}|xfer|xfer-pw|3|0");
        StatusLine::parse(&line).into_result()
    }

    fn delete(&self, _account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError> {
        self.record(format!("DELETE {job_id}"));
        StatusLine::parse("Deleted: job removed").into_result()
    }
}
