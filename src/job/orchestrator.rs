use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    archive::{ScanArchive, unpack_results},
    checksum::{ChecksumError, ChecksummedFile, Verification},
    credentials::AccountCredentials,
    registry::PendingJob,
    remote_api::{ApiError, InitOutcome, PickupRef, ServiceSelection, StatusClass},
    scan::{Peak, Scan, parse_peak_lines},
    transfer::{TransferCredentials, TransferSession},
};

use super::{CancelToken, JobDeps, JobError, JobPhase, JobRequest, ScratchDir, WaitOutcome};

/// Bundling state of a new job.
pub struct LaunchState {
    archive: Option<ScanArchive>,
    archive_path: PathBuf,
    selection: ServiceSelection,
    scans: Option<(u32, u32)>,
}

impl LaunchState {
    pub fn selection(&self) -> &ServiceSelection {
        &self.selection
    }

    /// Lowest and highest scan number added so far.
    pub fn scan_range(&self) -> Option<(u32, u32)> {
        self.scans
    }

    pub fn submitted(&self) -> u32 {
        self.archive.as_ref().map_or(0, ScanArchive::entry_count)
    }

    fn append(&mut self, scan: &Scan, bytes: &[u8]) -> Result<(), JobError> {
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| crate::archive::ArchiveError::Closed(self.archive_path.clone()))?;
        archive.append(&scan.export_name(), bytes)?;
        self.scans = Some(match self.scans {
            Some((first, last)) => (first.min(scan.number), last.max(scan.number)),
            None => (scan.number, scan.number),
        });
        Ok(())
    }
}

/// Retrieval state of a picked-up job.
pub struct RetrieveState {
    results_dir: PathBuf,
    remote_status: StatusClass,
    unpacked: bool,
    scans: Option<(u32, u32)>,
    scans_in: u32,
    scans_done: u32,
}

impl RetrieveState {
    pub fn is_unpacked(&self) -> bool {
        self.unpacked
    }

    /// Last status class reported by the service.
    pub fn remote_status(&self) -> StatusClass {
        self.remote_status
    }

    pub fn progress(&self) -> (u32, u32) {
        (self.scans_done, self.scans_in)
    }

    pub fn scan_range(&self) -> Option<(u32, u32)> {
        self.scans
    }
}

pub enum Lifecycle {
    Launch(LaunchState),
    Retrieve(RetrieveState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Archive uploaded and accepted; the job should be remembered.
    Launched(PendingJob),
    /// Results consumed and the remote job deleted.
    Retrieved,
}

/// Drives one job from `init` through `finish`. Calls are sequential; the
/// registry wraps each orchestrator in its own mutex.
pub struct JobOrchestrator {
    job_id: String,
    target: String,
    account: AccountCredentials,
    transfer: TransferCredentials,
    phase: JobPhase,
    lifecycle: Lifecycle,
    deps: JobDeps,
    cancel: CancelToken,
    session: Option<TransferSession>,
    // Last, so open files above are closed before the directory goes.
    scratch: Option<ScratchDir>,
}

impl JobOrchestrator {
    /// Create a new job, or pick up the one named by `request.existing`.
    pub fn init(request: JobRequest, deps: JobDeps) -> Result<Self, JobError> {
        let JobRequest {
            target,
            existing,
            scan_count,
            mass_range,
            account,
        } = request;
        let pickup = existing.as_deref().and_then(PickupRef::parse);
        if let (Some(name), None) = (existing.as_deref(), pickup.as_ref()) {
            tracing::info!(name, "not a job id, launching a new job");
        }

        let outcome = match deps.api.init(&account, pickup.as_ref(), scan_count, mass_range) {
            Ok(outcome) => outcome,
            Err(err) => {
                let refused = match (&err, &pickup) {
                    (ApiError::Unexpected { line, .. }, Some(pickup)) => {
                        Some((pickup.job_id.clone(), line.class))
                    }
                    _ => None,
                };
                return Err(match refused {
                    Some((job_id, status)) => JobError::NotRetrievable { job_id, status },
                    None => err.into(),
                });
            }
        };

        match outcome {
            InitOutcome::Launched(grant) => {
                let scratch = ScratchDir::create(&deps.settings.work_root, &grant.job_id)?;
                let archive_path = scratch.path().join(format!("{}.scans.tar", grant.job_id));
                let archive = ScanArchive::create(&archive_path)?;
                tracing::info!(
                    job = %grant.job_id,
                    qos = %grant.selection.qos,
                    version = %grant.selection.version,
                    scans = scan_count,
                    "job created"
                );
                Ok(Self {
                    transfer: TransferCredentials {
                        host: deps.settings.transfer_host.clone(),
                        username: grant.transfer_user,
                        password: grant.transfer_password,
                        base_dir: deps.settings.remote_dir_for(grant.account_id),
                    },
                    job_id: grant.job_id,
                    target,
                    account,
                    phase: JobPhase::Launching,
                    lifecycle: Lifecycle::Launch(LaunchState {
                        archive: Some(archive),
                        archive_path,
                        selection: grant.selection,
                        scans: None,
                    }),
                    deps,
                    cancel: CancelToken::new(),
                    session: None,
                    scratch: Some(scratch),
                })
            }
            InitOutcome::Existing(progress) => {
                let scratch = ScratchDir::create(&deps.settings.work_root, &progress.job_id)?;
                let results_dir = scratch.path().join("results");
                tracing::info!(
                    job = %progress.job_id,
                    status = %progress.class,
                    done = progress.scans_done,
                    of = progress.scans_in,
                    "job picked up"
                );
                Ok(Self {
                    transfer: TransferCredentials {
                        host: deps.settings.transfer_host.clone(),
                        username: progress.transfer_user,
                        password: progress.transfer_password,
                        base_dir: deps.settings.remote_dir_for(progress.account_id),
                    },
                    lifecycle: Lifecycle::Retrieve(RetrieveState {
                        results_dir,
                        remote_status: progress.class,
                        unpacked: false,
                        scans: pickup.and_then(|pickup| pickup.scans),
                        scans_in: progress.scans_in,
                        scans_done: progress.scans_done,
                    }),
                    job_id: progress.job_id,
                    target,
                    account,
                    phase: JobPhase::AwaitingRemote,
                    deps,
                    cancel: CancelToken::new(),
                    session: None,
                    scratch: Some(scratch),
                })
            }
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_launch(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Launch(_))
    }

    /// Handle that interrupts a pending poll wait from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Launch: bundle `scan` if selected, never returning peaks.
    /// Retrieve: return the centroided peaks for `scan`, or `None` when the
    /// service produced no result for it. The first retrieval call waits for
    /// the job to finish and unpacks the results.
    pub fn process_scan(&mut self, scan: &Scan, selected: bool) -> Result<Option<Vec<Peak>>, JobError> {
        let result = if self.is_launch() {
            self.add_scan(scan, selected).map(|()| None)
        } else {
            self.take_result(scan)
        };
        self.record_failure(result)
    }

    /// Launch: upload the bundle and start processing. Retrieve: delete the
    /// remote job, refused until the results have been unpacked. On success
    /// the scratch directory is released; after a resumable error it is kept
    /// so `finish` can be called again.
    pub fn finish(&mut self) -> Result<FinishOutcome, JobError> {
        let result = if self.is_launch() {
            self.finish_launch()
        } else {
            self.finish_retrieve()
        };
        self.close_session();
        if result.is_ok() {
            self.scratch = None;
        }
        self.record_failure(result)
    }

    fn add_scan(&mut self, scan: &Scan, selected: bool) -> Result<(), JobError> {
        self.require(self.phase == JobPhase::Launching, "adding scans")?;
        if !selected {
            tracing::trace!(scan = scan.number, "scan not selected");
            return Ok(());
        }
        let bytes = self
            .deps
            .exporter
            .export(scan)
            .map_err(|source| JobError::ScanExport {
                scan: scan.number,
                source,
            })?;
        let state = self.launch_state("adding scans")?;
        if state.archive.as_ref().is_some_and(ScanArchive::is_closed) {
            return Err(self.invalid_state("adding scans after a launch attempt"));
        }
        state.append(scan, &bytes)?;
        tracing::debug!(job = %self.job_id, scan = scan.number, bytes = bytes.len(), "scan bundled");
        Ok(())
    }

    fn finish_launch(&mut self) -> Result<FinishOutcome, JobError> {
        self.require(self.phase == JobPhase::Launching, "launching")?;
        let result = self.submit();
        match &result {
            // The closed bundle and scratch stay for another `finish`.
            Err(err) if err.is_resumable() => {}
            Err(err) => {
                self.discard_archive();
                self.phase = JobPhase::Error(err.code());
                self.scratch = None;
            }
            Ok(_) => self.discard_archive(),
        }
        result
    }

    fn submit(&mut self) -> Result<FinishOutcome, JobError> {
        let count = self.launch_state("launching")?.submitted();
        if count == 0 {
            return Err(JobError::NoScans(self.job_id.clone()));
        }
        let state = self.launch_state("launching")?;
        let path = match state.archive.as_mut() {
            Some(archive) => archive.finish()?.to_path_buf(),
            None => return Err(self.invalid_state("launching")),
        };
        self.session()?.put(&path)?;
        let selection = self.launch_state("launching")?.selection.clone();
        let line = self
            .deps
            .api
            .run(&self.account, &self.job_id, count, &selection)?;
        if line.code() < StatusClass::Running.code() {
            return Err(JobError::LaunchRejected {
                job_id: self.job_id.clone(),
                message: line.raw().to_string(),
            });
        }
        self.phase = JobPhase::Running;
        tracing::info!(job = %self.job_id, scans = count, status = %line.class, "job launched");
        let scans = self.launch_state("launching")?.scans;
        Ok(FinishOutcome::Launched(PendingJob::new(
            &self.job_id,
            &self.target,
            scans,
            count,
        )))
    }

    fn discard_archive(&mut self) {
        if let Lifecycle::Launch(state) = &mut self.lifecycle {
            if let Some(archive) = state.archive.take() {
                archive.discard();
            }
        }
    }

    fn take_result(&mut self, scan: &Scan) -> Result<Option<Vec<Peak>>, JobError> {
        self.require(
            matches!(
                self.phase,
                JobPhase::AwaitingRemote | JobPhase::Running | JobPhase::Done | JobPhase::Cancelled
            ),
            "reading results",
        )?;
        self.ensure_results()?;
        let path = self
            .retrieve_state("reading results")?
            .results_dir
            .join(scan.result_name());
        let outcome = read_result(scan.number, &path);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove result file");
            }
        }
        outcome
    }

    /// Wait for the job and unpack its results, once.
    fn ensure_results(&mut self) -> Result<(), JobError> {
        if self.retrieve_state("reading results")?.unpacked {
            return Ok(());
        }
        self.wait_until_done()?;
        self.download_results()
    }

    fn wait_until_done(&mut self) -> Result<(), JobError> {
        if self.phase == JobPhase::Cancelled {
            tracing::info!(job = %self.job_id, "resuming status polling");
            self.cancel.reset();
        }
        let mut status = self.retrieve_state("polling")?.remote_status;
        loop {
            match status {
                StatusClass::Done => {
                    self.phase = JobPhase::Done;
                    return Ok(());
                }
                StatusClass::Running => self.phase = JobPhase::Running,
                other => {
                    return Err(JobError::NotRetrievable {
                        job_id: self.job_id.clone(),
                        status: other,
                    });
                }
            }
            let interval = self.deps.settings.poll_interval;
            if self.deps.timer.wait(interval, &self.cancel) == WaitOutcome::Cancelled {
                self.phase = JobPhase::Cancelled;
                tracing::info!(job = %self.job_id, "status polling cancelled");
                return Err(JobError::Cancelled {
                    job_id: self.job_id.clone(),
                });
            }
            let line = self.deps.api.status(&self.account, &self.job_id)?;
            let progress = crate::remote_api::JobProgress::parse(&line).ok();
            let state = self.retrieve_state_mut("polling")?;
            state.remote_status = line.class;
            if let Some(progress) = progress {
                state.scans_in = progress.scans_in;
                state.scans_done = progress.scans_done;
            }
            tracing::info!(job = %self.job_id, status = %line.class, message = %line.message, "job status");
            status = line.class;
        }
    }

    fn download_results(&mut self) -> Result<(), JobError> {
        let archive_name = format!("{}.vcent.tar", self.job_id);
        let local = self.scratch_path()?.join(&archive_name);
        self.session()?.get(&archive_name, &local)?;
        let results_dir = self.retrieve_state("unpacking")?.results_dir.clone();
        let unpacked = unpack_results(&local, &results_dir);
        if let Err(err) = fs::remove_file(&local) {
            tracing::warn!(path = %local.display(), error = %err, "failed to remove result archive");
        }
        let files = unpacked?;
        tracing::info!(job = %self.job_id, files = files.len(), "results unpacked");
        self.retrieve_state_mut("unpacking")?.unpacked = true;
        self.close_session();
        Ok(())
    }

    fn finish_retrieve(&mut self) -> Result<FinishOutcome, JobError> {
        self.require(self.phase != JobPhase::Retrieved, "finishing")?;
        if !self.retrieve_state("finishing")?.unpacked {
            return Err(self.invalid_state("finishing before results are retrieved"));
        }
        let line = self.deps.api.delete(&self.account, &self.job_id)?;
        tracing::info!(job = %self.job_id, status = %line.class, "remote job deleted");
        self.phase = JobPhase::Retrieved;
        Ok(FinishOutcome::Retrieved)
    }

    /// Lazily open the transfer session for this job.
    fn session(&mut self) -> Result<&mut TransferSession, JobError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let mut session = self.deps.settings.transport.open(&self.transfer)?;
                session.ensure_remote_dir(&self.transfer.base_dir)?;
                session
            }
        };
        Ok(self.session.insert(session))
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn record_failure<T>(&mut self, result: Result<T, JobError>) -> Result<T, JobError> {
        if let Err(err) = &result {
            if err.is_resumable() {
                tracing::warn!(job = %self.job_id, code = err.code(), error = %err, "job step failed");
            } else {
                if !matches!(self.phase, JobPhase::Error(_)) {
                    self.phase = JobPhase::Error(err.code());
                }
                self.close_session();
                tracing::error!(job = %self.job_id, code = err.code(), error = %err, "job failed");
            }
        }
        result
    }

    fn require(&self, allowed: bool, action: &'static str) -> Result<(), JobError> {
        if allowed {
            Ok(())
        } else {
            Err(self.invalid_state(action))
        }
    }

    fn invalid_state(&self, action: &'static str) -> JobError {
        JobError::InvalidState {
            job_id: self.job_id.clone(),
            phase: self.phase,
            action,
        }
    }

    fn scratch_path(&self) -> Result<&Path, JobError> {
        self.scratch
            .as_ref()
            .map(ScratchDir::path)
            .ok_or_else(|| self.invalid_state("using scratch files"))
    }

    fn launch_state(&mut self, action: &'static str) -> Result<&mut LaunchState, JobError> {
        match &mut self.lifecycle {
            Lifecycle::Launch(state) => Ok(state),
            Lifecycle::Retrieve(_) => Err(JobError::InvalidState {
                job_id: self.job_id.clone(),
                phase: self.phase,
                action,
            }),
        }
    }

    fn retrieve_state(&self, action: &'static str) -> Result<&RetrieveState, JobError> {
        match &self.lifecycle {
            Lifecycle::Retrieve(state) => Ok(state),
            Lifecycle::Launch(_) => Err(self.invalid_state(action)),
        }
    }

    fn retrieve_state_mut(&mut self, action: &'static str) -> Result<&mut RetrieveState, JobError> {
        match &mut self.lifecycle {
            Lifecycle::Retrieve(state) => Ok(state),
            Lifecycle::Launch(_) => Err(JobError::InvalidState {
                job_id: self.job_id.clone(),
                phase: self.phase,
                action,
            }),
        }
    }
}

/// Verify and parse one result file. A missing file means the service
/// skipped the scan.
fn read_result(scan: u32, path: &Path) -> Result<Option<Vec<Peak>>, JobError> {
    let read_error = |source| JobError::ResultRead { scan, source };
    match ChecksummedFile::new(path).verify().map_err(read_error)? {
        Verification::Valid => {}
        Verification::Missing => {
            tracing::debug!(scan, "no result for scan");
            return Ok(None);
        }
        Verification::Invalid { .. } => {
            return Err(JobError::InvalidChecksum {
                scan,
                path: path.to_path_buf(),
            });
        }
    }
    let text = fs::read_to_string(path).map_err(|source| {
        read_error(ChecksumError::Read {
            path: path.to_path_buf(),
            source,
        })
    })?;
    parse_peak_lines(text.lines())
        .map(Some)
        .map_err(|source| JobError::ResultParse { scan, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checksum::seal_text_file,
        job::{JobSettings, PollTimer},
        remote_api::{JobApi, JobGrant, StatusLine},
        scan::{MassRange, TextScanExporter},
        transfer::{TransferError, Transport},
    };
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };
    use tempfile::{TempDir, tempdir};

    /// Service stand-in that shares the drop directory with the client.
    struct ScriptedApi {
        drop_dir: PathBuf,
        statuses: Mutex<VecDeque<&'static str>>,
        run_reply: &'static str,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn new(drop_dir: &Path, statuses: &[&'static str]) -> Self {
            Self {
                drop_dir: drop_dir.to_path_buf(),
                statuses: Mutex::new(statuses.iter().copied().collect()),
                run_reply: "Running: accepted",
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl JobApi for ScriptedApi {
        fn create(
            &self,
            _account: &AccountCredentials,
            scan_count: u32,
            _mass_range: MassRange,
        ) -> Result<JobGrant, ApiError> {
            self.calls.lock().unwrap().push(format!("INIT {scan_count}"));
            JobGrant::parse(&StatusLine::parse("Info: ok|vpi-7|42|u7|pw7|0|RTO-24=0.5|1.2.7"))
        }

        fn run(
            &self,
            _account: &AccountCredentials,
            job_id: &str,
            scan_count: u32,
            _selection: &ServiceSelection,
        ) -> Result<StatusLine, ApiError> {
            let archive = self.drop_dir.join("accounts/42").join(format!("{job_id}.scans.tar"));
            assert!(archive.exists(), "archive uploaded before RUN");
            self.calls.lock().unwrap().push(format!("RUN {job_id} {scan_count}"));
            StatusLine::parse(self.run_reply).into_result()
        }

        fn status(&self, _account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError> {
            self.calls.lock().unwrap().push(format!("STATUS {job_id}"));
            let next = self.statuses.lock().unwrap().pop_front().unwrap_or("Done: ok");
            StatusLine::parse(&format!("{next}|{job_id}|42|u7|pw7|3|3|0.1|{job_id}.vcent.tar")).into_result()
        }

        fn delete(&self, _account: &AccountCredentials, job_id: &str) -> Result<StatusLine, ApiError> {
            self.calls.lock().unwrap().push(format!("DELETE {job_id}"));
            StatusLine::parse("Deleted: ok").into_result()
        }
    }

    #[derive(Default)]
    struct CountingTimer {
        waits: Mutex<u32>,
        cancel_on: Option<u32>,
    }

    impl PollTimer for CountingTimer {
        fn wait(&self, _interval: Duration, cancel: &CancelToken) -> WaitOutcome {
            let mut waits = self.waits.lock().unwrap();
            *waits += 1;
            if self.cancel_on == Some(*waits) {
                cancel.cancel();
            }
            if cancel.is_cancelled() {
                WaitOutcome::Cancelled
            } else {
                WaitOutcome::Elapsed
            }
        }
    }

    struct Fixture {
        work: TempDir,
        drop_dir: TempDir,
        api: Arc<ScriptedApi>,
        timer: Arc<CountingTimer>,
        deps: JobDeps,
    }

    fn fixture(statuses: &[&'static str], timer: CountingTimer) -> Fixture {
        fixture_with_run_reply(statuses, timer, "Running: accepted")
    }

    fn fixture_with_run_reply(
        statuses: &[&'static str],
        timer: CountingTimer,
        run_reply: &'static str,
    ) -> Fixture {
        let work = tempdir().unwrap();
        let drop_dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi {
            run_reply,
            ..ScriptedApi::new(drop_dir.path(), statuses)
        });
        let timer = Arc::new(timer);
        let deps = JobDeps {
            api: api.clone(),
            timer: timer.clone(),
            exporter: Arc::new(TextScanExporter::default()),
            settings: JobSettings {
                work_root: work.path().to_path_buf(),
                poll_interval: Duration::from_secs(60),
                transport: Transport::LocalDrop {
                    root: drop_dir.path().to_path_buf(),
                },
                transfer_host: "localhost".into(),
                remote_dir: "accounts/{account}".into(),
            },
        };
        Fixture {
            work,
            drop_dir,
            api,
            timer,
            deps,
        }
    }

    fn request(existing: Option<&str>) -> JobRequest {
        JobRequest {
            target: "run01.mzML".into(),
            existing: existing.map(str::to_string),
            scan_count: 3,
            mass_range: MassRange { min: 100.0, max: 900.0 },
            account: AccountCredentials {
                username: "ana".into(),
                password: "pw".into(),
                account_id: 42,
            },
        }
    }

    fn scan(number: u32) -> Scan {
        Scan::new(number, 1, vec![Peak::new(100.0 + number as f64, 5.0)])
    }

    fn stage_results(drop_dir: &Path, job_id: &str, results: &[(u32, &str)]) {
        let staging = tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        for (number, body) in results {
            let name = scan(*number).result_name();
            let path = staging.path().join(&name);
            fs::write(&path, body).unwrap();
            seal_text_file(&path).unwrap();
            builder.append_path_with_name(&path, &name).unwrap();
        }
        let dir = drop_dir.join("accounts/42");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{job_id}.vcent.tar")), builder.into_inner().unwrap()).unwrap();
    }

    #[test]
    fn launch_bundles_selected_scans_and_runs() {
        let fx = fixture(&[], CountingTimer::default());
        let mut job = JobOrchestrator::init(request(None), fx.deps.clone()).unwrap();
        assert_eq!(job.job_id(), "vpi-7");
        assert_eq!(job.phase(), JobPhase::Launching);

        assert_eq!(job.process_scan(&scan(1), true).unwrap(), None);
        assert_eq!(job.process_scan(&scan(2), false).unwrap(), None);
        assert_eq!(job.process_scan(&scan(3), true).unwrap(), None);

        let FinishOutcome::Launched(pending) = job.finish().unwrap() else {
            panic!("expected a launch");
        };
        assert_eq!(pending.scan_count, 2);
        assert_eq!((pending.first_scan, pending.last_scan), (Some(1), Some(3)));
        assert_eq!(job.phase(), JobPhase::Running);
        assert_eq!(fx.api.calls(), ["INIT 3", "RUN vpi-7 2"]);
        assert!(!fx.work.path().join("vpi-7").exists());
    }

    #[test]
    fn launch_below_running_is_fatal_and_cleans_up() {
        let fx = fixture_with_run_reply(&[], CountingTimer::default(), "Info: queued");
        let mut job = JobOrchestrator::init(request(None), fx.deps.clone()).unwrap();
        job.process_scan(&scan(1), true).unwrap();
        let err = job.finish().unwrap_err();
        assert!(matches!(err, JobError::LaunchRejected { .. }));
        assert_eq!(job.phase(), JobPhase::Error(-9));
        assert!(!fx.work.path().join("vpi-7").exists());
        assert!(job.process_scan(&scan(2), true).is_err());
    }

    #[test]
    fn unreachable_drop_keeps_bundle_for_another_finish() {
        let fx = fixture(&[], CountingTimer::default());
        let mut job = JobOrchestrator::init(request(None), fx.deps.clone()).unwrap();
        job.process_scan(&scan(1), true).unwrap();
        fs::remove_dir(fx.drop_dir.path()).unwrap();

        let err = job.finish().unwrap_err();
        assert!(matches!(err, JobError::Transfer(TransferError::Connect { .. })));
        assert_eq!(job.phase(), JobPhase::Launching);
        assert!(fx.work.path().join("vpi-7/vpi-7.scans.tar").is_file());
        let err = job.process_scan(&scan(2), true).unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
        assert_eq!(fx.api.calls(), ["INIT 3"]);

        fs::create_dir(fx.drop_dir.path()).unwrap();
        let FinishOutcome::Launched(pending) = job.finish().unwrap() else {
            panic!("expected a launch");
        };
        assert_eq!(pending.scan_count, 1);
        assert_eq!(job.phase(), JobPhase::Running);
        assert_eq!(fx.api.calls(), ["INIT 3", "RUN vpi-7 1"]);
        assert!(!fx.work.path().join("vpi-7").exists());
    }

    #[test]
    fn retrieve_polls_then_unpacks_once() {
        let fx = fixture(&["Running: 1 of 3", "Done: ok"], CountingTimer::default());
        stage_results(fx.drop_dir.path(), "vpi-7", &[(1, "100.5\t20\n"), (3, "300\t1\n")]);

        let mut job = JobOrchestrator::init(request(Some("vpi-7[1..3]")), fx.deps.clone()).unwrap();
        assert_eq!(job.phase(), JobPhase::AwaitingRemote);

        let peaks = job.process_scan(&scan(1), true).unwrap();
        assert_eq!(peaks, Some(vec![Peak::new(100.5, 20.0)]));
        assert_eq!(job.phase(), JobPhase::Done);
        assert_eq!(*fx.timer.waits.lock().unwrap(), 1);
        assert!(!fx.drop_dir.path().join("accounts/42/vpi-7.vcent.tar").exists());

        assert_eq!(job.process_scan(&scan(2), true).unwrap(), None);
        assert_eq!(job.process_scan(&scan(3), false).unwrap(), Some(vec![Peak::new(300.0, 1.0)]));
        assert_eq!(job.process_scan(&scan(3), true).unwrap(), None);

        assert_eq!(job.finish().unwrap(), FinishOutcome::Retrieved);
        assert_eq!(job.phase(), JobPhase::Retrieved);
        let calls = fx.api.calls();
        assert_eq!(calls, ["STATUS vpi-7", "STATUS vpi-7", "DELETE vpi-7"]);
    }

    #[test]
    fn corrupt_result_is_scan_scoped() {
        let fx = fixture(&["Done: ok"], CountingTimer::default());
        stage_results(fx.drop_dir.path(), "vpi-7", &[(1, "1\t2\n"), (2, "3\t4\n")]);
        let mut job = JobOrchestrator::init(request(Some("vpi-7")), fx.deps.clone()).unwrap();
        job.process_scan(&scan(2), true).unwrap();

        let path = fx.work.path().join("vpi-7/results").join(scan(1).result_name());
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("1\t2", "1\t9", 1)).unwrap();

        let err = job.process_scan(&scan(1), true).unwrap_err();
        assert!(matches!(err, JobError::InvalidChecksum { scan: 1, .. }));
        assert!(!path.exists());
        assert_eq!(job.phase(), JobPhase::Done);
    }

    #[test]
    fn cancelled_polling_resumes_on_next_call() {
        let timer = CountingTimer {
            cancel_on: Some(1),
            ..CountingTimer::default()
        };
        let fx = fixture(&["Running: a", "Done: ok"], timer);
        stage_results(fx.drop_dir.path(), "vpi-7", &[(1, "1\t2\n")]);
        let mut job = JobOrchestrator::init(request(Some("vpi-7")), fx.deps.clone()).unwrap();

        let err = job.process_scan(&scan(1), true).unwrap_err();
        assert!(matches!(err, JobError::Cancelled { .. }));
        assert_eq!(job.phase(), JobPhase::Cancelled);
        assert_eq!(fx.api.calls(), ["STATUS vpi-7"]);

        let peaks = job.process_scan(&scan(1), true).unwrap();
        assert_eq!(peaks, Some(vec![Peak::new(1.0, 2.0)]));
        assert_eq!(job.phase(), JobPhase::Done);
    }

    #[test]
    fn finish_before_unpacking_leaves_remote_job_alone() {
        let timer = CountingTimer {
            cancel_on: Some(1),
            ..CountingTimer::default()
        };
        let fx = fixture(&["Running: a", "Done: ok"], timer);
        stage_results(fx.drop_dir.path(), "vpi-7", &[(1, "1\t2\n")]);
        let mut job = JobOrchestrator::init(request(Some("vpi-7")), fx.deps.clone()).unwrap();
        assert!(job.process_scan(&scan(1), true).is_err());

        let err = job.finish().unwrap_err();
        assert!(err.is_resumable());
        assert!(matches!(err, JobError::InvalidState { .. }));
        assert_eq!(job.phase(), JobPhase::Cancelled);
        assert_eq!(fx.api.calls(), ["STATUS vpi-7"]);
        assert!(fx.work.path().join("vpi-7").exists());

        assert_eq!(job.process_scan(&scan(1), true).unwrap(), Some(vec![Peak::new(1.0, 2.0)]));
        assert_eq!(job.finish().unwrap(), FinishOutcome::Retrieved);
        assert_eq!(fx.api.calls(), ["STATUS vpi-7", "STATUS vpi-7", "DELETE vpi-7"]);
    }

    #[test]
    fn pickup_of_deleted_job_is_not_retrievable() {
        let fx = fixture(&["Deleted: gone"], CountingTimer::default());
        let err = JobOrchestrator::init(request(Some("vpi-7")), fx.deps.clone())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            JobError::NotRetrievable {
                status: StatusClass::Deleted,
                ..
            }
        ));
    }

    #[test]
    fn non_job_name_launches_new_job() {
        let fx = fixture(&[], CountingTimer::default());
        let job = JobOrchestrator::init(request(Some("my-run")), fx.deps.clone()).unwrap();
        assert!(job.is_launch());
    }
}
