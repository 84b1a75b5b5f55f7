mod support;

use std::{path::Path, sync::Arc, time::Duration};

use peakjob::{
    credentials::AccountCredentials,
    job::JobSettings,
    registry::JobLedger,
    scan::{Peak, Scan},
    service::{CentroidService, ScanSpan},
    transfer::Transport,
};
use support::{
    fake_service::{ACCOUNT_ID, FakeService},
    timer::InstantTimer,
};
use tempfile::TempDir;

struct Harness {
    temp: TempDir,
}

impl Harness {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        std::fs::create_dir_all(temp.path().join("drop")).expect("create drop dir");
        Self { temp }
    }

    fn drop_root(&self) -> std::path::PathBuf {
        self.temp.path().join("drop")
    }

    fn work_root(&self) -> std::path::PathBuf {
        self.temp.path().join("work")
    }

    fn service(&self, api: Arc<FakeService>, timer: Arc<InstantTimer>) -> CentroidService {
        let settings = JobSettings {
            work_root: self.work_root(),
            poll_interval: Duration::from_secs(60),
            transport: Transport::LocalDrop {
                root: self.drop_root(),
            },
            transfer_host: "localhost".into(),
            remote_dir: "accounts/{account}".into(),
        };
        CentroidService::new(api, settings, JobLedger::at(self.temp.path().join("jobs.json")))
            .with_timer(timer)
    }
}

fn account() -> AccountCredentials {
    AccountCredentials {
        username: "analyst".into(),
        password: "hunter2".into(),
        account_id: ACCOUNT_ID,
    }
}

fn scans() -> Vec<Scan> {
    vec![
        Scan::new(1, 1, vec![Peak::new(100.0, 5.0), Peak::new(100.25, 9.5)]),
        Scan::new(2, 1, vec![Peak::new(210.5, 3.0)]),
        Scan::new(3, 2, vec![Peak::new(300.125, 7.0), Peak::new(301.0, 1.0)]),
    ]
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map_or(true, |mut entries| entries.next().is_none())
}

#[test]
fn launch_three_scans_end_to_end() {
    let harness = Harness::new();
    let api = Arc::new(FakeService::new(&harness.drop_root()));
    let service = harness.service(api.clone(), Arc::new(InstantTimer::default()));
    let scans = scans();

    let job_id = service
        .start_job(&scans, "sample.mzML", None, account())
        .expect("start job");
    assert_eq!(job_id, "vpi-100");
    for scan in &scans {
        assert_eq!(service.process_scan(&job_id, scan, true).expect("bundle scan"), None);
    }
    service.finish_job(&job_id).expect("finish launch");

    assert_eq!(api.calls(), ["INIT 3", "RUN vpi-100 3 RTO-24"]);
    let account_dir = api.account_dir();
    let uploaded = std::fs::File::open(account_dir.join("vpi-100.scans.tar")).expect("uploaded archive");
    let names: Vec<String> = tar::Archive::new(uploaded)
        .entries()
        .expect("archive entries")
        .map(|entry| {
            let entry = entry.expect("archive entry");
            entry
                .path()
                .map(|path| path.to_string_lossy().into_owned())
                .expect("entry path")
        })
        .collect();
    assert_eq!(
        names,
        ["scan0001_ms1.txt.gz", "scan0002_ms1.txt.gz", "scan0003_ms2.txt.gz"]
    );
    assert!(!account_dir.join("vpi-100.scans.tar.filepart").exists());
    assert!(account_dir.join("batches").is_dir());
    assert!(dir_is_empty(&harness.work_root()));

    let pending = service.list_pending_jobs();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, "vpi-100");
    assert_eq!(pending[0].target, "sample.mzML");
    assert_eq!(pending[0].scans, ScanSpan::Range { first: 1, last: 3 });
    assert_eq!(pending[0].pickup_name, "vpi-100[1..3]");
}

#[test]
fn unselected_scans_are_not_uploaded() {
    let harness = Harness::new();
    let api = Arc::new(FakeService::new(&harness.drop_root()));
    let service = harness.service(api.clone(), Arc::new(InstantTimer::default()));
    let scans = scans();

    let job_id = service.start_job(&scans, "sample.mzML", None, account()).unwrap();
    service.process_scan(&job_id, &scans[0], false).unwrap();
    service.process_scan(&job_id, &scans[1], true).unwrap();
    service.process_scan(&job_id, &scans[2], false).unwrap();
    service.finish_job(&job_id).unwrap();

    assert_eq!(api.calls(), ["INIT 3", "RUN vpi-100 1 RTO-24"]);
    let pending = service.list_pending_jobs();
    assert_eq!(pending[0].scans, ScanSpan::Range { first: 2, last: 2 });
}

#[test]
fn retrieve_after_restart_polls_until_done() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeService::new(&harness.drop_root()).skipping(&[2]));
    let first_run = harness.service(launcher, Arc::new(InstantTimer::default()));
    let scans = scans();
    let job_id = first_run.start_job(&scans, "sample.mzML", None, account()).unwrap();
    for scan in &scans {
        first_run.process_scan(&job_id, scan, true).unwrap();
    }
    first_run.finish_job(&job_id).unwrap();
    drop(first_run);

    // A later process only has the ledger to go on.
    let api = Arc::new(FakeService::new(&harness.drop_root()).with_statuses(&["Running", "Running", "Done"]));
    let timer = Arc::new(InstantTimer::default());
    let service = harness.service(api.clone(), timer.clone());
    let pickup = service.list_pending_jobs()[0].pickup_name.clone();
    let job_id = service
        .start_job(&scans, "sample.mzML", Some(&pickup), account())
        .expect("pick up job");
    assert_eq!(job_id, "vpi-100");

    let first = service.process_scan(&job_id, &scans[0], true).unwrap();
    assert_eq!(first, Some(vec![Peak::new(100.25, 9.5)]));
    assert_eq!(timer.waits(), 2);
    assert!(!api.account_dir().join("vpi-100.vcent.tar").exists());

    assert_eq!(service.process_scan(&job_id, &scans[1], true).unwrap(), None);
    let third = service.process_scan(&job_id, &scans[2], true).unwrap();
    assert_eq!(third, Some(vec![Peak::new(300.125, 7.0)]));
    assert_eq!(api.calls(), ["STATUS vpi-100", "STATUS vpi-100", "STATUS vpi-100"]);

    service.finish_job(&job_id).unwrap();
    assert_eq!(api.calls().last().map(String::as_str), Some("DELETE vpi-100"));
    assert!(service.list_pending_jobs().is_empty());
    assert!(service.open_jobs().is_empty());
    assert!(dir_is_empty(&harness.work_root()));
}

#[test]
fn picking_up_a_deleted_job_fails_without_opening_it() {
    let harness = Harness::new();
    let api = Arc::new(FakeService::new(&harness.drop_root()).with_statuses(&["Deleted"]));
    let service = harness.service(api, Arc::new(InstantTimer::default()));

    let err = service
        .start_job(&scans(), "sample.mzML", Some("vpi-55"), account())
        .unwrap_err();
    assert_eq!(err.code(), 4);
    assert!(service.open_jobs().is_empty());
}
