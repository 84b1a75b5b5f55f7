mod support;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use peakjob::{
    credentials::AccountCredentials,
    job::{JobError, JobSettings},
    registry::JobLedger,
    scan::{Peak, Scan},
    service::{CentroidService, ServiceError},
    transfer::Transport,
};
use support::fake_service::{ACCOUNT_ID, FakeService};

fn account() -> AccountCredentials {
    AccountCredentials {
        username: "analyst".into(),
        password: "hunter2".into(),
        account_id: ACCOUNT_ID,
    }
}

/// Real-time service; no custom timer.
fn service(temp: &tempfile::TempDir, api: Arc<FakeService>, poll_interval: Duration) -> CentroidService {
    let drop_root = temp.path().join("drop");
    std::fs::create_dir_all(&drop_root).expect("create drop dir");
    let settings = JobSettings {
        work_root: temp.path().join("work"),
        poll_interval,
        transport: Transport::LocalDrop { root: drop_root },
        transfer_host: "localhost".into(),
        remote_dir: "accounts/{account}".into(),
    };
    CentroidService::new(api, settings, JobLedger::at(temp.path().join("jobs.json")))
}

fn is_cancelled(result: &Result<Option<Vec<Peak>>, ServiceError>) -> bool {
    matches!(result, Err(ServiceError::Job(JobError::Cancelled { .. })))
}

#[test]
fn cancel_from_another_thread_interrupts_a_long_poll() {
    let temp = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeService::new(&temp.path().join("drop")).with_statuses(&["Running"]));
    let service = service(&temp, api.clone(), Duration::from_secs(3600));
    let job_id = service.start_job(&[], "sample.mzML", Some("vpi-7"), account()).unwrap();
    let scan = Scan::new(1, 1, Vec::new());

    let started = Instant::now();
    let result = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            assert!(service.cancel_job(&job_id));
        });
        service.process_scan(&job_id, &scan, true)
    });

    assert!(is_cancelled(&result));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(api.calls(), ["STATUS vpi-7"]);
    assert_eq!(service.open_jobs(), ["vpi-7"]);
    assert!(service.abandon_job(&job_id));
}

#[test]
fn cancelled_job_resumes_polling_on_next_scan() {
    let temp = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeService::new(&temp.path().join("drop")).with_statuses(&["Running", "Done"]));
    let service = service(&temp, api.clone(), Duration::from_millis(10));
    let job_id = service.start_job(&[], "sample.mzML", Some("vpi-8"), account()).unwrap();
    let scan = Scan::new(1, 1, Vec::new());

    assert!(service.cancel_job(&job_id));
    assert!(is_cancelled(&service.process_scan(&job_id, &scan, true)));

    // The service reports Done but never produced a result archive.
    let err = service.process_scan(&job_id, &scan, true).unwrap_err();
    assert!(matches!(err, ServiceError::Job(JobError::Transfer(_))));
    assert_eq!(api.calls(), ["STATUS vpi-8", "STATUS vpi-8"]);
}

#[test]
fn cancelling_one_job_leaves_others_running() {
    let temp = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeService::new(&temp.path().join("drop")));
    let service = service(&temp, api, Duration::from_millis(10));
    let scans = vec![Scan::new(4, 1, vec![Peak::new(50.0, 2.0)])];
    let first = service.start_job(&scans, "a.mzML", None, account()).unwrap();
    let second = service.start_job(&scans, "b.mzML", None, account()).unwrap();
    assert_ne!(first, second);

    assert!(service.cancel_job(&first));
    service.process_scan(&second, &scans[0], true).unwrap();
    service.finish_job(&second).unwrap();
    assert_eq!(service.open_jobs(), [first]);
}
