use std::{sync::Mutex, time::Duration};

use peakjob::job::{CancelToken, PollTimer, WaitOutcome};

/// Timer that never sleeps and records each requested interval.
#[derive(Default)]
pub struct InstantTimer {
    waits: Mutex<Vec<Duration>>,
}

impl InstantTimer {
    pub fn waits(&self) -> usize {
        self.waits.lock().expect("timer mutex").len()
    }
}

impl PollTimer for InstantTimer {
    fn wait(&self, interval: Duration, cancel: &CancelToken) -> WaitOutcome {
        self.waits.lock().expect("timer mutex").push(interval);
        if cancel.is_cancelled() {
            WaitOutcome::Cancelled
        } else {
            WaitOutcome::Elapsed
        }
    }
}
