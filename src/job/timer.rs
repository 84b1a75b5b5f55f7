//! Cancellable waits between status polls.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake any pending wait and make later waits return immediately.
    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().expect("cancel token mutex poisoned") = true;
        wake.notify_all();
    }

    pub fn reset(&self) {
        let (flag, _) = &*self.inner;
        *flag.lock().expect("cancel token mutex poisoned") = false;
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().expect("cancel token mutex poisoned")
    }
}

/// Source of the pause between two status queries.
pub trait PollTimer: Send + Sync {
    fn wait(&self, interval: Duration, cancel: &CancelToken) -> WaitOutcome;
}

/// Real-time timer that returns early when the token is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimer;

impl PollTimer for SystemTimer {
    fn wait(&self, interval: Duration, cancel: &CancelToken) -> WaitOutcome {
        let (flag, wake) = &*cancel.inner;
        let guard = flag.lock().expect("cancel token mutex poisoned");
        let (guard, _) = wake
            .wait_timeout_while(guard, interval, |cancelled| !*cancelled)
            .expect("cancel token mutex poisoned");
        if *guard {
            WaitOutcome::Cancelled
        } else {
            WaitOutcome::Elapsed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Instant};

    #[test]
    fn wait_elapses_without_cancel() {
        let token = CancelToken::new();
        let outcome = SystemTimer.wait(Duration::from_millis(10), &token);
        assert_eq!(outcome, WaitOutcome::Elapsed);
    }

    #[test]
    fn cancel_wakes_a_long_wait_promptly() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let started = Instant::now();
        let outcome = SystemTimer.wait(Duration::from_secs(60), &token);
        canceller.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn reset_allows_waiting_again() {
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(
            SystemTimer.wait(Duration::from_secs(60), &token),
            WaitOutcome::Cancelled
        );
        token.reset();
        assert!(!token.is_cancelled());
        assert_eq!(
            SystemTimer.wait(Duration::from_millis(5), &token),
            WaitOutcome::Elapsed
        );
    }
}
