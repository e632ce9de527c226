//! Test helpers for timing-sensitive tests
//!
//! Provides CI-tolerant deadlines, condition polling and a manually driven
//! scheduler for deterministic deadline tests.

use parking_lot::Mutex;
use skein_transport::{ScheduledHandle, Scheduler, Task};
use std::future::Future;
use std::time::Duration;

/// Check if running in a CI environment
///
/// Checks common CI environment variables.
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
        || std::env::var("CIRCLECI").is_ok()
        || std::env::var("TRAVIS").is_ok()
}

/// Get CI-adjusted timeout duration
///
/// Returns a timeout that's longer in CI environments to account for
/// resource contention and slower machines.
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout.mul_f32(3.0)
    } else {
        base_timeout.mul_f32(1.5)
    }
}

/// Poll `condition` every millisecond until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within `ci_timeout(limit)`.
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + ci_timeout(limit);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Await `future`, panicking if it takes longer than `ci_timeout(limit)`
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    match tokio::time::timeout(ci_timeout(limit), future).await {
        Ok(output) => output,
        Err(_) => panic!("operation did not finish within {:?}", limit),
    }
}

/// Scheduler that holds deadline tasks until the test fires them
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<(ScheduledHandle, Task)>>,
}

impl ManualScheduler {
    /// Empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every task whose handle was not cancelled. Returns how many ran.
    pub fn fire_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut ran = 0;
        for (handle, task) in tasks {
            if !handle.is_cancelled() {
                task();
                ran += 1;
            }
        }
        ran
    }

    /// Tasks waiting to fire
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, _delay: Duration, task: Task) -> ScheduledHandle {
        let handle = ScheduledHandle::unbound();
        self.tasks.lock().push((handle.clone(), task));
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ci_timeout() {
        let base = Duration::from_secs(10);
        let adjusted = ci_timeout(base);

        if is_ci_environment() {
            assert_eq!(adjusted, Duration::from_secs(30));
        } else {
            assert_eq!(adjusted, Duration::from_secs(15));
        }
    }

    #[test]
    fn test_manual_scheduler_skips_cancelled() {
        let scheduler = ManualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        scheduler.schedule_once(
            Duration::from_secs(1),
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let r = runs.clone();
        let cancelled = scheduler.schedule_once(
            Duration::from_secs(1),
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cancelled.cancel();

        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.fire_all(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
