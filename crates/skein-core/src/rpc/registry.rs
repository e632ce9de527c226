//! Pending request correlation.
//!
//! Every outbound REQUEST gets a fresh id from a wrapping counter and a
//! [`PendingRequest`] entry holding its `AsyncResult`. The entry leaves the
//! table exactly once through [`RequestRegistry::resolve`], whichever comes
//! first of:
//!
//! - the matching RESPONSE
//! - the deadline timer (`expire`)
//! - a connection cascade (`fail_all_for`)
//! - the caller cancelling the result
//!
//! Because removal is the only way to obtain the entry, a response racing a
//! timeout completes the result at most once; the loser finds nothing.

use crate::promise::{AsyncResult, Outcome};
use crate::rpc::connection::ConnectionId;
use crate::rpc::error::{RpcError, RpcResult};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use skein_transport::{ChannelId, ScheduledHandle, Scheduler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Result type handed to callers of `send_request`
pub type ResponseResult = AsyncResult<Bytes, RpcError>;

/// State of one in-flight request
#[derive(Debug)]
pub struct PendingRequest {
    request_id: u64,
    result: ResponseResult,
    connection: ConnectionId,
    channel: Option<ChannelId>,
    action: String,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    registered_at: Instant,
    timer: Option<ScheduledHandle>,
}

impl PendingRequest {
    /// Request id
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Result the caller is waiting on
    pub fn result(&self) -> &ResponseResult {
        &self.result
    }

    /// Connection the request was sent on
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Channel the request was written to
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Action name
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Absolute deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time since registration
    pub fn elapsed(&self) -> Duration {
        self.registered_at.elapsed()
    }

    fn timeout_error(&self) -> RpcError {
        RpcError::Timeout {
            action: self.action.clone(),
            request_id: self.request_id,
            timeout_ms: self.timeout.map_or(0, |t| t.as_millis() as u64),
        }
    }
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Requests registered
    pub registered: u64,
    /// Requests resolved by any path
    pub resolved: u64,
    /// Requests that hit their deadline
    pub timed_out: u64,
    /// Requests failed by a connection cascade
    pub failed_by_connection: u64,
}

#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    failed_by_connection: AtomicU64,
}

/// Table of in-flight requests
pub struct RequestRegistry {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    scheduler: Arc<dyn Scheduler>,
    counters: Counters,
}

impl RequestRegistry {
    /// Create an empty registry arming deadlines on `scheduler`
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Self::starting_at(scheduler, 1)
    }

    /// Registry whose first id is `first_id`
    pub fn starting_at(scheduler: Arc<dyn Scheduler>, first_id: u64) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(first_id),
            pending: DashMap::new(),
            scheduler,
            counters: Counters::default(),
        })
    }

    /// Register a request and return its id and result.
    ///
    /// A non-zero `timeout` arms a deadline that fails the result with
    /// `RpcError::Timeout`. Cancelling the result removes the entry.
    ///
    /// # Errors
    /// Returns `RpcError::Internal` if the allocated id is still pending,
    /// which means the counter wrapped onto a live request.
    pub fn register(
        self: &Arc<Self>,
        connection: ConnectionId,
        channel: Option<ChannelId>,
        action: &str,
        timeout: Option<Duration>,
    ) -> RpcResult<(u64, ResponseResult)> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = ResponseResult::new();
        let timeout = timeout.filter(|t| !t.is_zero());
        let now = Instant::now();

        match self.pending.entry(request_id) {
            Entry::Occupied(_) => {
                debug_assert!(false, "request id {} registered twice", request_id);
                tracing::error!(request_id, "Request id collision in registry");
                return Err(RpcError::internal("request id already pending"));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    request_id,
                    result: result.clone(),
                    connection,
                    channel,
                    action: action.to_string(),
                    deadline: timeout.map(|t| now + t),
                    timeout,
                    registered_at: now,
                    timer: None,
                });
            }
        }
        self.counters.registered.fetch_add(1, Ordering::Relaxed);

        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(self);
            let handle = self.scheduler.schedule_once(
                timeout,
                Box::new(move || {
                    if let Some(registry) = weak.upgrade() {
                        registry.expire(request_id);
                    }
                }),
            );
            match self.pending.get_mut(&request_id) {
                Some(mut entry) => entry.timer = Some(handle),
                None => handle.cancel(),
            }
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        result.add_listener(move |outcome| {
            if matches!(outcome, Outcome::Cancelled) {
                if let Some(registry) = weak.upgrade() {
                    if registry.resolve(request_id).is_some() {
                        tracing::debug!(request_id, "Pending request cancelled by caller");
                    }
                }
            }
        });

        Ok((request_id, result))
    }

    /// Remove and return the entry for `request_id`. Idempotent: a second
    /// call returns `None`.
    pub fn resolve(&self, request_id: u64) -> Option<PendingRequest> {
        let (_, pending) = self.pending.remove(&request_id)?;
        if let Some(timer) = &pending.timer {
            timer.cancel();
        }
        self.counters.resolved.fetch_add(1, Ordering::Relaxed);
        Some(pending)
    }

    /// Deadline path: resolve and fail with `RpcError::Timeout`
    pub fn expire(&self, request_id: u64) -> bool {
        let Some(pending) = self.resolve(request_id) else {
            return false;
        };
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            request_id,
            action = %pending.action,
            elapsed_ms = pending.elapsed().as_millis() as u64,
            "Request timed out"
        );
        pending.result.try_fail(pending.timeout_error())
    }

    /// Fail every request bound to `connection` with `cause`. Returns how
    /// many were failed.
    pub fn fail_all_for(&self, connection: ConnectionId, cause: &RpcError) -> usize {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|e| e.value().connection == connection)
            .map(|e| *e.key())
            .collect();
        self.fail_ids(ids, cause)
    }

    /// Fail every pending request with `cause`
    pub fn fail_all(&self, cause: &RpcError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        self.fail_ids(ids, cause)
    }

    fn fail_ids(&self, ids: Vec<u64>, cause: &RpcError) -> usize {
        let mut failed = 0;
        for id in ids {
            if let Some(pending) = self.resolve(id) {
                if pending.result.try_fail(cause.clone()) {
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            self.counters
                .failed_by_connection
                .fetch_add(failed as u64, Ordering::Relaxed);
            tracing::debug!(failed, cause = %cause, "Failed pending requests");
        }
        failed
    }

    /// Whether `request_id` is pending
    pub fn contains(&self, request_id: u64) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending requests bound to `connection`
    pub fn pending_for(&self, connection: ConnectionId) -> usize {
        self.pending
            .iter()
            .filter(|e| e.value().connection == connection)
            .count()
    }

    /// Snapshot of registry counters
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            failed_by_connection: self.counters.failed_by_connection.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error::FailureKind;
    use parking_lot::Mutex;
    use skein_transport::{Task, TokioScheduler};

    /// Scheduler that holds tasks until the test fires them
    #[derive(Default)]
    struct ManualScheduler {
        tasks: Mutex<Vec<Task>>,
    }

    impl ManualScheduler {
        fn fire_all(&self) {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            for task in tasks {
                task();
            }
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule_once(&self, _delay: Duration, task: Task) -> ScheduledHandle {
            self.tasks.lock().push(task);
            ScheduledHandle::detached()
        }
    }

    fn manual() -> (Arc<ManualScheduler>, Arc<RequestRegistry>) {
        let scheduler = Arc::new(ManualScheduler::default());
        let registry = RequestRegistry::new(scheduler.clone());
        (scheduler, registry)
    }

    #[test]
    fn test_ids_unique_and_monotonic() {
        let (_, registry) = manual();
        let (a, _) = registry.register(1, None, "a", None).unwrap();
        let (b, _) = registry.register(1, None, "b", None).unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_wrap() {
        let registry = RequestRegistry::starting_at(Arc::new(ManualScheduler::default()), u64::MAX);
        let (a, _) = registry.register(1, None, "a", None).unwrap();
        let (b, _) = registry.register(1, None, "b", None).unwrap();
        assert_eq!(a, u64::MAX);
        assert_eq!(b, 0);
    }

    #[test]
    fn test_resolve_idempotent() {
        let (_, registry) = manual();
        let (id, result) = registry.register(1, Some(7), "echo", None).unwrap();

        let pending = registry.resolve(id).unwrap();
        assert_eq!(pending.action(), "echo");
        assert_eq!(pending.channel(), Some(7));
        assert!(registry.resolve(id).is_none());
        assert!(!result.is_done());
    }

    #[test]
    fn test_timeout_fails_once() {
        let (scheduler, registry) = manual();
        let (id, result) = registry
            .register(1, None, "slow", Some(Duration::from_millis(50)))
            .unwrap();

        scheduler.fire_all();
        assert_eq!(result.cause().map(|e| e.kind()), Some(FailureKind::Timeout));
        assert!(!registry.contains(id));
        assert!(!registry.expire(id));
        assert_eq!(registry.stats().timed_out, 1);
    }

    #[test]
    fn test_response_beats_timeout() {
        let (scheduler, registry) = manual();
        let (id, result) = registry
            .register(1, None, "fast", Some(Duration::from_millis(50)))
            .unwrap();

        let pending = registry.resolve(id).unwrap();
        pending.result().try_succeed(Bytes::from_static(b"ok"));
        scheduler.fire_all();

        assert_eq!(result.get_now(), Some(Bytes::from_static(b"ok")));
        assert_eq!(registry.stats().timed_out, 0);
    }

    #[test]
    fn test_fail_all_for_connection() {
        let (_, registry) = manual();
        let results: Vec<_> = (0..3)
            .map(|_| registry.register(10, None, "x", None).unwrap().1)
            .collect();
        let (_, other) = registry.register(11, None, "y", None).unwrap();

        let failed = registry.fail_all_for(10, &RpcError::connection_closed("test"));
        assert_eq!(failed, 3);
        for r in &results {
            assert_eq!(r.cause().map(|e| e.kind()), Some(FailureKind::ConnectionClosed));
        }
        assert!(!other.is_done());
        assert_eq!(registry.pending_for(11), 1);
        assert_eq!(registry.fail_all_for(10, &RpcError::connection_closed("again")), 0);
    }

    #[test]
    fn test_cancel_removes_entry() {
        let (_, registry) = manual();
        let (id, result) = registry.register(1, None, "x", None).unwrap();
        assert!(result.cancel());
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_real_deadline() {
        let registry = RequestRegistry::new(Arc::new(TokioScheduler::current().unwrap()));
        let start = Instant::now();
        let (_, result) = registry
            .register(1, None, "slow", Some(Duration::from_millis(30)))
            .unwrap();

        result.completed().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(matches!(result.cause(), Some(RpcError::Timeout { timeout_ms: 30, .. })));
        assert!(registry.is_empty());
    }
}
