//! Single-assignment asynchronous results.
//!
//! An [`AsyncResult`] starts Pending and moves to exactly one terminal
//! [`Outcome`]: Success, Failure or Cancelled.
//!
//! ```text
//!            set_uncancellable
//!   Pending ───────────────────▶ Uncancellable
//!     │  │                           │
//!     │  └── cancel ──▶ Cancelled    │
//!     │                              │
//!     └─ try_succeed / try_fail ─────┴──▶ Success | Failure
//! ```
//!
//! The state and the listener queue live under one mutex. Completion writes
//! the terminal state, wakes blocked waiters, then drains listeners in
//! registration order outside the lock. A single drainer at a time keeps
//! FIFO order even when listeners are added while notification is running.
//! A listener that panics is logged and skipped; the completer never sees
//! the panic.

use crate::error::{PromiseError, SyncError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal state of an `AsyncResult`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// Completed with a value
    Success(T),
    /// Completed with a failure cause
    Failure(E),
    /// Cancelled before completion
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    /// Whether this is `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The value, if successful
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(v) => Some(v),
            _ => None,
        }
    }

    /// The failure cause, if failed
    pub fn cause(&self) -> Option<&E> {
        match self {
            Outcome::Failure(e) => Some(e),
            _ => None,
        }
    }
}

type Listener<T, E> = Box<dyn FnOnce(&Outcome<T, E>) + Send + 'static>;

enum State<T, E> {
    Pending,
    Uncancellable,
    Done(Arc<Outcome<T, E>>),
}

struct Core<T, E> {
    state: State<T, E>,
    listeners: VecDeque<Listener<T, E>>,
    notifying: bool,
}

struct Inner<T, E> {
    core: Mutex<Core<T, E>>,
    done: Condvar,
}

/// Single-assignment asynchronous result.
///
/// Cloning yields another handle to the same result.
pub struct AsyncResult<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for AsyncResult<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for AsyncResult<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> AsyncResult<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a Pending result
    pub fn new() -> Self {
        Self::with_state(State::Pending)
    }

    /// Create a result already completed with `value`
    pub fn succeeded(value: T) -> Self {
        Self::with_state(State::Done(Arc::new(Outcome::Success(value))))
    }

    /// Create a result already failed with `cause`
    pub fn failed(cause: E) -> Self {
        Self::with_state(State::Done(Arc::new(Outcome::Failure(cause))))
    }

    fn with_state(state: State<T, E>) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state,
                    listeners: VecDeque::new(),
                    notifying: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Complete with `value`. Returns false if already terminal.
    pub fn try_succeed(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Fail with `cause`. Returns false if already terminal.
    pub fn try_fail(&self, cause: E) -> bool {
        self.complete(Outcome::Failure(cause))
    }

    /// Complete with `value`.
    ///
    /// # Errors
    /// Returns `PromiseError::AlreadyComplete` if the result was already
    /// terminal.
    pub fn set_succeeded(&self, value: T) -> Result<(), PromiseError> {
        if self.try_succeed(value) {
            Ok(())
        } else {
            Err(PromiseError::AlreadyComplete)
        }
    }

    /// Fail with `cause`.
    ///
    /// # Errors
    /// Returns `PromiseError::AlreadyComplete` if the result was already
    /// terminal.
    pub fn set_failed(&self, cause: E) -> Result<(), PromiseError> {
        if self.try_fail(cause) {
            Ok(())
        } else {
            Err(PromiseError::AlreadyComplete)
        }
    }

    /// Cancel a Pending result. Returns false if it is Uncancellable or
    /// already terminal.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    /// Forbid cancellation. Returns true if the result is now Uncancellable,
    /// or false if it already reached a terminal state.
    pub fn set_uncancellable(&self) -> bool {
        let mut core = self.inner.core.lock();
        match core.state {
            State::Pending => {
                core.state = State::Uncancellable;
                true
            }
            State::Uncancellable => true,
            State::Done(_) => false,
        }
    }

    fn complete(&self, outcome: Outcome<T, E>) -> bool {
        let outcome = {
            let mut core = self.inner.core.lock();
            match core.state {
                State::Done(_) => return false,
                State::Uncancellable if matches!(outcome, Outcome::Cancelled) => return false,
                _ => {}
            }
            let outcome = Arc::new(outcome);
            core.state = State::Done(Arc::clone(&outcome));
            // Later add_listener calls queue until the drain below finishes
            core.notifying = true;
            outcome
        };
        self.inner.done.notify_all();
        self.drain_listeners(&outcome);
        true
    }

    /// Register `listener` to run once with the terminal outcome.
    ///
    /// If the result is already terminal the listener runs immediately on
    /// the calling thread. Listeners must not block.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T, E>) + Send + 'static,
    {
        let outcome = {
            let mut core = self.inner.core.lock();
            let ready = match &core.state {
                State::Done(outcome) if !core.notifying => Some(Arc::clone(outcome)),
                _ => None,
            };
            match ready {
                Some(outcome) => outcome,
                None => {
                    core.listeners.push_back(Box::new(listener));
                    return;
                }
            }
        };
        invoke(Box::new(listener), &outcome);
    }

    /// Run queued listeners in registration order until the queue stays
    /// empty. Only the completing thread calls this, with `notifying` set.
    fn drain_listeners(&self, outcome: &Outcome<T, E>) {
        loop {
            let batch = {
                let mut core = self.inner.core.lock();
                if core.listeners.is_empty() {
                    core.notifying = false;
                    return;
                }
                std::mem::take(&mut core.listeners)
            };
            for listener in batch {
                invoke(listener, outcome);
            }
        }
    }

    /// Whether the result reached a terminal state
    pub fn is_done(&self) -> bool {
        matches!(self.inner.core.lock().state, State::Done(_))
    }

    /// Whether the result completed successfully
    pub fn is_success(&self) -> bool {
        self.outcome().is_some_and(|o| o.is_success())
    }

    /// Whether the result was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.outcome()
            .is_some_and(|o| matches!(*o, Outcome::Cancelled))
    }

    /// Whether `cancel` can still succeed
    pub fn is_cancellable(&self) -> bool {
        matches!(self.inner.core.lock().state, State::Pending)
    }

    /// Terminal outcome, or `None` while pending
    pub fn outcome(&self) -> Option<Arc<Outcome<T, E>>> {
        match &self.inner.core.lock().state {
            State::Done(outcome) => Some(Arc::clone(outcome)),
            _ => None,
        }
    }

    /// Block until terminal
    pub fn wait(&self) {
        let mut core = self.inner.core.lock();
        while !matches!(core.state, State::Done(_)) {
            self.inner.done.wait(&mut core);
        }
    }

    /// Block until terminal or `timeout` elapses. Returns whether the result
    /// completed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut core = self.inner.core.lock();
        while !matches!(core.state, State::Done(_)) {
            if self.inner.done.wait_until(&mut core, deadline).timed_out() {
                return matches!(core.state, State::Done(_));
            }
        }
        true
    }

    /// Resolve once the result is terminal, without blocking the thread
    pub async fn completed(&self) {
        if self.is_done() {
            return;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.add_listener(move |_| {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

impl<T, E> AsyncResult<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// The value if successful; `None` while pending, failed or cancelled
    pub fn get_now(&self) -> Option<T> {
        self.outcome().and_then(|o| o.value().cloned())
    }

    /// The failure cause if failed
    pub fn cause(&self) -> Option<E> {
        self.outcome().and_then(|o| o.cause().cloned())
    }

    /// Block until terminal, then return the value or the failure.
    ///
    /// # Errors
    /// Returns `SyncError::Failed` with the cause, or `SyncError::Cancelled`.
    pub fn sync(&self) -> Result<T, SyncError<E>> {
        self.wait();
        self.take_result()
    }

    /// Async form of [`sync`](Self::sync).
    ///
    /// # Errors
    /// Returns `SyncError::Failed` with the cause, or `SyncError::Cancelled`.
    pub async fn result(&self) -> Result<T, SyncError<E>> {
        self.completed().await;
        self.take_result()
    }

    fn take_result(&self) -> Result<T, SyncError<E>> {
        match self.outcome().as_deref() {
            Some(Outcome::Success(v)) => Ok(v.clone()),
            Some(Outcome::Failure(e)) => Err(SyncError::Failed(e.clone())),
            Some(Outcome::Cancelled) | None => Err(SyncError::Cancelled),
        }
    }
}

fn invoke<T, E>(listener: Listener<T, E>, outcome: &Outcome<T, E>) {
    if catch_unwind(AssertUnwindSafe(|| listener(outcome))).is_err() {
        tracing::error!("AsyncResult listener panicked; continuing with remaining listeners");
    }
}

impl<T, E> fmt::Debug for AsyncResult<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.core.lock().state {
            State::Pending => "pending",
            State::Uncancellable => "uncancellable",
            State::Done(o) => match **o {
                Outcome::Success(_) => "success",
                Outcome::Failure(_) => "failure",
                Outcome::Cancelled => "cancelled",
            },
        };
        f.debug_struct("AsyncResult").field("state", &state).finish()
    }
}

type ProgressListener = Arc<dyn Fn(u64, u64) + Send + Sync + 'static>;

/// An `AsyncResult` that also reports progress while pending.
///
/// Progress listeners are separate from completion listeners and never
/// affect the terminal state.
pub struct ProgressiveAsyncResult<T, E> {
    result: AsyncResult<T, E>,
    progress: Arc<Mutex<Vec<ProgressListener>>>,
}

impl<T, E> Clone for ProgressiveAsyncResult<T, E> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            progress: Arc::clone(&self.progress),
        }
    }
}

impl<T, E> Default for ProgressiveAsyncResult<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> ProgressiveAsyncResult<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a Pending result
    pub fn new() -> Self {
        Self {
            result: AsyncResult::new(),
            progress: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a listener for progress notifications
    pub fn add_progress_listener<F>(&self, listener: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress.lock().push(Arc::new(listener));
    }

    /// Report `done` of `total` units complete.
    ///
    /// # Errors
    /// Returns `PromiseError::AlreadyComplete` once terminal, or
    /// `PromiseError::InvalidProgress` if `done > total`.
    pub fn set_progress(&self, done: u64, total: u64) -> Result<(), PromiseError> {
        if done > total {
            return Err(PromiseError::InvalidProgress { done, total });
        }
        if self.result.is_done() {
            return Err(PromiseError::AlreadyComplete);
        }

        let listeners: Vec<ProgressListener> = self.progress.lock().clone();
        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(done, total))).is_err() {
                tracing::error!("Progress listener panicked at {}/{}", done, total);
            }
        }
        Ok(())
    }

    /// The underlying result
    pub fn as_result(&self) -> &AsyncResult<T, E> {
        &self.result
    }
}

impl<T, E> std::ops::Deref for ProgressiveAsyncResult<T, E> {
    type Target = AsyncResult<T, E>;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

impl<T, E> fmt::Debug for ProgressiveAsyncResult<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressiveAsyncResult")
            .field("result", &self.result)
            .finish()
    }
}
