//! Timeout and locking primitives shared by the agents
//!
//! - [`Completion`]: a result slot that resolves exactly once; later attempts are no-ops
//! - [`TimerHandle`]: a single-shot timer that can be cancelled and never fires twice
//! - [`BoundedLock`]: a counting lock whose waiters give up after a ceiling

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default ceiling for a [`BoundedLock`] wait (5 minutes)
pub const DEFAULT_LOCK_CEILING: Duration = Duration::from_secs(300);

// ============================================================================
// COMPLETION
// ============================================================================

/// Observable state of a [`Completion`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Pending,
    Succeeded,
    Failed,
}

enum Slot<T, E> {
    Pending(oneshot::Sender<Result<T, E>>),
    Resolved(ResultState),
}

/// Single-resolution result slot
///
/// The first call to [`Completion::resolve`] or [`Completion::resolve_with`]
/// wins. Every later call returns `false` and has no effect.
pub struct Completion<T, E> {
    slot: Mutex<Slot<T, E>>,
}

impl<T, E> Completion<T, E> {
    /// Create a pending completion and the receiver its result is delivered to
    pub fn new() -> (Self, oneshot::Receiver<Result<T, E>>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                slot: Mutex::new(Slot::Pending(sender)),
            },
            receiver,
        )
    }

    /// Resolve and deliver the result
    pub fn resolve(&self, result: Result<T, E>) -> bool {
        self.resolve_with(result, || {})
    }

    /// Resolve, run `before_delivery`, then deliver the result
    ///
    /// `before_delivery` only runs for the winning resolution, and it runs
    /// before the receiver can observe the result.
    pub fn resolve_with<F>(&self, result: Result<T, E>, before_delivery: F) -> bool
    where
        F: FnOnce(),
    {
        let outcome = if result.is_ok() {
            ResultState::Succeeded
        } else {
            ResultState::Failed
        };

        let sender = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Resolved(outcome)) {
                Slot::Pending(sender) => sender,
                resolved => {
                    *slot = resolved;
                    return false;
                }
            }
        };

        before_delivery();
        // Receiver may be gone if the caller stopped waiting
        let _ = sender.send(result);
        true
    }

    pub fn state(&self) -> ResultState {
        match &*self.slot.lock() {
            Slot::Pending(_) => ResultState::Pending,
            Slot::Resolved(state) => *state,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != ResultState::Pending
    }
}

// ============================================================================
// TIMER
// ============================================================================

/// Single-shot timer backed by a tokio task
///
/// Must be scheduled from within a tokio runtime. Cancelling or dropping the
/// handle aborts the pending task.
pub struct TimerHandle {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerHandle {
    /// Run `on_fire` once after `after` has elapsed
    pub fn schedule<F>(after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire();
        });
        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Whether the timer still holds a task that has not finished
    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// BOUNDED LOCK
// ============================================================================

/// What a [`BoundedLock`] waiter does once the ceiling has passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockTimeoutPolicy {
    /// Stop waiting and proceed without a permit (liveness over exclusion)
    #[default]
    ForceRelease,
    /// Stop waiting and report [`LockTimeout`]
    Fail,
}

/// A lock wait exceeded its ceiling
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Lock wait exceeded ceiling of {0:?}")]
pub struct LockTimeout(pub Duration);

/// Counting lock with a bounded wait
///
/// A waiter that cannot get a permit before the ceiling either proceeds
/// without one ([`LockTimeoutPolicy::ForceRelease`]) or fails with
/// [`LockTimeout`]. A stuck holder therefore delays other callers by at most
/// the ceiling instead of deadlocking them.
#[derive(Debug, Clone)]
pub struct BoundedLock {
    semaphore: Arc<Semaphore>,
    ceiling: Duration,
    policy: LockTimeoutPolicy,
}

/// Permit held for the duration of a locked operation
#[derive(Debug)]
pub struct BoundedLockGuard {
    permit: Option<OwnedSemaphorePermit>,
}

impl BoundedLockGuard {
    /// The wait hit the ceiling and the caller proceeded without a permit
    pub fn is_forced(&self) -> bool {
        self.permit.is_none()
    }
}

impl BoundedLock {
    /// Permits above `Semaphore::MAX_PERMITS` are capped to it
    pub fn new(permits: usize, ceiling: Duration, policy: LockTimeoutPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.min(Semaphore::MAX_PERMITS))),
            ceiling,
            policy,
        }
    }

    /// Single-permit lock with the default ceiling and force-release policy
    pub fn new_default() -> Self {
        Self::new(1, DEFAULT_LOCK_CEILING, LockTimeoutPolicy::ForceRelease)
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn policy(&self) -> LockTimeoutPolicy {
        self.policy
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit, at most for the ceiling
    pub async fn acquire(&self) -> Result<BoundedLockGuard, LockTimeout> {
        let waited =
            tokio::time::timeout(self.ceiling, self.semaphore.clone().acquire_owned()).await;

        match waited {
            Ok(Ok(permit)) => {
                debug!("Lock acquired ({} permits left)", self.available_permits());
                Ok(BoundedLockGuard {
                    permit: Some(permit),
                })
            }
            // Semaphore is never closed; a closed one cannot be waited on anyway
            Ok(Err(_)) | Err(_) => match self.policy {
                LockTimeoutPolicy::ForceRelease => {
                    warn!(
                        "Lock wait exceeded {:?}, proceeding without exclusion",
                        self.ceiling
                    );
                    Ok(BoundedLockGuard { permit: None })
                }
                LockTimeoutPolicy::Fail => {
                    warn!("Lock wait exceeded {:?}", self.ceiling);
                    Err(LockTimeout(self.ceiling))
                }
            },
        }
    }

    /// Run `operation` while holding a permit
    pub async fn run<F, T>(&self, operation: F) -> Result<T, LockTimeout>
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire().await?;
        Ok(operation.await)
    }
}
