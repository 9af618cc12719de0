//! Cancellable fixed-cadence polling.
//!
//! A [`PollLoop`] describes the cadence; [`PollLoop::start`] hands out a
//! [`PollHandle`] that owns one cancellation token and, while
//! [`PollHandle::run`] is awaited, one `tokio::time::Interval`. The interval
//! lives inside the `run` future, so it is released the moment the loop
//! returns, whether on a terminal outcome or on cancellation.
//!
//! ```text
//! start ──(interval)──▶ check ──Pending──▶ on_pending ──(interval)──▶ check …
//!                         │
//!                         ├─ Success(v) ─▶ cancel self, return Success(v)
//!                         ├─ Failure(e) ─▶ cancel self, return Failure(e)
//!                         └─ Err(e)     ─▶ same as Failure(e), no retry
//! cancel() at any point ─▶ return Cancelled; an in-flight check is dropped
//! ```
//!
//! Handle tokens are children of the session token, so cancelling a session
//! cancels every handle it started. A [`PollRegistry`] counts live handles
//! and refuses to start a second one while another is still live.

use crate::error::PipelineError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Result of one check invocation.
#[derive(Debug)]
pub enum PollOutcome<T> {
    Pending,
    Success(T),
    Failure(PipelineError),
}

/// How a poll loop ended.
#[derive(Debug)]
pub enum PollTerminal<T> {
    Success(T),
    Failure(PipelineError),
    /// The handle (or its session) was cancelled before a terminal outcome.
    Cancelled,
}

impl<T> PollTerminal<T> {
    /// Collapse into a `Result`, mapping cancellation to
    /// [`PipelineError::Cancelled`].
    pub fn into_result(self) -> Result<T, PipelineError> {
        match self {
            PollTerminal::Success(v) => Ok(v),
            PollTerminal::Failure(e) => Err(e),
            PollTerminal::Cancelled => Err(PipelineError::Cancelled),
        }
    }
}

/// Cadence of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLoop {
    interval: Duration,
    timeout: Option<Duration>,
}

/// Shortest cadence a loop will tick at; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl PollLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            timeout: None,
        }
    }

    /// Turn a loop that stays pending longer than `timeout` into a
    /// [`PipelineError::PollTimeout`] failure. `None` polls forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Create the handle for one loop against `target`.
    ///
    /// The handle's token is a child of `parent`. Fails if `registry` already
    /// holds a live handle.
    pub fn start(
        &self,
        target: impl Into<String>,
        parent: &CancellationToken,
        registry: &Arc<PollRegistry>,
    ) -> Result<PollHandle, PipelineError> {
        let target = target.into();
        let token = parent.child_token();
        let id = registry.register(&target, token.clone())?;
        debug!("Poll handle {} started for '{}' every {:?}", id, target, self.interval);
        Ok(PollHandle {
            id,
            target,
            interval: self.interval,
            timeout: self.timeout,
            token,
            registry: Arc::clone(registry),
        })
    }
}

/// One in-flight poll loop. Cancelled on drop.
#[derive(Debug)]
pub struct PollHandle {
    id: u64,
    target: String,
    interval: Duration,
    timeout: Option<Duration>,
    token: CancellationToken,
    registry: Arc<PollRegistry>,
}

impl PollHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop future invocations. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// False once the handle or its session has been cancelled.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Invoke `check` every interval until it reports a terminal outcome or
    /// the handle is cancelled.
    ///
    /// The first check runs one full interval after the call, not
    /// immediately. `on_pending` receives the 1-indexed attempt number of
    /// each pending check.
    pub async fn run<T, F, Fut, P>(&self, mut check: F, mut on_pending: P) -> PollTerminal<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollOutcome<T>, PipelineError>>,
        P: FnMut(u32),
    {
        let started = Instant::now();
        let mut ticker = time::interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return PollTerminal::Cancelled,
                _ = ticker.tick() => {}
            }

            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    self.cancel();
                    return PollTerminal::Failure(PipelineError::PollTimeout {
                        target: self.target.clone(),
                        secs: limit.as_secs(),
                    });
                }
            }

            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => return PollTerminal::Cancelled,
                outcome = check() => outcome,
            };

            // A result that lands after cancellation belongs to nobody.
            if !self.is_current() {
                return PollTerminal::Cancelled;
            }

            match outcome {
                Ok(PollOutcome::Pending) => {
                    trace!("'{}' pending (attempt {})", self.target, attempt);
                    on_pending(attempt);
                }
                Ok(PollOutcome::Success(value)) => {
                    self.cancel();
                    debug!("'{}' succeeded after {} checks", self.target, attempt);
                    return PollTerminal::Success(value);
                }
                Ok(PollOutcome::Failure(e)) | Err(e) => {
                    self.cancel();
                    debug!("'{}' failed after {} checks: {}", self.target, attempt, e);
                    return PollTerminal::Failure(e);
                }
            }
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.token.cancel();
        self.registry.release(self.id);
    }
}

/// Bookkeeping of the poll handles an orchestrator has handed out.
#[derive(Debug, Default)]
pub struct PollRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    handles: HashMap<u64, (String, CancellationToken)>,
}

impl PollRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of handles that exist and have not been cancelled.
    pub fn live(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .handles
            .values()
            .filter(|(_, token)| !token.is_cancelled())
            .count()
    }

    /// Targets of the live handles, for diagnostics.
    pub fn live_targets(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .handles
            .values()
            .filter(|(_, token)| !token.is_cancelled())
            .map(|(target, _)| target.clone())
            .collect()
    }

    /// Cancel every registered handle.
    pub fn cancel_all(&self) {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, token) in inner.handles.values() {
            token.cancel();
        }
    }

    fn register(&self, target: &str, token: CancellationToken) -> Result<u64, PipelineError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((live, _)) = inner.handles.values().find(|(_, t)| !t.is_cancelled()) {
            return Err(PipelineError::Internal(format!(
                "cannot poll '{target}' while '{live}' is still being polled"
            )));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handles.insert(id, (target.to_string(), token));
        Ok(id)
    }

    fn release(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.handles.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TICK: Duration = Duration::from_millis(1_000);

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn first_check_waits_one_interval() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let handle = PollLoop::new(TICK).start("task-1", &session, &registry).unwrap();
        let calls = counter();

        let c = Arc::clone(&calls);
        let task = tokio::spawn(async move {
            handle
                .run(
                    || {
                        c.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, PipelineError>(PollOutcome::<()>::Pending) }
                    },
                    |_| {},
                )
                .await
        });

        time::sleep(TICK - Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        session.cancel();
        assert!(matches!(task.await.unwrap(), PollTerminal::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_ticks_at_the_minimum() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let poll = PollLoop::new(Duration::ZERO);
        assert_eq!(poll.interval(), Duration::from_millis(1));

        let handle = poll.start("task-1", &session, &registry).unwrap();
        let result = handle
            .run(
                || async { Ok::<_, PipelineError>(PollOutcome::Success(7u8)) },
                |_| {},
            )
            .await;

        assert!(matches!(result, PollTerminal::Success(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_outcome_stops_invocations() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let handle = PollLoop::new(TICK).start("task-1", &session, &registry).unwrap();
        let calls = counter();
        let pendings = counter();

        let c = Arc::clone(&calls);
        let p = Arc::clone(&pendings);
        let result = handle
            .run(
                || {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        Ok::<_, PipelineError>(if n < 3 {
                            PollOutcome::Pending
                        } else {
                            PollOutcome::Success(n)
                        })
                    }
                },
                |_| {
                    p.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert!(matches!(result, PollTerminal::Success(3)));
        assert!(!handle.is_current());
        assert_eq!(registry.live(), 0);

        time::sleep(TICK * 10).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pendings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_is_immediately_terminal() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let handle = PollLoop::new(TICK).start("ops/1", &session, &registry).unwrap();
        let calls = counter();

        let c = Arc::clone(&calls);
        let result = handle
            .run(
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async {
                        let e = PipelineError::transport("operation status", "reset by peer");
                        Err::<PollOutcome<()>, _>(e)
                    }
                },
                |_| {},
            )
            .await;

        match result {
            PollTerminal::Failure(PipelineError::Transport { detail, .. }) => {
                assert_eq!(detail, "reset by peer")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_next_tick_stops_everything() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let handle = PollLoop::new(TICK).start("task-1", &session, &registry).unwrap();
        let calls = counter();
        let pendings = counter();

        let c = Arc::clone(&calls);
        let p = Arc::clone(&pendings);
        let task = tokio::spawn(async move {
            handle
                .run(
                    || {
                        c.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, PipelineError>(PollOutcome::<()>::Pending) }
                    },
                    |_| {
                        p.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await
        });

        time::sleep(TICK + TICK / 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        session.cancel();
        assert_eq!(registry.live(), 0);

        time::sleep(TICK * 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pendings.load(Ordering::SeqCst), 1);
        assert!(matches!(task.await.unwrap(), PollTerminal::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_result_is_discarded_after_cancel() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let handle = PollLoop::new(TICK).start("task-1", &session, &registry).unwrap();
        let resolved = counter();

        let r = Arc::clone(&resolved);
        let task = tokio::spawn(async move {
            handle
                .run(
                    || {
                        let r = Arc::clone(&r);
                        async move {
                            time::sleep(Duration::from_millis(500)).await;
                            r.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, PipelineError>(PollOutcome::Success("late"))
                        }
                    },
                    |_| {},
                )
                .await
        });

        // The check starts at 1000 ms and would resolve at 1500 ms.
        time::sleep(TICK + Duration::from_millis(200)).await;
        session.cancel();
        time::sleep(TICK).await;

        assert!(matches!(task.await.unwrap(), PollTerminal::Cancelled));
        assert_eq!(resolved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_converts_pending_into_failure() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let handle = PollLoop::new(TICK)
            .timeout(Some(Duration::from_secs(5)))
            .start("ops/slow", &session, &registry)
            .unwrap();
        let calls = counter();

        let c = Arc::clone(&calls);
        let result = handle
            .run(
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, PipelineError>(PollOutcome::<()>::Pending) }
                },
                |_| {},
            )
            .await;

        match result {
            PollTerminal::Failure(PipelineError::PollTimeout { target, secs }) => {
                assert_eq!(target, "ops/slow");
                assert_eq!(secs, 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn registry_allows_one_live_handle() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let poll = PollLoop::new(TICK);

        let first = poll.start("task-1", &session, &registry).unwrap();
        assert_eq!(registry.live(), 1);
        let err = poll.start("task-2", &session, &registry).unwrap_err();
        assert!(err.to_string().contains("task-1"), "got: {err}");

        first.cancel();
        first.cancel();
        assert_eq!(registry.live(), 0);
        let second = poll.start("task-2", &session, &registry).unwrap();
        assert_eq!(registry.live_targets(), vec!["task-2".to_string()]);

        drop(second);
        drop(first);
        assert_eq!(registry.live(), 0);
        assert!(registry.inner.lock().unwrap().handles.is_empty());
    }

    #[test]
    fn session_cancel_reaches_handles() {
        let registry = PollRegistry::new();
        let session = CancellationToken::new();
        let handle = PollLoop::new(TICK).start("task-1", &session, &registry).unwrap();
        session.cancel();
        assert!(!handle.is_current());
        assert_eq!(registry.live(), 0);
    }

    #[tokio::test]
    async fn into_result_maps_cancel() {
        let t: PollTerminal<u8> = PollTerminal::Cancelled;
        tokio_test::assert_err!(t.into_result());
        tokio_test::assert_ok!(PollTerminal::Success(1u8).into_result());
    }
}
