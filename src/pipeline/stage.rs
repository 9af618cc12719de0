//! Stage runners: one remote call, or one call followed by a poll loop.
//!
//! A [`StageRunner`] is bound to one session. Everything it starts hangs off
//! the session's cancellation token, so a reset stops direct calls and poll
//! loops alike.
//!
//! ```text
//! direct(call)                     call ─▶ Ok(output) | Err(reason)
//! poll_task(stage, id, …)          task_status ─▶ PENDING/STARTED/RETRY ─▶ InProgress
//!                                              ─▶ SUCCESS ─▶ task_result ─▶ Ok(payload)
//!                                              ─▶ FAILURE ─▶ Err(RemoteFailure)
//! poll_operation(name, …)          operation_status ─▶ done=false ─▶ InProgress
//!                                                   ─▶ done=true  ─▶ Ok(())
//! ```

use super::poll::{PollLoop, PollOutcome, PollRegistry};
use crate::backend::{DocumentBackend, TaskResultResponse};
use crate::error::PipelineError;
use crate::state::{checkpoint, Stage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Advisory report for one pending check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InProgress {
    pub stage: Stage,
    /// Task id or operation name.
    pub target: String,
    pub attempt: u32,
    pub percent: u8,
    pub message: String,
}

/// Runs the stages of one session.
pub struct StageRunner {
    backend: Arc<dyn DocumentBackend>,
    session: CancellationToken,
    registry: Arc<PollRegistry>,
    poll_timeout: Option<Duration>,
}

impl StageRunner {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        session: CancellationToken,
        registry: Arc<PollRegistry>,
    ) -> Self {
        Self {
            backend,
            session,
            registry,
            poll_timeout: None,
        }
    }

    /// Fail poll loops that stay pending longer than `timeout`.
    pub fn poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Await one remote call, abandoning it if the session is cancelled.
    pub async fn direct<T, Fut>(&self, call: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let result = tokio::select! {
            biased;
            _ = self.session.cancelled() => return Err(PipelineError::Cancelled),
            result = call => result,
        };
        if self.session.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        result
    }

    /// Poll a backend task until it reports SUCCESS or FAILURE.
    ///
    /// On SUCCESS the task result is fetched within the same check, so the
    /// stage output is the result payload.
    pub async fn poll_task<P>(
        &self,
        stage: Stage,
        task_id: &str,
        interval: Duration,
        mut on_progress: P,
    ) -> Result<TaskResultResponse, PipelineError>
    where
        P: FnMut(InProgress),
    {
        let (first, last) = pending_band(stage);
        let handle = PollLoop::new(interval)
            .timeout(self.poll_timeout)
            .start(task_id, &self.session, &self.registry)?;

        let backend: &dyn DocumentBackend = self.backend.as_ref();
        handle
            .run(
                move || check_task(backend, stage, task_id),
                |attempt| {
                    on_progress(InProgress {
                        stage,
                        target: task_id.to_string(),
                        attempt,
                        percent: checkpoint::pending(first, last, attempt),
                        message: format!("{} still running (check {attempt})", stage.label()),
                    })
                },
            )
            .await
            .into_result()
    }

    /// Poll a long-running operation until `done` is true.
    ///
    /// `done` is the only signal: an operation that errors is reported by the
    /// backend as an HTTP failure, which surfaces here as a transport error.
    pub async fn poll_operation<P>(
        &self,
        operation_name: &str,
        interval: Duration,
        mut on_progress: P,
    ) -> Result<(), PipelineError>
    where
        P: FnMut(InProgress),
    {
        let stage = Stage::AwaitingOperation;
        let (first, last) = pending_band(stage);
        let handle = PollLoop::new(interval)
            .timeout(self.poll_timeout)
            .start(operation_name, &self.session, &self.registry)?;

        let backend: &dyn DocumentBackend = self.backend.as_ref();
        handle
            .run(
                move || check_operation(backend, operation_name),
                |attempt| {
                    on_progress(InProgress {
                        stage,
                        target: operation_name.to_string(),
                        attempt,
                        percent: checkpoint::pending(first, last, attempt),
                        message: format!("Waiting for text recognition (check {attempt})"),
                    })
                },
            )
            .await
            .into_result()
    }
}

/// Progress band used while a stage's poll is pending.
fn pending_band(stage: Stage) -> (u8, u8) {
    use checkpoint::*;
    match stage {
        Stage::AwaitingOperation => (OPERATION_PENDING_FIRST, OPERATION_PENDING_LAST),
        Stage::Converting => (CONVERSION_PENDING, CONVERSION_PENDING),
        _ => (TASK_PENDING_FIRST, TASK_PENDING_LAST),
    }
}

async fn check_task(
    backend: &dyn DocumentBackend,
    stage: Stage,
    task_id: &str,
) -> Result<PollOutcome<TaskResultResponse>, PipelineError> {
    let status = backend.task_status(task_id).await?.status;
    debug!("Task {} status: {:?}", task_id, status);
    if status.is_success() {
        let result = backend.task_result(task_id).await?;
        return Ok(PollOutcome::Success(result));
    }
    if status.is_failure() {
        return Ok(PollOutcome::Failure(PipelineError::RemoteFailure {
            stage: stage.label(),
            detail: format!("task {task_id} reported FAILURE"),
        }));
    }
    Ok(PollOutcome::Pending)
}

async fn check_operation(
    backend: &dyn DocumentBackend,
    operation_name: &str,
) -> Result<PollOutcome<()>, PipelineError> {
    let done = backend.operation_status(operation_name).await?.done;
    debug!("Operation {} done: {}", operation_name, done);
    Ok(if done {
        PollOutcome::Success(())
    } else {
        PollOutcome::Pending
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::calls::*;
    use crate::backend::{Call, ScriptedBackend, TaskStatus};

    const TICK: Duration = Duration::from_secs(3);

    fn runner(
        backend: &Arc<ScriptedBackend>,
    ) -> (StageRunner, CancellationToken, Arc<PollRegistry>) {
        let session = CancellationToken::new();
        let registry = PollRegistry::new();
        let runner = StageRunner::new(backend.clone(), session.clone(), Arc::clone(&registry));
        (runner, session, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn task_success_fetches_result() {
        let backend = Arc::new(ScriptedBackend::new().process_statuses([
            TaskStatus::Pending,
            TaskStatus::Started,
            TaskStatus::Success,
        ]));
        let (runner, _session, registry) = runner(&backend);
        let mut reports = Vec::new();

        let result = runner
            .poll_task(Stage::Processing, "process-1", TICK, |p| reports.push(p))
            .await
            .unwrap();

        assert!(result.operation_name().unwrap().ends_with("process-1"));
        assert_eq!(
            reports.iter().map(|p| p.percent).collect::<Vec<_>>(),
            vec![60, 61]
        );
        assert_eq!(reports[0].target, "process-1");
        assert_eq!(backend.count(|c| matches!(c, Call::TaskStatus(_))), 3);
        assert_eq!(backend.count(|c| matches!(c, Call::TaskResult(_))), 1);
        assert_eq!(registry.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_failure_is_remote_failure() {
        let backend = Arc::new(ScriptedBackend::new().convert_statuses([TaskStatus::Failure]));
        let (runner, _session, _registry) = runner(&backend);

        let err = runner
            .poll_task(Stage::Converting, "convert-1", TICK, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::RemoteFailure { stage: "Conversion", .. }));
        assert_eq!(backend.count(|c| matches!(c, Call::TaskResult(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_differs_from_remote_failure() {
        let backend = Arc::new(ScriptedBackend::new().fail_on(CALL_TASK_STATUS, "gateway down"));
        let (runner, _session, _registry) = runner(&backend);

        let err = runner
            .poll_task(Stage::Processing, "process-1", TICK, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Transport { .. }));
        assert!(err.to_string().contains("gateway down"));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_done_after_pending_ticks() {
        let backend = Arc::new(ScriptedBackend::new().operation_flags([false, false, true]));
        let (runner, _session, _registry) = runner(&backend);
        let mut percents = Vec::new();

        runner
            .poll_operation("operations/7", Duration::from_secs(5), |p| percents.push(p.percent))
            .await
            .unwrap();

        assert_eq!(percents, vec![75, 76]);
        assert_eq!(backend.count(|c| matches!(c, Call::Operation(_))), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_call_is_abandoned_on_cancel() {
        let backend = Arc::new(ScriptedBackend::new().hang_on(CALL_CONVERT));
        let (runner, session, _registry) = runner(&backend);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            session.cancel();
        });
        let err = runner
            .direct(backend.issue_conversion("file-key-1"))
            .await
            .unwrap_err();
        cancel.await.unwrap();

        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn direct_rejection_is_returned() {
        let backend =
            Arc::new(ScriptedBackend::new().fail_on(CALL_UPLOAD_TARGET, "bucket missing"));
        let (runner, _session, _registry) = runner(&backend);
        let err = runner
            .direct(backend.request_upload_target("bom.pdf", "application/pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport { status: Some(500), .. }));
    }
}
