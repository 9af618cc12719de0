//! The pipeline orchestrator: one session at a time, stages in fixed order.
//!
//! ```text
//!  start(input)
//!    │ validate (user-input errors never enter the machine)
//!    │ reset if a session exists
//!    ▼
//!  Uploading ── upload target (10%) ── transfer bytes
//!    ▼
//!  Processing (30%) ── register (50%) ── poll recognition task (60–70%)
//!    ▼
//!  AwaitingOperation ── poll operation until done (75–80%)
//!    ▼
//!  Converting ── issue conversion (85%) ── poll conversion task (90%)
//!    ▼
//!  Completed (100%, result_ref set)
//!
//!  any stage error ─▶ Failed (error set)        reset() ─▶ Idle
//! ```
//!
//! The driver for a session is a spawned task that composes the stages with
//! `?`. Every state write goes through [`PipelineOrchestrator`]'s update path,
//! which drops writes from sessions that are no longer current and rejects
//! transitions the stage table does not allow.

use super::input::DocumentInput;
use super::poll::PollRegistry;
use super::stage::{InProgress, StageRunner};
use crate::backend::calls::CALL_UPLOAD_TARGET;
use crate::backend::DocumentBackend;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::progress::{NoopObserver, ObserverHandle};
use crate::state::{checkpoint, PipelineState, SessionId, Stage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives upload → recognition → conversion for one document at a time.
///
/// Cheap to clone; clones share the same session and state.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn DocumentBackend>,
    config: PipelineConfig,
    observer: RwLock<ObserverHandle>,
    /// Held across every mutate-and-notify so observers see events in order.
    notify: Mutex<()>,
    shared: Mutex<Shared>,
    watch: watch::Sender<PipelineState>,
    polls: Arc<PollRegistry>,
}

#[derive(Default)]
struct Shared {
    state: PipelineState,
    session: Option<Session>,
    next_id: SessionId,
}

struct Session {
    id: SessionId,
    token: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("state", &self.snapshot())
            .field("active_polls", &self.active_polls())
            .finish()
    }
}

impl PipelineOrchestrator {
    pub fn new(backend: Arc<dyn DocumentBackend>, config: PipelineConfig) -> Self {
        let (watch, _) = watch::channel(PipelineState::default());
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                observer: RwLock::new(Arc::new(NoopObserver)),
                notify: Mutex::new(()),
                shared: Mutex::new(Shared::default()),
                watch,
                polls: PollRegistry::new(),
            }),
        }
    }

    /// Replace the observer. Applies to every clone of this orchestrator.
    pub fn with_observer(self, observer: ObserverHandle) -> Self {
        *self
            .inner
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = observer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// The current state.
    pub fn snapshot(&self) -> PipelineState {
        lock(&self.inner.shared).state.clone()
    }

    /// A receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.inner.watch.subscribe()
    }

    /// Number of poll handles that are live right now (0 or 1).
    pub fn active_polls(&self) -> usize {
        self.inner.polls.live()
    }

    /// Start a session for `input` and return its id.
    ///
    /// Invalid input or configuration is rejected before any state changes.
    /// A session that is still running, or a terminal state, is reset first.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, input: DocumentInput) -> Result<SessionId, PipelineError> {
        input.validate()?;
        self.inner.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::Internal(format!("no tokio runtime: {e}")))?;

        let _order = lock(&self.inner.notify);
        if let Some(idle) = self.teardown() {
            self.publish(&idle);
        }

        let (id, snapshot) = {
            let mut shared = lock(&self.inner.shared);
            shared.next_id += 1;
            let id = shared.next_id;
            let token = CancellationToken::new();
            shared.state = PipelineState {
                stage: Stage::Uploading,
                message: "Requesting upload target".to_string(),
                progress: checkpoint::UPLOAD_TARGET,
                session: Some(id),
                ..PipelineState::default()
            };

            info!("Session {} started for '{}' ({} bytes)", id, input.file_name, input.bytes.len());
            let driver = runtime.spawn(self.clone().drive(id, token.clone(), input));
            shared.session = Some(Session {
                id,
                token,
                driver: Some(driver),
            });
            (id, shared.state.clone())
        };

        self.observer().on_session_start(id);
        self.publish(&snapshot);
        Ok(id)
    }

    /// Start a session and wait for it to reach Completed or Failed.
    ///
    /// A Failed session is an `Ok` snapshot carrying the error. `Err` means
    /// the input was rejected or the session was superseded by a reset or
    /// another `start`.
    pub async fn run(&self, input: DocumentInput) -> Result<PipelineState, PipelineError> {
        let id = self.start(input)?;
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|s| s.session != Some(id) || s.is_terminal())
            .await
            .map_err(|_| PipelineError::Internal("state channel closed".into()))?
            .clone();
        if state.session == Some(id) && state.is_terminal() {
            Ok(state)
        } else {
            warn!("Session {} was superseded before finishing", id);
            Err(PipelineError::Cancelled)
        }
    }

    /// Wait until no session is running and return that snapshot.
    pub async fn wait_for_terminal(&self) -> PipelineState {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|s| !s.stage.is_active()).await.map(|s| s.clone());
        result.unwrap_or_else(|_| self.snapshot())
    }

    /// Cancel the current session and return to Idle.
    ///
    /// Synchronous: once this returns, every poll handle is cancelled and no
    /// further state change from the old session can be published. Idempotent.
    pub fn reset(&self) {
        let _order = lock(&self.inner.notify);
        if let Some(idle) = self.teardown() {
            self.publish(&idle);
        }
    }

    /// Cancel the session and restore the default state. Caller holds the
    /// notification lock. Returns the new snapshot if anything changed.
    fn teardown(&self) -> Option<PipelineState> {
        let mut shared = lock(&self.inner.shared);
        if let Some(session) = shared.session.take() {
            session.token.cancel();
            if let Some(driver) = session.driver {
                driver.abort();
            }
            if shared.state.stage.is_active() {
                warn!("Session {} cancelled during {}", session.id, shared.state.stage);
            } else {
                debug!("Session {} cleared", session.id);
            }
        }
        self.inner.polls.cancel_all();

        if shared.state == PipelineState::default() {
            return None;
        }
        shared.state = PipelineState::default();
        Some(shared.state.clone())
    }

    fn observer(&self) -> ObserverHandle {
        Arc::clone(
            &self
                .inner
                .observer
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Hand a snapshot to the watch channel and the observer. Caller holds
    /// the notification lock.
    fn publish(&self, state: &PipelineState) {
        self.inner.watch.send_replace(state.clone());
        let observer = self.observer();
        observer.on_state_change(state);
        if state.is_terminal() {
            observer.on_session_end(state);
        }
    }

    /// Apply `f` to the state on behalf of session `id`.
    ///
    /// Returns [`PipelineError::Cancelled`] if the session is no longer
    /// current, and [`PipelineError::Internal`] if `f` attempts a transition
    /// the stage table forbids. Progress never goes backwards.
    fn update(
        &self,
        id: SessionId,
        pending: Option<&InProgress>,
        f: impl FnOnce(&mut PipelineState),
    ) -> Result<(), PipelineError> {
        let _order = lock(&self.inner.notify);
        let snapshot = {
            let mut shared = lock(&self.inner.shared);
            let current = shared.session.as_ref().map(|s| s.id);
            if current != Some(id) {
                debug!("Dropping update from stale session {}", id);
                return Err(PipelineError::Cancelled);
            }

            let before = shared.state.stage;
            let mut next = shared.state.clone();
            f(&mut next);
            if !before.can_transition_to(next.stage) {
                return Err(PipelineError::Internal(format!(
                    "illegal transition {before:?} -> {:?}",
                    next.stage
                )));
            }
            if next.stage != Stage::Failed {
                next.progress = next.progress.max(shared.state.progress);
            }
            if next.stage != before {
                info!("Session {}: {} -> {} ({}%)", id, before, next.stage, next.progress);
            }
            shared.state = next;
            shared.state.clone()
        };

        if let Some(p) = pending {
            self.observer().on_poll_pending(p.stage, &p.target, p.attempt);
        }
        self.publish(&snapshot);
        Ok(())
    }

    fn report(&self, id: SessionId, progress: InProgress) {
        let _ = self.update(id, Some(&progress), |s| {
            s.progress = progress.percent;
            s.message = progress.message.clone();
        });
    }

    async fn drive(self, id: SessionId, token: CancellationToken, input: DocumentInput) {
        let runner = StageRunner::new(
            Arc::clone(&self.inner.backend),
            token,
            Arc::clone(&self.inner.polls),
        )
        .poll_timeout(self.inner.config.poll_timeout());

        match self.run_stages(id, &runner, input).await {
            Ok(()) => {}
            Err(PipelineError::Cancelled) => debug!("Session {} stopped", id),
            Err(e) => {
                warn!("Session {} failed: {}", id, e);
                let _ = self.update(id, None, |s| {
                    s.message = format!("{} failed", s.stage.label());
                    s.stage = Stage::Failed;
                    s.error = Some(e.to_string());
                    s.error_kind = Some(e.kind());
                    s.task_ref = None;
                });
            }
        }
    }

    async fn run_stages(
        &self,
        id: SessionId,
        runner: &StageRunner,
        input: DocumentInput,
    ) -> Result<(), PipelineError> {
        let backend = &self.inner.backend;
        let config = &self.inner.config;
        let DocumentInput {
            file_name,
            content_type,
            bytes,
        } = input;

        // 1. Upload target
        let target = runner
            .direct(backend.request_upload_target(&file_name, &content_type))
            .await?;
        let file_key = target.file_key.clone().ok_or_else(|| {
            PipelineError::protocol(CALL_UPLOAD_TARGET, "response has no file_key")
        })?;
        let stored_name = target.file_name.clone().unwrap_or_else(|| file_name.clone());
        self.update(id, None, |s| {
            s.artifact_ref = Some(file_key.clone());
            s.message = format!("Uploading {file_name}");
        })?;

        // 2. Transfer
        runner
            .direct(backend.transfer_bytes(&target.signed_url, &content_type, bytes))
            .await?;
        self.update(id, None, |s| {
            s.stage = Stage::Processing;
            s.progress = checkpoint::BYTES_TRANSFERRED;
            s.message = "Upload complete, registering document".to_string();
        })?;

        // 3. Register
        let registered = runner
            .direct(backend.register_for_processing(&file_key, &stored_name))
            .await?;
        self.update(id, None, |s| {
            s.progress = checkpoint::REGISTERED;
            s.task_ref = Some(registered.task_id.clone());
            s.message = "Document queued for recognition".to_string();
        })?;

        // 4. Recognition task
        let recognised = runner
            .poll_task(
                Stage::Processing,
                &registered.task_id,
                config.task_poll_interval(),
                |p| self.report(id, p),
            )
            .await?;
        let operation = recognised.operation_name()?;
        self.update(id, None, |s| {
            s.stage = Stage::AwaitingOperation;
            s.progress = checkpoint::OPERATION_PENDING_FIRST;
            s.task_ref = Some(operation.clone());
            s.message = "Recognising text".to_string();
        })?;

        // 5. Long-running operation
        runner
            .poll_operation(&operation, config.operation_poll_interval(), |p| {
                self.report(id, p)
            })
            .await?;
        self.update(id, None, |s| {
            s.stage = Stage::Converting;
            s.progress = checkpoint::CONVERSION_ISSUED;
            s.task_ref = None;
            s.message = "Requesting spreadsheet conversion".to_string();
        })?;

        // 6. Issue conversion
        let conversion = runner.direct(backend.issue_conversion(&file_key)).await?;
        self.update(id, None, |s| {
            s.task_ref = Some(conversion.task_id.clone());
            s.message = "Converting to spreadsheet".to_string();
        })?;

        // 7. Conversion task
        let converted = runner
            .poll_task(
                Stage::Converting,
                &conversion.task_id,
                config.convert_poll_interval(),
                |p| self.report(id, p),
            )
            .await?;
        let download_path = converted.download_path()?;
        self.update(id, None, |s| {
            s.stage = Stage::Completed;
            s.progress = checkpoint::COMPLETE;
            s.task_ref = None;
            s.result_ref = Some(download_path.clone());
            s.message = "Conversion complete".to_string();
        })?;

        info!("Session {} completed: {}", id, download_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Call, ScriptedBackend, TaskStatus};
    use crate::progress::PipelineObserver;
    use std::time::Duration;

    fn pdf() -> DocumentInput {
        DocumentInput::from_bytes("bom.pdf", b"%PDF-1.7 test".to_vec()).unwrap()
    }

    fn orchestrator(backend: &Arc<ScriptedBackend>) -> PipelineOrchestrator {
        let config = PipelineConfig::builder()
            .task_poll_interval_ms(1_000)
            .operation_poll_interval_ms(1_000)
            .convert_poll_interval_ms(1_000)
            .build()
            .unwrap();
        PipelineOrchestrator::new(backend.clone(), config)
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<PipelineState>>,
        pending: Mutex<Vec<(Stage, u32)>>,
        ends: Mutex<usize>,
    }

    impl PipelineObserver for Recorder {
        fn on_state_change(&self, state: &PipelineState) {
            self.states.lock().unwrap().push(state.clone());
        }
        fn on_poll_pending(&self, stage: Stage, _target: &str, attempt: u32) {
            self.pending.lock().unwrap().push((stage, attempt));
        }
        fn on_session_end(&self, _state: &PipelineState) {
            *self.ends.lock().unwrap() += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_reaches_completed() {
        let backend = Arc::new(ScriptedBackend::new().download_path("X"));
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(&backend).with_observer(recorder.clone());

        let state = orch.run(pdf()).await.unwrap();

        assert_eq!(state.stage, Stage::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.result_ref.as_deref(), Some("X"));
        assert_eq!(state.artifact_ref.as_deref(), Some("file-key-1"));
        assert!(state.error.is_none());
        assert_eq!(*recorder.ends.lock().unwrap(), 1);

        let states = recorder.states.lock().unwrap();
        let mut last = 0;
        for s in states.iter() {
            assert!(s.is_consistent(), "{s:?}");
            assert!(s.progress >= last);
            last = s.progress;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_ticks_reach_the_observer() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .process_statuses([TaskStatus::Pending, TaskStatus::Retry, TaskStatus::Success])
                .operation_flags([false, true]),
        );
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(&backend).with_observer(recorder.clone());

        orch.run(pdf()).await.unwrap();

        assert_eq!(
            *recorder.pending.lock().unwrap(),
            vec![
                (Stage::Processing, 1),
                (Stage::Processing, 2),
                (Stage::AwaitingOperation, 1)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_operation_name_is_protocol_failure() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .process_result(serde_json::json!({ "status": "processing_started" })),
        );
        let orch = orchestrator(&backend);

        let state = orch.run(pdf()).await.unwrap();

        assert_eq!(state.stage, Stage::Failed);
        assert_eq!(state.message, "Recognition task failed");
        assert!(state.error.unwrap().contains("operation_name"));
        assert_eq!(backend.count(|c| matches!(c, Call::Operation(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_input_leaves_state_untouched() {
        let backend = Arc::new(ScriptedBackend::new());
        let orch = orchestrator(&backend);
        let bad = DocumentInput {
            file_name: "bom.png".into(),
            content_type: "image/png".into(),
            bytes: b"\x89PNG".to_vec(),
        };

        let err = orch.start(bad).unwrap_err();

        assert!(err.is_user_input());
        assert_eq!(orch.snapshot(), PipelineState::default());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_rejected_before_the_session_starts() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut config = PipelineConfig::default();
        config.task_poll_interval_ms = 0;
        let orch = PipelineOrchestrator::new(backend.clone(), config);

        let err = orch.run(pdf()).await.unwrap_err();

        assert!(matches!(err, PipelineError::InvalidConfig(_)), "{err}");
        assert_eq!(orch.snapshot(), PipelineState::default());
        assert!(backend.calls().is_empty());
        assert_eq!(orch.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_fails_the_session() {
        let backend = Arc::new(ScriptedBackend::new().operation_flags([false]));
        let config = PipelineConfig::builder()
            .task_poll_interval_ms(1_000)
            .operation_poll_interval_ms(1_000)
            .poll_timeout_secs(Some(10))
            .build()
            .unwrap();
        let orch = PipelineOrchestrator::new(backend.clone(), config);

        let state = orch.run(pdf()).await.unwrap();

        assert_eq!(state.stage, Stage::Failed);
        assert!(state.error.unwrap().starts_with("Gave up waiting"));
        assert_eq!(orch.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_is_idempotent() {
        let backend =
            Arc::new(ScriptedBackend::new().hang_on(crate::backend::calls::CALL_TRANSFER));
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(&backend).with_observer(recorder.clone());

        orch.start(pdf()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch.reset();
        orch.reset();

        assert_eq!(orch.snapshot(), PipelineState::default());
        let states = recorder.states.lock().unwrap();
        assert_eq!(states.iter().filter(|s| s.stage == Stage::Idle).count(), 1);
    }
}
