//! Observer trait for pipeline state transitions.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::PipelineOrchestrator::with_observer`] to receive every snapshot
//! the orchestrator publishes. Observers only ever see clones; they cannot
//! reach back into orchestrator state.
//!
//! # Example
//!
//! ```rust
//! use bom2xlsx::{PipelineObserver, PipelineState};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingObserver {
//!     updates: AtomicUsize,
//! }
//!
//! impl PipelineObserver for CountingObserver {
//!     fn on_state_change(&self, state: &PipelineState) {
//!         self.updates.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{:>3}% {}", state.progress, state.message);
//!     }
//! }
//!
//! let observer = Arc::new(CountingObserver { updates: AtomicUsize::new(0) });
//! observer.on_state_change(&PipelineState::default());
//! assert_eq!(observer.updates.load(Ordering::SeqCst), 1);
//! ```

use crate::state::{PipelineState, SessionId, Stage};
use std::sync::Arc;

/// Called by the orchestrator as a session moves through its stages.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Re-entrancy
///
/// Callbacks run while the orchestrator holds its notification lock, which
/// keeps events strictly ordered. Reading [`crate::PipelineOrchestrator::snapshot`]
/// from a callback is fine; calling `start` or `reset` from one deadlocks.
pub trait PipelineObserver: Send + Sync {
    /// Called once when a new session leaves Idle.
    fn on_session_start(&self, session: SessionId) {
        let _ = session;
    }

    /// Called for every published snapshot, including progress-only updates
    /// and the Idle snapshot produced by a reset.
    fn on_state_change(&self, state: &PipelineState) {
        let _ = state;
    }

    /// Called on every pending poll tick.
    ///
    /// # Arguments
    /// * `stage`   — stage that owns the poll
    /// * `target`  — task id or operation name being polled
    /// * `attempt` — 1-indexed check count for this poll loop
    fn on_poll_pending(&self, stage: Stage, target: &str, attempt: u32) {
        let _ = (stage, target, attempt);
    }

    /// Called once when a session reaches Completed or Failed.
    fn on_session_end(&self, state: &PipelineState) {
        let _ = state;
    }
}

/// A no-op observer for callers that don't need events.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias for the type stored by the orchestrator.
pub type ObserverHandle = Arc<dyn PipelineObserver>;
