//! Streaming API: observe a session as a `Stream` of snapshots.
//!
//! An alternative to implementing [`crate::PipelineObserver`]. The stream is
//! backed by the orchestrator's watch channel, so a slow consumer skips
//! intermediate snapshots instead of buffering them; the latest state is
//! never lost.
//!
//! ```rust,no_run
//! use bom2xlsx::{load_input, state_stream, HttpBackend, PipelineConfig, PipelineOrchestrator};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let backend = Arc::new(HttpBackend::new(&config)?);
//! let orchestrator = PipelineOrchestrator::new(backend, config);
//!
//! let mut states = state_stream(&orchestrator);
//! orchestrator.start(load_input("bom.pdf").await?)?;
//! while let Some(state) = states.next().await {
//!     println!("{:>3}% {}", state.progress, state.message);
//! }
//! # Ok(())
//! # }
//! ```

use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::state::PipelineState;
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

/// A boxed stream of state snapshots.
pub type StateStream = Pin<Box<dyn Stream<Item = PipelineState> + Send>>;

/// Every snapshot the orchestrator publishes from now on, starting with the
/// current one. Never ends while the orchestrator is alive.
pub fn state_stream(orchestrator: &PipelineOrchestrator) -> StateStream {
    Box::pin(WatchStream::new(orchestrator.subscribe()))
}

/// Like [`state_stream`], but ends after the first Completed or Failed
/// snapshot, which is yielded.
pub fn session_stream(orchestrator: &PipelineOrchestrator) -> StateStream {
    let mut done = false;
    let s = WatchStream::new(orchestrator.subscribe()).take_while(move |state| {
        let keep = !done;
        done = state.is_terminal();
        futures::future::ready(keep)
    });
    Box::pin(s)
}
