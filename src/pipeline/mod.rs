//! The orchestration engine.
//!
//! Each submodule is one layer. Lower layers know nothing about the ones
//! above them, so the poll loop is testable with a fake clock alone and the
//! stage runners with a scripted backend alone.
//!
//! ## Layers
//!
//! ```text
//! orchestrator ──▶ stage ──▶ poll
//!  (sessions,      (direct    (fixed cadence,
//!   state)          / polled)  cancellation)
//! ```
//!
//! 1. [`input`] — load and validate the PDF before a session exists
//! 2. [`poll`] — [`poll::PollLoop`] and the [`poll::PollHandle`] it hands
//!    out; one interval per loop, released on terminal outcome or cancel
//! 3. [`stage`] — normalise one stage into `Ok` / `Err` / in-progress
//!    reports, mapping the backend's status vocabulary onto poll outcomes
//! 4. [`orchestrator`] — sequence the stages, own [`crate::PipelineState`],
//!    guarantee one active session

pub mod input;
pub mod orchestrator;
pub mod poll;
pub mod stage;
