//! Error types for the bom2xlsx library.
//!
//! A single [`PipelineError`] covers every failure the pipeline can see, and
//! [`ErrorKind`] sorts them into the buckets callers actually branch on:
//!
//! * **UserInput** — the document was rejected before a session started
//!   (missing file, not a PDF). These never enter the stage machine.
//! * **Transport** — a remote call or the byte transfer failed at the HTTP
//!   level.
//! * **RemoteFailure** — the backend explicitly reported that a task failed.
//! * **Protocol** — a response arrived but a required field was missing or
//!   malformed.
//!
//! Everything observed inside a running stage collapses the orchestrator into
//! `Failed` with the error's `Display` string as the message.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the bom2xlsx library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The path exists but could not be read as a file (e.g. a directory).
    #[error("Cannot read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is readable but not a type the backend accepts.
    #[error(
        "Unsupported document '{name}': only PDF files are accepted (first bytes: {magic:?})"
    )]
    UnsupportedType { name: String, magic: Vec<u8> },

    /// The document has no content.
    #[error("Document '{name}' is empty")]
    EmptyFile { name: String },

    // ── Remote errors ─────────────────────────────────────────────────────
    /// Network or HTTP failure on a remote call.
    #[error("{call} failed{}: {detail}", http_suffix(.status))]
    Transport {
        call: &'static str,
        status: Option<u16>,
        detail: String,
    },

    /// The backend reported that a stage failed.
    #[error("{stage} failed on the server: {detail}")]
    RemoteFailure { stage: &'static str, detail: String },

    /// A response was missing a field the next stage needs.
    #[error("Unexpected response from {call}: {detail}")]
    Protocol { call: &'static str, detail: String },

    /// A poll loop stayed pending past its configured limit.
    #[error("Gave up waiting for '{target}' after {secs}s")]
    PollTimeout { target: String, secs: u64 },

    /// A finished session has no workbook to save. `kind` is the
    /// classification of the error that ended it.
    #[error("Conversion did not complete: {detail}")]
    SessionFailed { kind: ErrorKind, detail: String },

    /// The session was reset or superseded while this work was in flight.
    #[error("Session cancelled")]
    Cancelled,

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the downloaded workbook.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserInput,
    Transport,
    RemoteFailure,
    Protocol,
    Timeout,
    Cancelled,
    Internal,
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::FileNotFound { .. }
            | PipelineError::PermissionDenied { .. }
            | PipelineError::Unreadable { .. }
            | PipelineError::UnsupportedType { .. }
            | PipelineError::EmptyFile { .. } => ErrorKind::UserInput,
            PipelineError::Transport { .. } => ErrorKind::Transport,
            PipelineError::RemoteFailure { .. } => ErrorKind::RemoteFailure,
            PipelineError::Protocol { .. } => ErrorKind::Protocol,
            PipelineError::PollTimeout { .. } => ErrorKind::Timeout,
            PipelineError::SessionFailed { kind, .. } => *kind,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::InvalidConfig(_)
            | PipelineError::OutputWriteFailed { .. }
            | PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for errors detected before a session starts.
    pub fn is_user_input(&self) -> bool {
        self.kind() == ErrorKind::UserInput
    }

    pub fn transport(call: &'static str, detail: impl Into<String>) -> Self {
        PipelineError::Transport {
            call,
            status: None,
            detail: detail.into(),
        }
    }

    pub fn protocol(call: &'static str, detail: impl Into<String>) -> Self {
        PipelineError::Protocol {
            call,
            detail: detail.into(),
        }
    }
}
