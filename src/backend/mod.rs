//! Collaborator calls the pipeline consumes.
//!
//! [`DocumentBackend`] is the seam between the orchestration engine and the
//! outside world: every remote call a stage makes goes through it. The
//! production implementation is [`HttpBackend`]; tests swap in a scripted
//! in-memory backend.
//!
//! ## Call map
//!
//! ```text
//! request_upload_target ─▶ transfer_bytes ─▶ register_for_processing
//!        ▶ task_status / task_result  (recognition task)
//!        ▶ operation_status           (long-running operation)
//!        ▶ issue_conversion
//!        ▶ task_status / task_result  (conversion task)
//!        ▶ resolve_download ─▶ fetch_bytes
//! ```

pub mod http;
pub mod memory;
pub mod types;

pub use http::HttpBackend;
pub use memory::{Call, ScriptedBackend};
pub use types::{
    FileProcessedResponse, OperationStatusResponse, SignedUrlResponse, TaskResultResponse,
    TaskStatus, TaskStatusResponse,
};

use crate::error::PipelineError;
use async_trait::async_trait;

/// Names of the remote calls, as they appear in transport/protocol errors.
pub mod calls {
    pub const CALL_UPLOAD_TARGET: &str = "request upload target";
    pub const CALL_TRANSFER: &str = "transfer bytes";
    pub const CALL_REGISTER: &str = "register for processing";
    pub const CALL_TASK_STATUS: &str = "task status";
    pub const CALL_TASK_RESULT: &str = "task result";
    pub const CALL_OPERATION: &str = "operation status";
    pub const CALL_CONVERT: &str = "issue conversion";
    pub const CALL_DOWNLOAD: &str = "resolve download";
    pub const CALL_CANCEL: &str = "cancel task";
    pub const CALL_FETCH: &str = "fetch artifact";
}

/// The remote API behind the pipeline.
///
/// Every method is a single round trip; none of them retry. Implementations
/// return [`PipelineError::Transport`] for network/HTTP failures and
/// [`PipelineError::Protocol`] for bodies that don't parse.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Ask for a signed URL to upload `file_name` to.
    async fn request_upload_target(
        &self,
        file_name: &str,
        content_type: &str,
    ) -> Result<SignedUrlResponse, PipelineError>;

    /// `PUT` the document bytes to a signed URL.
    async fn transfer_bytes(
        &self,
        signed_url: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PipelineError>;

    /// Tell the backend an upload finished; returns the recognition task.
    async fn register_for_processing(
        &self,
        file_key: &str,
        file_name: &str,
    ) -> Result<FileProcessedResponse, PipelineError>;

    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, PipelineError>;

    async fn task_result(&self, task_id: &str) -> Result<TaskResultResponse, PipelineError>;

    async fn operation_status(
        &self,
        operation_name: &str,
    ) -> Result<OperationStatusResponse, PipelineError>;

    /// Queue the workbook conversion; returns a second task.
    async fn issue_conversion(&self, file_key: &str)
        -> Result<FileProcessedResponse, PipelineError>;

    /// Turn a stored download path into a signed download URL.
    async fn resolve_download(&self, download_path: &str)
        -> Result<SignedUrlResponse, PipelineError>;

    /// Revoke a queued or running task. Best effort.
    async fn cancel_task(&self, task_id: &str) -> Result<(), PipelineError>;

    /// `GET` the bytes behind a signed URL.
    async fn fetch_bytes(&self, signed_url: &str) -> Result<Vec<u8>, PipelineError>;
}
