//! Request and response bodies of the backend API.
//!
//! Field names are the wire contract and must not be renamed.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrlRequest {
    pub file_name: String,
    pub content_type: String,
}

/// Returned for both upload targets and download links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrlResponse {
    pub signed_url: String,
    #[serde(default)]
    pub file_key: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProcessedRequest {
    pub file_key: String,
    pub file_name: String,
}

/// Response of both `/document/process` and `/document/convert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProcessedResponse {
    #[serde(default)]
    pub message: String,
    pub task_id: String,
    #[serde(default)]
    pub file_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertingRequest {
    pub file_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatusRequest {
    pub operation_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatusResponse {
    pub done: bool,
}

/// Status vocabulary of a backend task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Retry,
    Failure,
    Success,
    /// Anything the client doesn't recognise; treated like Pending.
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_success(self) -> bool {
        self == TaskStatus::Success
    }

    pub fn is_failure(self) -> bool {
        self == TaskStatus::Failure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub status: TaskStatus,
}

/// Raw task result; its shape depends on which task produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultResponse {
    #[serde(default)]
    pub result: serde_json::Value,
}

impl TaskResultResponse {
    /// Extract a required string field from the result payload.
    pub fn field(&self, name: &str, call: &'static str) -> Result<String, PipelineError> {
        match self.result.get(name) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(other) if !other.is_null() => Err(PipelineError::protocol(
                call,
                format!("field '{name}' is not a non-empty string: {other}"),
            )),
            _ => Err(PipelineError::protocol(
                call,
                format!("result has no '{name}'"),
            )),
        }
    }

    /// `operation_name` produced by the recognition task.
    pub fn operation_name(&self) -> Result<String, PipelineError> {
        self.field("operation_name", "recognition task result")
    }

    /// `gcs_download_path` produced by the conversion task.
    pub fn download_path(&self) -> Result<String, PipelineError> {
        self.field("gcs_download_path", "conversion task result")
    }
}

/// FastAPI error body: `{"detail": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub detail: serde_json::Value,
}

impl ErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
