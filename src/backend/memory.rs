//! An in-memory [`DocumentBackend`] driven by a script.
//!
//! Useful for tests and demos: every call is recorded, task statuses and
//! operation flags are replayed from queues, and any call can be made to fail
//! or to hang forever.
//!
//! Task ids encode their role: `/document/process` hands out `process-N`,
//! `/document/convert` hands out `convert-N`. Status queues are per role, so
//! one script serves any number of sessions.
//!
//! ```rust
//! use bom2xlsx::backend::{ScriptedBackend, TaskStatus};
//!
//! let backend = ScriptedBackend::new()
//!     .process_statuses([TaskStatus::Pending, TaskStatus::Success])
//!     .operation_flags([false, true])
//!     .download_path("bucket/download/k/output.xlsx");
//! assert!(backend.calls().is_empty());
//! ```

use super::calls::*;
use super::types::{
    FileProcessedResponse, OperationStatusResponse, SignedUrlResponse, TaskResultResponse,
    TaskStatus, TaskStatusResponse,
};
use super::DocumentBackend;
use crate::error::PipelineError;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    UploadTarget { file_name: String, content_type: String },
    Transfer { signed_url: String, content_type: String, len: usize },
    Register { file_key: String, file_name: String },
    TaskStatus(String),
    TaskResult(String),
    Operation(String),
    Convert(String),
    ResolveDownload(String),
    CancelTask(String),
    Fetch(String),
}

#[derive(Debug)]
struct Script {
    process_statuses: VecDeque<TaskStatus>,
    convert_statuses: VecDeque<TaskStatus>,
    operation_flags: VecDeque<bool>,
    process_result: Option<serde_json::Value>,
    convert_result: Option<serde_json::Value>,
    download_path: String,
    artifact: Vec<u8>,
    failures: HashMap<&'static str, String>,
    hangs: HashSet<&'static str>,
    latency: Option<Duration>,
    sessions: u64,
    registered: u64,
    conversions: u64,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            process_statuses: VecDeque::from([TaskStatus::Success]),
            convert_statuses: VecDeque::from([TaskStatus::Success]),
            operation_flags: VecDeque::from([true]),
            process_result: None,
            convert_result: None,
            download_path: "bom-bucket/download/file-key/output.xlsx".to_string(),
            artifact: b"PK\x03\x04 workbook".to_vec(),
            failures: HashMap::new(),
            hangs: HashSet::new(),
            latency: None,
            sessions: 0,
            registered: 0,
            conversions: 0,
        }
    }
}

/// Replays a queue, repeating its last element once only one is left.
fn next_scripted<T: Copy>(queue: &mut VecDeque<T>, fallback: T) -> T {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or(fallback)
    } else {
        queue.front().copied().unwrap_or(fallback)
    }
}

/// Scripted backend; see the module docs.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    /// A backend on which every stage succeeds at its first check.
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(self, f: impl FnOnce(&mut Script)) -> Self {
        f(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner));
        self
    }

    /// Statuses returned for recognition tasks (`process-N`).
    pub fn process_statuses(self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.edit(|s| s.process_statuses = statuses.into_iter().collect())
    }

    /// Statuses returned for conversion tasks (`convert-N`).
    pub fn convert_statuses(self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.edit(|s| s.convert_statuses = statuses.into_iter().collect())
    }

    /// `done` flags returned by the operation poll.
    pub fn operation_flags(self, flags: impl IntoIterator<Item = bool>) -> Self {
        self.edit(|s| s.operation_flags = flags.into_iter().collect())
    }

    /// Override the recognition task's result payload.
    pub fn process_result(self, result: serde_json::Value) -> Self {
        self.edit(|s| s.process_result = Some(result))
    }

    /// Override the conversion task's result payload.
    pub fn convert_result(self, result: serde_json::Value) -> Self {
        self.edit(|s| s.convert_result = Some(result))
    }

    /// `gcs_download_path` reported by the conversion task.
    pub fn download_path(self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.edit(|s| s.download_path = path)
    }

    /// Bytes served by [`DocumentBackend::fetch_bytes`].
    pub fn artifact(self, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        self.edit(|s| s.artifact = bytes)
    }

    /// Make `call` (one of [`super::calls`]) fail with an HTTP 500.
    pub fn fail_on(self, call: &'static str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.edit(|s| {
            s.failures.insert(call, detail);
        })
    }

    /// Make `call` never return.
    pub fn hang_on(self, call: &'static str) -> Self {
        self.edit(|s| {
            s.hangs.insert(call);
        })
    }

    /// Delay every call by `latency`.
    pub fn latency(self, latency: Duration) -> Self {
        self.edit(|s| s.latency = Some(latency))
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// Record `call` and apply the failure/hang/latency script for `name`.
    async fn enter(&self, name: &'static str, call: Call) -> Result<(), PipelineError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        let (failure, hang, latency) = {
            let s = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            (s.failures.get(name).cloned(), s.hangs.contains(name), s.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        match failure {
            Some(detail) => Err(PipelineError::Transport {
                call: name,
                status: Some(500),
                detail,
            }),
            None => Ok(()),
        }
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl DocumentBackend for ScriptedBackend {
    async fn request_upload_target(
        &self,
        file_name: &str,
        content_type: &str,
    ) -> Result<SignedUrlResponse, PipelineError> {
        self.enter(
            CALL_UPLOAD_TARGET,
            Call::UploadTarget {
                file_name: file_name.to_string(),
                content_type: content_type.to_string(),
            },
        )
        .await?;
        let n = self.with_script(|s| {
            s.sessions += 1;
            s.sessions
        });
        Ok(SignedUrlResponse {
            signed_url: format!("https://storage.test/upload/{n}/{file_name}"),
            file_key: Some(format!("file-key-{n}")),
            file_name: Some(file_name.to_string()),
        })
    }

    async fn transfer_bytes(
        &self,
        signed_url: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PipelineError> {
        self.enter(
            CALL_TRANSFER,
            Call::Transfer {
                signed_url: signed_url.to_string(),
                content_type: content_type.to_string(),
                len: bytes.len(),
            },
        )
        .await
    }

    async fn register_for_processing(
        &self,
        file_key: &str,
        file_name: &str,
    ) -> Result<FileProcessedResponse, PipelineError> {
        self.enter(
            CALL_REGISTER,
            Call::Register {
                file_key: file_key.to_string(),
                file_name: file_name.to_string(),
            },
        )
        .await?;
        let n = self.with_script(|s| {
            s.registered += 1;
            s.registered
        });
        Ok(FileProcessedResponse {
            message: "queued".to_string(),
            task_id: format!("process-{n}"),
            file_key: Some(file_key.to_string()),
        })
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, PipelineError> {
        self.enter(CALL_TASK_STATUS, Call::TaskStatus(task_id.to_string()))
            .await?;
        let status = self.with_script(|s| {
            if task_id.starts_with("convert-") {
                next_scripted(&mut s.convert_statuses, TaskStatus::Success)
            } else {
                next_scripted(&mut s.process_statuses, TaskStatus::Success)
            }
        });
        Ok(TaskStatusResponse { status })
    }

    async fn task_result(&self, task_id: &str) -> Result<TaskResultResponse, PipelineError> {
        self.enter(CALL_TASK_RESULT, Call::TaskResult(task_id.to_string()))
            .await?;
        let result = self.with_script(|s| {
            if task_id.starts_with("convert-") {
                s.convert_result.clone().unwrap_or_else(|| {
                    json!({ "status": "SUCCESS", "gcs_download_path": s.download_path })
                })
            } else {
                s.process_result.clone().unwrap_or_else(|| {
                    json!({
                        "status": "processing_started",
                        "operation_name": format!("projects/p/locations/us/operations/{task_id}"),
                    })
                })
            }
        });
        Ok(TaskResultResponse { result })
    }

    async fn operation_status(
        &self,
        operation_name: &str,
    ) -> Result<OperationStatusResponse, PipelineError> {
        self.enter(CALL_OPERATION, Call::Operation(operation_name.to_string()))
            .await?;
        let done = self.with_script(|s| next_scripted(&mut s.operation_flags, true));
        Ok(OperationStatusResponse { done })
    }

    async fn issue_conversion(
        &self,
        file_key: &str,
    ) -> Result<FileProcessedResponse, PipelineError> {
        self.enter(CALL_CONVERT, Call::Convert(file_key.to_string()))
            .await?;
        let n = self.with_script(|s| {
            s.conversions += 1;
            s.conversions
        });
        Ok(FileProcessedResponse {
            message: "queued".to_string(),
            task_id: format!("convert-{n}"),
            file_key: Some(file_key.to_string()),
        })
    }

    async fn resolve_download(
        &self,
        download_path: &str,
    ) -> Result<SignedUrlResponse, PipelineError> {
        self.enter(CALL_DOWNLOAD, Call::ResolveDownload(download_path.to_string()))
            .await?;
        let file_name = download_path.rsplit('/').next().unwrap_or("output.xlsx");
        Ok(SignedUrlResponse {
            signed_url: format!("https://storage.test/download/{download_path}"),
            file_key: None,
            file_name: Some(file_name.to_string()),
        })
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), PipelineError> {
        self.enter(CALL_CANCEL, Call::CancelTask(task_id.to_string()))
            .await
    }

    async fn fetch_bytes(&self, signed_url: &str) -> Result<Vec<u8>, PipelineError> {
        self.enter(CALL_FETCH, Call::Fetch(signed_url.to_string()))
            .await?;
        Ok(self.with_script(|s| s.artifact.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_queue_repeats_last() {
        let b = ScriptedBackend::new()
            .process_statuses([TaskStatus::Pending, TaskStatus::Started, TaskStatus::Success]);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(b.task_status("process-1").await.unwrap().status);
        }
        assert_eq!(
            seen,
            vec![
                TaskStatus::Pending,
                TaskStatus::Started,
                TaskStatus::Success,
                TaskStatus::Success,
                TaskStatus::Success
            ]
        );
        assert_eq!(b.count(|c| matches!(c, Call::TaskStatus(_))), 5);
    }

    #[tokio::test]
    async fn roles_use_separate_queues() {
        let b = ScriptedBackend::new()
            .process_statuses([TaskStatus::Success])
            .convert_statuses([TaskStatus::Failure]);
        assert_eq!(b.task_status("process-1").await.unwrap().status, TaskStatus::Success);
        assert_eq!(b.task_status("convert-1").await.unwrap().status, TaskStatus::Failure);
    }

    #[tokio::test]
    async fn failures_are_transport_errors() {
        let b = ScriptedBackend::new().fail_on(CALL_REGISTER, "queue unavailable");
        let err = b.register_for_processing("k", "bom.pdf").await.unwrap_err();
        assert!(matches!(err, PipelineError::Transport { status: Some(500), .. }));
        assert_eq!(b.calls().len(), 1);
    }

    #[tokio::test]
    async fn ids_are_per_session() {
        let b = ScriptedBackend::new();
        let first = b.request_upload_target("a.pdf", "application/pdf").await.unwrap();
        let second = b.request_upload_target("a.pdf", "application/pdf").await.unwrap();
        assert_ne!(first.file_key, second.file_key);
        let t1 = b.register_for_processing("k", "a.pdf").await.unwrap().task_id;
        let t2 = b.issue_conversion("k").await.unwrap().task_id;
        assert_eq!(t1, "process-1");
        assert_eq!(t2, "convert-1");
    }
}
