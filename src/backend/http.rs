//! [`DocumentBackend`] over HTTP with `reqwest`.
//!
//! Backend routes live under [`PipelineConfig::api_base_url`] and carry the
//! bearer token. Signed URLs (upload and download) point at object storage
//! and are called without it, with their own, longer timeout.

use super::types::{
    ConvertingRequest, ErrorBody, FileProcessedRequest, FileProcessedResponse,
    OperationStatusRequest, OperationStatusResponse, SignedUrlRequest, SignedUrlResponse,
    TaskResultResponse, TaskStatusResponse,
};
use super::calls::*;
use super::DocumentBackend;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the backend API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    api: Client,
    storage: Client,
    config: PipelineConfig,
}

impl HttpBackend {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let api = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {e}")))?;
        let storage = Client::builder()
            .timeout(Duration::from_secs(config.upload_timeout_secs))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            api,
            storage,
            config: config.clone(),
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.config.access_token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// `{base}/task/{task_id}[/{suffix}]` with the id percent-encoded.
    fn task_url(&self, task_id: &str, suffix: Option<&str>) -> Result<Url, PipelineError> {
        let mut url = Url::parse(&self.config.endpoint("task"))
            .map_err(|e| PipelineError::InvalidConfig(format!("API base URL: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| PipelineError::InvalidConfig("API base URL cannot be a base".into()))?;
            segments.push(task_id);
            if let Some(s) = suffix {
                segments.push(s);
            }
        }
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        call: &'static str,
        req: RequestBuilder,
    ) -> Result<T, PipelineError> {
        let response = send(call, self.authed(req)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PipelineError::protocol(call, e.to_string()))
    }
}

/// Send a request and turn non-2xx answers into [`PipelineError::Transport`].
async fn send(call: &'static str, req: RequestBuilder) -> Result<Response, PipelineError> {
    let response = req.send().await.map_err(|e| transport_error(call, e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::Transport {
        call,
        status: Some(status.as_u16()),
        detail: error_detail(&body, status.canonical_reason().unwrap_or("request failed")),
    })
}

fn transport_error(call: &'static str, e: reqwest::Error) -> PipelineError {
    let detail = if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("could not connect: {e}")
    } else {
        e.to_string()
    };
    PipelineError::Transport {
        call,
        status: e.status().map(|s| s.as_u16()),
        detail,
    }
}

/// Pull the message out of a FastAPI `{"detail": …}` body, else use the raw
/// text (or `fallback` when empty).
fn error_detail(body: &str, fallback: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.message();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.chars().take(300).collect()
    }
}

#[async_trait]
impl DocumentBackend for HttpBackend {
    async fn request_upload_target(
        &self,
        file_name: &str,
        content_type: &str,
    ) -> Result<SignedUrlResponse, PipelineError> {
        let body = SignedUrlRequest {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
        };
        let req = self.api.post(self.config.endpoint("document/upload")).json(&body);
        self.send_json(CALL_UPLOAD_TARGET, req).await
    }

    async fn transfer_bytes(
        &self,
        signed_url: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PipelineError> {
        debug!("PUT {} bytes to signed URL", bytes.len());
        let req = self
            .storage
            .put(signed_url)
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes);
        send(CALL_TRANSFER, req).await.map(|_| ())
    }

    async fn register_for_processing(
        &self,
        file_key: &str,
        file_name: &str,
    ) -> Result<FileProcessedResponse, PipelineError> {
        let body = FileProcessedRequest {
            file_key: file_key.to_string(),
            file_name: file_name.to_string(),
        };
        let req = self.api.post(self.config.endpoint("document/process")).json(&body);
        self.send_json(CALL_REGISTER, req).await
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, PipelineError> {
        let url = self.task_url(task_id, Some("status"))?;
        self.send_json(CALL_TASK_STATUS, self.api.get(url)).await
    }

    async fn task_result(&self, task_id: &str) -> Result<TaskResultResponse, PipelineError> {
        let url = self.task_url(task_id, Some("result"))?;
        self.send_json(CALL_TASK_RESULT, self.api.get(url)).await
    }

    async fn operation_status(
        &self,
        operation_name: &str,
    ) -> Result<OperationStatusResponse, PipelineError> {
        let body = OperationStatusRequest {
            operation_name: operation_name.to_string(),
        };
        let req = self.api.post(self.config.endpoint("document/operation")).json(&body);
        self.send_json(CALL_OPERATION, req).await
    }

    async fn issue_conversion(
        &self,
        file_key: &str,
    ) -> Result<FileProcessedResponse, PipelineError> {
        let body = ConvertingRequest {
            file_key: file_key.to_string(),
        };
        let req = self.api.post(self.config.endpoint("document/convert")).json(&body);
        self.send_json(CALL_CONVERT, req).await
    }

    async fn resolve_download(
        &self,
        download_path: &str,
    ) -> Result<SignedUrlResponse, PipelineError> {
        let req = self
            .api
            .get(self.config.endpoint("document/download"))
            .query(&[("gcs_download_path", download_path)]);
        self.send_json(CALL_DOWNLOAD, req).await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), PipelineError> {
        let url = self.task_url(task_id, None)?;
        send(CALL_CANCEL, self.authed(self.api.delete(url)))
            .await
            .map(|_| ())
    }

    async fn fetch_bytes(&self, signed_url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = send(CALL_FETCH, self.storage.get(signed_url)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(CALL_FETCH, e))?;
        Ok(bytes.to_vec())
    }
}
