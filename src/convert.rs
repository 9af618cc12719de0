//! One-shot entry points: PDF in, workbook link (or file) out.
//!
//! These wrap a [`PipelineOrchestrator`] over an [`HttpBackend`] for callers
//! that just want the result. Use the orchestrator directly when you need to
//! reset, observe or supersede sessions.

use crate::backend::{DocumentBackend, HttpBackend};
use crate::config::PipelineConfig;
use crate::download::{resolve_download, save_artifact, DownloadLink};
use crate::error::{ErrorKind, PipelineError};
use crate::pipeline::input::load_input;
use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::progress::ObserverHandle;
use crate::state::{PipelineState, Stage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Result of one conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutput {
    /// Terminal snapshot: Completed, or Failed with `error` set.
    pub state: PipelineState,
    /// Signed link to the workbook; `None` unless Completed.
    pub download: Option<DownloadLink>,
    pub elapsed_ms: u64,
}

impl ConversionOutput {
    pub fn is_success(&self) -> bool {
        self.state.stage == Stage::Completed
    }
}

/// Convert a local PDF to an Excel workbook.
///
/// # Returns
/// `Ok(ConversionOutput)` once the session is terminal, even if it Failed
/// (check [`ConversionOutput::is_success`]).
///
/// # Errors
/// Returns `Err(PipelineError)` only when no session could run:
/// - File not found / not a PDF
/// - Invalid configuration
/// - The download link for a Completed session could not be resolved
pub async fn convert(
    path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    let backend: Arc<dyn DocumentBackend> = Arc::new(HttpBackend::new(config)?);
    convert_with_backend(path, backend, config, None).await
}

/// [`convert`] against any backend, with an optional observer.
pub async fn convert_with_backend(
    path: impl AsRef<Path>,
    backend: Arc<dyn DocumentBackend>,
    config: &PipelineConfig,
    observer: Option<ObserverHandle>,
) -> Result<ConversionOutput, PipelineError> {
    let started = Instant::now();
    let input = load_input(path).await?;

    let mut orchestrator = PipelineOrchestrator::new(Arc::clone(&backend), config.clone());
    if let Some(observer) = observer {
        orchestrator = orchestrator.with_observer(observer);
    }
    let state = orchestrator.run(input).await?;

    let download = match state.result_ref.as_deref() {
        Some(result_ref) if state.stage == Stage::Completed => {
            Some(resolve_download(backend.as_ref(), result_ref).await?)
        }
        _ => None,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!("Conversion finished as {} in {}ms", state.stage, elapsed_ms);
    Ok(ConversionOutput {
        state,
        download,
        elapsed_ms,
    })
}

/// Convert a PDF and write the workbook to `output`.
///
/// When `output` is a directory the backend's file name is used inside it.
/// Fails with the session's error if it did not complete.
pub async fn convert_to_file(
    path: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<(PathBuf, u64), PipelineError> {
    let backend: Arc<dyn DocumentBackend> = Arc::new(HttpBackend::new(config)?);
    let result = convert_with_backend(path, Arc::clone(&backend), config, None).await?;
    save_output(backend.as_ref(), &result, output.as_ref()).await
}

/// Write the workbook of a finished conversion. Returns the path written
/// and the number of bytes.
pub async fn save_output(
    backend: &dyn DocumentBackend,
    result: &ConversionOutput,
    output: &Path,
) -> Result<(PathBuf, u64), PipelineError> {
    let link = match &result.download {
        Some(link) => link,
        None => {
            let state = &result.state;
            return Err(PipelineError::SessionFailed {
                kind: state.error_kind.unwrap_or(ErrorKind::Internal),
                detail: state
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("session ended in {}", state.stage)),
            });
        }
    };
    let dest = if output.is_dir() {
        output.join(&link.file_name)
    } else {
        output.to_path_buf()
    };
    let written = save_artifact(backend, link, &dest).await?;
    Ok((dest, written))
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(path, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptedBackend, TaskStatus};
    use std::io::Write;

    fn fast_config() -> PipelineConfig {
        PipelineConfig::builder()
            .task_poll_interval_ms(10)
            .operation_poll_interval_ms(10)
            .convert_poll_interval_ms(10)
            .build()
            .unwrap()
    }

    fn pdf_file() -> tempfile::NamedTempFile {
        let mut tmp = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        tmp.write_all(b"%PDF-1.7 bom").unwrap();
        tmp
    }

    #[tokio::test(start_paused = true)]
    async fn completed_run_resolves_download() {
        let pdf = pdf_file();
        let backend = Arc::new(ScriptedBackend::new().download_path("bucket/download/k/bom.xlsx"));

        let out = convert_with_backend(pdf.path(), backend, &fast_config(), None)
            .await
            .unwrap();

        assert!(out.is_success());
        assert_eq!(out.download.unwrap().file_name, "bom.xlsx");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_has_no_download() {
        let pdf = pdf_file();
        let backend = Arc::new(ScriptedBackend::new().convert_statuses([TaskStatus::Failure]));

        let out = convert_with_backend(pdf.path(), backend.clone(), &fast_config(), None)
            .await
            .unwrap();

        assert!(!out.is_success());
        assert!(out.download.is_none());
        let dir = tempfile::tempdir().unwrap();
        let err = save_output(backend.as_ref(), &out, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("Conversion failed on the server"));
        assert_eq!(err.kind(), ErrorKind::RemoteFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transfer_keeps_transport_kind() {
        let pdf = pdf_file();
        let backend = Arc::new(
            ScriptedBackend::new().fail_on(crate::backend::calls::CALL_TRANSFER, "expired"),
        );
        let out = convert_with_backend(pdf.path(), backend.clone(), &fast_config(), None)
            .await
            .unwrap();
        assert_eq!(out.state.error_kind, Some(ErrorKind::Transport));

        let dir = tempfile::tempdir().unwrap();
        let err = save_output(backend.as_ref(), &out, dir.path()).await.unwrap_err();

        assert!(matches!(err, PipelineError::SessionFailed { .. }));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test(start_paused = true)]
    async fn save_output_into_directory() {
        let pdf = pdf_file();
        let backend =
            Arc::new(ScriptedBackend::new().download_path("bucket/download/k/parts.xlsx"));
        let out = convert_with_backend(pdf.path(), backend.clone(), &fast_config(), None)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (written_to, _) = save_output(backend.as_ref(), &out, dir.path()).await.unwrap();

        assert_eq!(written_to, dir.path().join("parts.xlsx"));
        assert!(written_to.exists());
    }
}
