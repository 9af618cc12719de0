//! Fetching the finished workbook.
//!
//! A Completed session only carries the stored path of the workbook
//! (`result_ref`). [`resolve_download`] turns that into a signed link and
//! [`save_artifact`] writes the bytes behind it to disk.

use crate::backend::DocumentBackend;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A signed, time-limited link to the finished workbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    pub signed_url: String,
    pub file_name: String,
}

/// Ask the backend for a signed link to `result_ref`.
///
/// The backend normally reports the file name; if it doesn't, the last
/// segment of the stored path is used.
pub async fn resolve_download(
    backend: &dyn DocumentBackend,
    result_ref: &str,
) -> Result<DownloadLink, PipelineError> {
    let response = backend.resolve_download(result_ref).await?;
    let file_name = response
        .file_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| fallback_name(result_ref));
    debug!("Resolved download for {} as {}", result_ref, file_name);
    Ok(DownloadLink {
        signed_url: response.signed_url,
        file_name,
    })
}

fn fallback_name(result_ref: &str) -> String {
    result_ref
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("output.xlsx")
        .to_string()
}

/// Fetch the workbook behind `link` and write it to `dest`.
///
/// Uses atomic write (temp file + rename) so `dest` is never left
/// half-written. Returns the number of bytes written.
pub async fn save_artifact(
    backend: &dyn DocumentBackend,
    link: &DownloadLink,
    dest: impl AsRef<Path>,
) -> Result<u64, PipelineError> {
    let path = dest.as_ref();
    let bytes = backend.fetch_bytes(&link.signed_url).await?;

    let write_err = |e| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = temp_path(path);
    let written = match tokio::fs::write(&tmp_path, &bytes).await {
        Ok(()) => tokio::fs::rename(&tmp_path, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(write_err(e));
    }

    info!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(bytes.len() as u64)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
