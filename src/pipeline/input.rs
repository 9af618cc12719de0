//! Input resolution: turn a user-supplied path or byte buffer into a
//! [`DocumentInput`] the pipeline can upload.
//!
//! The backend only accepts PDFs. Everything here runs before a session
//! starts, so a bad file is reported as a user-input error and never reaches
//! the stage machine. We check the `%PDF` magic bytes rather than trusting
//! the extension.

use crate::error::PipelineError;
use std::path::Path;
use tracing::debug;

/// MIME type of every document the backend accepts.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A document ready to be uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct DocumentInput {
    /// Name the object is stored under; also sent to `/document/process`.
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for DocumentInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentInput")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl DocumentInput {
    /// Wrap an in-memory PDF, validating it.
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, PipelineError> {
        let input = Self {
            file_name: file_name.into(),
            content_type: PDF_CONTENT_TYPE.to_string(),
            bytes,
        };
        input.validate()?;
        Ok(input)
    }

    /// Reject inputs the backend cannot process.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.bytes.is_empty() {
            return Err(PipelineError::EmptyFile {
                name: self.file_name.clone(),
            });
        }
        if self.content_type != PDF_CONTENT_TYPE || !self.bytes.starts_with(PDF_MAGIC) {
            return Err(PipelineError::UnsupportedType {
                name: self.file_name.clone(),
                magic: self.bytes.iter().take(4).copied().collect(),
            });
        }
        Ok(())
    }
}

/// Read a local PDF into a [`DocumentInput`].
pub async fn load_input(path: impl AsRef<Path>) -> Result<DocumentInput, PipelineError> {
    let path = path.as_ref();
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) => {
            let path = path.to_path_buf();
            return Err(match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::FileNotFound { path },
                std::io::ErrorKind::PermissionDenied => PipelineError::PermissionDenied { path },
                _ => PipelineError::Unreadable { path, source: e },
            });
        }
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "document.pdf".to_string());

    debug!("Loaded {} ({} bytes)", path.display(), bytes.len());
    DocumentInput::from_bytes(file_name, bytes)
}
