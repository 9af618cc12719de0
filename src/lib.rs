//! # bom2xlsx
//!
//! Turn a bill-of-materials PDF into an Excel workbook by driving a remote
//! recognition backend through its chained asynchronous stages.
//!
//! ## Why this crate?
//!
//! The backend never answers in one round trip. An upload yields a task, the
//! task yields a long-running recognition operation, and the operation is
//! followed by a second conversion task. Each has to be polled until it
//! settles. This crate owns that sequence: one reusable poll loop, one stage
//! runner, and an orchestrator that keeps a single observable state and can
//! be reset at any point without leaving timers behind.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Upload     signed URL → PUT bytes                      10–30%
//!  ├─ 2. Register   /document/process → recognition task        50%
//!  ├─ 3. Recognise  poll task, then poll the operation          60–80%
//!  ├─ 4. Convert    /document/convert → poll conversion task    85–90%
//!  └─ 5. Result     gcs_download_path → signed download link    100%
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bom2xlsx::{convert, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .api_base_url("https://bom.example.com/api/v1")
//!         .access_token(std::env::var("BOM2XLSX_TOKEN")?)
//!         .build()?;
//!     let output = convert("bom.pdf", &config).await?;
//!     match output.download {
//!         Some(link) => println!("{} -> {}", link.file_name, link.signed_url),
//!         None => eprintln!("failed: {:?}", output.state.error),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `bom2xlsx` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! bom2xlsx = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod convert;
pub mod download;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod state;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{DocumentBackend, HttpBackend, ScriptedBackend};
pub use config::{PipelineConfig, PipelineConfigBuilder, DEFAULT_API_BASE_URL};
pub use convert::{convert, convert_sync, convert_to_file, convert_with_backend, ConversionOutput};
pub use download::{resolve_download, save_artifact, DownloadLink};
pub use error::{ErrorKind, PipelineError};
pub use pipeline::input::{load_input, DocumentInput};
pub use pipeline::orchestrator::PipelineOrchestrator;
pub use pipeline::poll::{PollHandle, PollLoop, PollOutcome, PollRegistry, PollTerminal};
pub use pipeline::stage::{InProgress, StageRunner};
pub use progress::{NoopObserver, ObserverHandle, PipelineObserver};
pub use state::{PipelineState, PipelineStatus, SessionId, Stage};
pub use stream::{session_stream, state_stream, StateStream};
