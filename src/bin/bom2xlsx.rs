//! CLI binary for bom2xlsx.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, renders the orchestrator's progress and saves the
//! resulting workbook.

use anyhow::{Context, Result};
use bom2xlsx::{
    load_input, resolve_download, save_artifact, DocumentBackend, HttpBackend, PipelineConfig,
    PipelineObserver, PipelineOrchestrator, PipelineState, SessionId, Stage,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Renders the session as a 0–100 bar, printing one line per stage entered.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}%  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl PipelineObserver for CliObserver {
    fn on_session_start(&self, session: SessionId) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Session {session} started"))
        ));
    }

    fn on_state_change(&self, state: &PipelineState) {
        if self.bar.prefix() != state.stage.label() && state.stage.is_active() {
            self.bar.println(format!("  {} {}", green("✓"), state.stage.label()));
            self.bar.set_prefix(state.stage.label());
        }
        self.bar.set_position(u64::from(state.progress));
        self.bar.set_message(state.message.clone());
    }

    fn on_session_end(&self, state: &PipelineState) {
        self.bar.finish_and_clear();
        match state.stage {
            Stage::Completed => eprintln!("{} {}", green("✔"), bold("Conversion complete")),
            _ => eprintln!(
                "{} {}",
                red("✘"),
                red(state.error.as_deref().unwrap_or("Conversion failed"))
            ),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert and save the workbook next to you (name chosen by the backend)
  bom2xlsx bom.pdf

  # Save to a specific file
  bom2xlsx bom.pdf -o parts.xlsx

  # Against a deployed backend
  bom2xlsx --api-url https://bom.example.com/api/v1 --token "$TOKEN" bom.pdf

  # Only print the signed download link, as JSON
  bom2xlsx --no-download --json bom.pdf

  # Give up if any stage stays pending for more than 15 minutes
  bom2xlsx --poll-timeout 900 bom.pdf

ENVIRONMENT VARIABLES:
  BOM2XLSX_API_URL        Backend API root (default http://localhost:8000/api/v1)
  BOM2XLSX_TOKEN          Bearer token for backend calls
  RUST_LOG                Override the log filter (e.g. bom2xlsx=debug)

Press Ctrl-C to cancel: the running backend task is revoked and the session
is reset before exit.
"#;

/// Convert bill-of-materials PDFs to Excel workbooks.
#[derive(Parser, Debug)]
#[command(
    name = "bom2xlsx",
    version,
    about = "Convert bill-of-materials PDFs to Excel workbooks",
    long_about = "Upload a bill-of-materials PDF to the recognition backend, follow the \
recognition and conversion tasks until they finish, and download the resulting Excel workbook.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Write the workbook to this file or directory. Default: current directory.
    #[arg(short, long, env = "BOM2XLSX_OUTPUT")]
    output: Option<PathBuf>,

    /// Backend API root.
    #[arg(long, env = "BOM2XLSX_API_URL", default_value = bom2xlsx::DEFAULT_API_BASE_URL)]
    api_url: String,

    /// Bearer token for backend calls.
    #[arg(long, env = "BOM2XLSX_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Recognition task poll interval in milliseconds.
    #[arg(long, env = "BOM2XLSX_TASK_INTERVAL", default_value_t = 3_000)]
    task_interval: u64,

    /// Recognition operation poll interval in milliseconds.
    #[arg(long, env = "BOM2XLSX_OPERATION_INTERVAL", default_value_t = 5_000)]
    operation_interval: u64,

    /// Conversion task poll interval in milliseconds.
    #[arg(long, env = "BOM2XLSX_CONVERT_INTERVAL", default_value_t = 3_000)]
    convert_interval: u64,

    /// Fail a stage that stays pending longer than this many seconds.
    #[arg(long, env = "BOM2XLSX_POLL_TIMEOUT")]
    poll_timeout: Option<u64>,

    /// Per-request timeout for backend calls in seconds.
    #[arg(long, env = "BOM2XLSX_REQUEST_TIMEOUT", default_value_t = 60)]
    request_timeout: u64,

    /// Timeout for uploading and downloading file bytes in seconds.
    #[arg(long, env = "BOM2XLSX_UPLOAD_TIMEOUT", default_value_t = 300)]
    upload_timeout: u64,

    /// Print the signed download link instead of fetching the workbook.
    #[arg(long)]
    no_download: bool,

    /// Print a JSON summary on stdout.
    #[arg(long, env = "BOM2XLSX_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "BOM2XLSX_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "BOM2XLSX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "BOM2XLSX_QUIET")]
    quiet: bool,
}

/// What `--json` prints.
#[derive(Serialize)]
struct Summary<'a> {
    state: &'a PipelineState,
    signed_url: Option<&'a str>,
    file_name: Option<&'a str>,
    saved_to: Option<PathBuf>,
    bytes: Option<u64>,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The bar provides all the feedback that matters while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let started = Instant::now();
    let config = build_config(&cli)?;
    let backend = Arc::new(HttpBackend::new(&config).context("Failed to create HTTP client")?);

    let input = load_input(&cli.input)
        .await
        .with_context(|| format!("Cannot use {}", cli.input.display()))?;

    let mut orchestrator = PipelineOrchestrator::new(backend.clone(), config);
    if show_progress {
        orchestrator = orchestrator.with_observer(CliObserver::new());
    }

    // ── Run the session, Ctrl-C cancels it ───────────────────────────────
    let state = tokio::select! {
        result = orchestrator.run(input) => result.context("Conversion did not finish")?,
        _ = tokio::signal::ctrl_c() => {
            cancel_remote(backend.as_ref(), &orchestrator.snapshot()).await;
            orchestrator.reset();
            eprintln!("{} Cancelled", red("✘"));
            std::process::exit(130);
        }
    };

    if state.stage != Stage::Completed {
        if cli.json {
            print_summary(&summary(&state, None, None, started))?;
        }
        match unreported_failure(&state, show_progress) {
            Some(message) => anyhow::bail!(message),
            None => std::process::exit(1),
        }
    }

    // ── Resolve and fetch the workbook ───────────────────────────────────
    let result_ref = state
        .result_ref
        .as_deref()
        .context("Completed session has no result reference")?;
    let link = resolve_download(backend.as_ref(), result_ref)
        .await
        .context("Failed to resolve download link")?;

    if cli.no_download {
        if cli.json {
            print_summary(&Summary {
                signed_url: Some(&link.signed_url),
                file_name: Some(&link.file_name),
                ..summary(&state, None, None, started)
            })?;
        } else {
            println!("{}", link.signed_url);
        }
        return Ok(());
    }

    let dest = match &cli.output {
        Some(path) if path.is_dir() => path.join(&link.file_name),
        Some(path) => path.clone(),
        None => PathBuf::from(&link.file_name),
    };
    let written = save_artifact(backend.as_ref(), &link, &dest)
        .await
        .with_context(|| format!("Failed to save workbook to {}", dest.display()))?;

    if cli.json {
        print_summary(&Summary {
            signed_url: Some(&link.signed_url),
            file_name: Some(&link.file_name),
            ..summary(&state, Some(dest.clone()), Some(written), started)
        })?;
    } else if !cli.quiet {
        eprintln!(
            "{}  {}  {}ms  →  {}",
            green("✔"),
            dim(&format!("{written} bytes")),
            started.elapsed().as_millis(),
            bold(&dest.display().to_string()),
        );
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .api_base_url(&cli.api_url)
        .task_poll_interval_ms(cli.task_interval)
        .operation_poll_interval_ms(cli.operation_interval)
        .convert_poll_interval_ms(cli.convert_interval)
        .poll_timeout_secs(cli.poll_timeout)
        .request_timeout_secs(cli.request_timeout)
        .upload_timeout_secs(cli.upload_timeout);

    if let Some(ref token) = cli.token {
        builder = builder.access_token(token);
    }

    builder.build().context("Invalid configuration")
}

/// Revoke the task the session is waiting on. Best effort: the session is
/// reset regardless.
async fn cancel_remote(backend: &dyn DocumentBackend, state: &PipelineState) {
    let task_id = match (state.stage, state.task_ref.as_deref()) {
        (Stage::Processing | Stage::Converting, Some(id)) => id,
        _ => return,
    };
    match tokio::time::timeout(Duration::from_secs(5), backend.cancel_task(task_id)).await {
        Ok(Ok(())) => eprintln!("{}", dim(&format!("Revoked task {task_id}"))),
        Ok(Err(e)) => warn!("Could not revoke task {}: {}", task_id, e),
        Err(_) => warn!("Timed out revoking task {}", task_id),
    }
}

fn summary(
    state: &PipelineState,
    saved_to: Option<PathBuf>,
    bytes: Option<u64>,
    started: Instant,
) -> Summary<'_> {
    Summary {
        state,
        signed_url: None,
        file_name: None,
        saved_to,
        bytes,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// The error `main` still has to print for a session that did not complete.
/// `None` when the progress observer has already shown it.
fn unreported_failure(state: &PipelineState, show_progress: bool) -> Option<String> {
    if show_progress {
        return None;
    }
    let error = state.error.as_deref().unwrap_or("session did not complete");
    Some(format!("Conversion failed: {error}"))
}

fn print_summary(summary: &Summary<'_>) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialise summary")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> PipelineState {
        PipelineState {
            stage: Stage::Failed,
            progress: 30,
            error: Some("register for processing failed (HTTP 500): queue down".into()),
            error_kind: Some(bom2xlsx::ErrorKind::Transport),
            ..Default::default()
        }
    }

    #[test]
    fn failure_is_printed_once_with_progress_bar() {
        assert_eq!(unreported_failure(&failed(), true), None);
    }

    #[test]
    fn failure_is_printed_without_progress_bar() {
        let message = unreported_failure(&failed(), false).unwrap();
        assert_eq!(
            message,
            "Conversion failed: register for processing failed (HTTP 500): queue down"
        );
    }
}
