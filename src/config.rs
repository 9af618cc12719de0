//! Configuration types for driving the recognition pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct holds the backend location,
//! credentials, and the cadence of each polled stage.

use crate::error::PipelineError;
use std::fmt;
use std::time::Duration;

/// Default API root of the backend, matching its local development setup.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

/// Configuration for one orchestrator.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use bom2xlsx::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .api_base_url("https://bom.example.com/api/v1")
///     .access_token("secret")
///     .task_poll_interval_ms(2_000)
///     .build()
///     .unwrap();
/// assert_eq!(config.task_poll_interval().as_millis(), 2_000);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the backend API, without a trailing slash.
    /// Default: [`DEFAULT_API_BASE_URL`].
    pub api_base_url: String,

    /// Bearer token sent on every backend call (not on signed URLs).
    pub access_token: Option<String>,

    /// Cadence of the recognition-task status poll. Default: 3000 ms.
    pub task_poll_interval_ms: u64,

    /// Cadence of the long-running operation poll. Default: 5000 ms.
    ///
    /// Batch recognition typically takes minutes, so this polls less often
    /// than the task stages.
    pub operation_poll_interval_ms: u64,

    /// Cadence of the conversion-task status poll. Default: 3000 ms.
    pub convert_poll_interval_ms: u64,

    /// Give up on a polled stage after this many seconds of pending.
    /// Default: `None` (poll until terminal or reset).
    pub poll_timeout_secs: Option<u64>,

    /// Per-request timeout for backend calls in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Timeout for the byte transfer to the signed URL in seconds. Default: 300.
    pub upload_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            access_token: None,
            task_poll_interval_ms: 3_000,
            operation_poll_interval_ms: 5_000,
            convert_poll_interval_ms: 3_000,
            poll_timeout_secs: None,
            request_timeout_secs: 60,
            upload_timeout_secs: 300,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("api_base_url", &self.api_base_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("task_poll_interval_ms", &self.task_poll_interval_ms)
            .field("operation_poll_interval_ms", &self.operation_poll_interval_ms)
            .field("convert_poll_interval_ms", &self.convert_poll_interval_ms)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("upload_timeout_secs", &self.upload_timeout_secs)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn operation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.operation_poll_interval_ms)
    }

    pub fn convert_poll_interval(&self) -> Duration {
        Duration::from_millis(self.convert_poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_secs.map(Duration::from_secs)
    }

    /// Join a route onto the API root, e.g. `endpoint("/task/abc/status")`.
    pub fn endpoint(&self, route: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            route.trim_start_matches('/')
        )
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    pub fn task_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.task_poll_interval_ms = ms;
        self
    }

    pub fn operation_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.operation_poll_interval_ms = ms;
        self
    }

    pub fn convert_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.convert_poll_interval_ms = ms;
        self
    }

    pub fn poll_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.config.poll_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl PipelineConfig {
    /// Check the constraints [`PipelineConfigBuilder::build`] enforces.
    ///
    /// The fields are public, so a config edited after `build()` is checked
    /// again before a session uses it.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let c = self;
        let base = c.api_base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(PipelineError::InvalidConfig(format!(
                "API base URL must start with http:// or https://, got '{}'",
                c.api_base_url
            )));
        }
        for (name, ms) in [
            ("task poll interval", c.task_poll_interval_ms),
            ("operation poll interval", c.operation_poll_interval_ms),
            ("convert poll interval", c.convert_poll_interval_ms),
        ] {
            if ms == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be ≥ 1 ms"
                )));
            }
        }
        if c.poll_timeout_secs == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "Poll timeout must be ≥ 1 s when set".into(),
            ));
        }
        Ok(())
    }
}
