//! Configuration management for the gateway.
//!
//! Settings come from an optional `config.yaml` in the working directory,
//! overridden by `MY_`-prefixed environment variables (`MY_PROJECT_ID`,
//! `MY_PROJECT_NUMBER`, `MY_KEY_PATH`, `MY_SERVER_PORT`, nested keys use `__`).

use serde::Deserialize;
use std::path::PathBuf;

/// Application configuration settings.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Google Cloud project identifier (e.g., "my-project").
    pub project_id: String,
    /// Google Cloud numeric project identifier.
    pub project_number: String,
    /// Path to the service account JSON key used for the downstream API.
    pub key_path: PathBuf,
    /// Port number the server will listen on.
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// Address the server binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Directory served for every path other than `/analyzeDocument`.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default)]
    pub iap: IapSettings,
    #[serde(default)]
    pub analyzer: AnalyzerSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Settings {
    /// The audience IAP stamps into assertions for this App Engine app.
    pub fn expected_audience(&self) -> String {
        format!("/projects/{}/apps/{}", self.project_number, self.project_id)
    }
}

/// Identity-Aware Proxy assertion validation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IapSettings {
    /// JWK endpoint publishing the IAP signing keys.
    pub jwks_url: String,
    /// The only issuer accepted in assertions.
    pub issuer: String,
    /// Allowed clock skew when checking `exp`, `nbf` and `iat`.
    pub clock_skew_secs: u64,
    /// How long a fetched key set is reused. `0` fetches keys on every request.
    pub key_cache_ttl_secs: u64,
}

impl Default for IapSettings {
    fn default() -> Self {
        Self {
            jwks_url: "https://www.gstatic.com/iap/verify/public_key-jwk".to_string(),
            issuer: "https://cloud.google.com/iap".to_string(),
            clock_skew_secs: 300,
            key_cache_ttl_secs: 0,
        }
    }
}

/// Cloud Healthcare NLP API access.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Scheme and host of the Healthcare API.
    pub api_base: String,
    pub api_version: String,
    pub region: String,
    /// OAuth scope requested for the service account access token.
    pub scope: String,
    /// Reuse access tokens until shortly before they expire.
    pub cache_credentials: bool,
    /// How long before expiry a cached access token is dropped.
    pub token_refresh_skew_secs: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            api_base: "https://healthcare.googleapis.com".to_string(),
            api_version: "v1beta1".to_string(),
            region: "us-central1".to_string(),
            scope: "https://www.googleapis.com/auth/cloud-healthcare".to_string(),
            cache_credentials: false,
            token_refresh_skew_secs: 60,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoggingFormat {
    Json,
    Pretty,
}

/// Logging and tracing export settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Level for this crate and everything not listed separately.
    pub level: LogLevel,
    /// Level for the `axum` target.
    pub axum_level: LogLevel,
    pub format: LoggingFormat,
    /// Export spans over OTLP (endpoint from the standard `OTEL_EXPORTER_OTLP_*` variables).
    pub otlp_enabled: bool,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            axum_level: LogLevel::Warn,
            format: LoggingFormat::Json,
            otlp_enabled: false,
            service_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("`{0}` must not be empty")]
    Empty(&'static str),
}

/// Loads configuration from `config.yaml` (if present) and the environment.
#[tracing::instrument]
pub fn load_config() -> Result<Settings, SettingsError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(
            config::Environment::with_prefix("MY")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .inspect_err(|e| tracing::error!("Failed to build configuration: {}", e))?;

    let settings = cfg
        .try_deserialize::<Settings>()
        .inspect_err(|e| tracing::error!("Failed to deserialize configuration: {}", e))?;

    settings.validate()?;
    Ok(settings)
}

impl Settings {
    fn validate(&self) -> Result<(), SettingsError> {
        if self.project_id.trim().is_empty() {
            return Err(SettingsError::Empty("project_id"));
        }
        if self.project_number.trim().is_empty() {
            return Err(SettingsError::Empty("project_number"));
        }
        Ok(())
    }
}
