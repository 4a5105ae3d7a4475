//! # Configuration Management
//!
//! Loads the gateway settings from several layers, lowest priority first:
//! - Default values (the `Default` impl below)
//! - `config.toml` in the working directory, if present
//! - Environment variables with the `APP_` prefix, nested keys split by `__`
//!   (`APP_ENGINE__POOL_SIZE=2` sets `engine.pool_size`)
//! - Flat deployment variables (`HOST`, `PORT`, `WHISPER_MODEL`, `COMPUTE_TYPE`,
//!   `MAX_UPLOAD_MB`, `RATELIMIT_RPM`, `ENGINE_POOL_SIZE`, `APP_ENV`,
//!   `CORS_ALLOW_ORIGINS`, `CORS_ALLOW_CREDENTIALS`)
//!
//! A `.env` file is read into the process environment before any of this runs
//! (see `main.rs`), so it behaves like the environment layer.
//!
//! ## Rust Concepts:
//! - **Serde defaults**: every section is `#[serde(default)]`, so keys missing from
//!   every layer fall back to `Default` (the config crate drops empty lists from
//!   the default layer, so this matters for `cors.allowed_origins`)
//! - **Builder pattern**: `config::Config::builder()` stacks sources in order

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::models::SessionConfig;

/// Origins allowed when no CORS origins are configured.
pub const DEV_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://localhost:3000",
    "http://localhost:8080",
];

/// Flat environment variables and the nested key each one overrides.
const LEGACY_OVERRIDES: [(&str, &str); 9] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("APP_ENV", "server.env"),
    ("WHISPER_MODEL", "models.whisper_model"),
    ("COMPUTE_TYPE", "models.compute_type"),
    ("ENGINE_POOL_SIZE", "engine.pool_size"),
    ("MAX_UPLOAD_MB", "limits.max_upload_mb"),
    ("RATELIMIT_RPM", "limits.requests_per_minute"),
    ("CORS_ALLOW_CREDENTIALS", "cors.allow_credentials"),
];

/// Main application configuration.
///
/// Grouped by concern so each component only needs to borrow its own section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub engine: EngineConfig,
    pub transcoder: TranscoderConfig,
    pub limits: LimitsConfig,
    pub cors: CorsConfig,
    pub session: SessionSettings,
    pub transcription: TranscriptionDefaults,
}

/// Bind address plus the identity reported by `/health` and `/version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub version: String,
    /// Deployment environment label (`production`, `staging`, ...)
    pub env: String,
}

/// Speech model selection.
///
/// ## Fields:
/// - `whisper_model`: model name (`tiny`, `base.en`, `small`, `large-v3`, ...)
/// - `compute_type`: weight precision (`f32`, `f16`, `bf16`; anything else runs as f32)
/// - `device`: `auto`, `cpu`, `cuda` or `metal`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub compute_type: String,
    pub device: String,
}

/// Engine pool sizing and admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of model instances loaded at startup (P)
    pub pool_size: usize,
    /// How long a pipeline waits for a free instance before reporting busy
    pub slot_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_path: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_upload_mb: usize,
    /// Per-address request budget; 0 turns rate limiting off
    pub requests_per_minute: u32,
}

/// No origins configured means the local development set (see `cors_origins`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Streaming session tuning.
///
/// ## Fields:
/// - `max_consecutive_failures`: per-frame transcode/validation failures in a row
///   that close the session; 0 never closes
/// - `max_pending_frames`: frames queued behind the one being processed
/// - `heartbeat_interval_secs` / `client_timeout_secs`: ping cadence and how long a
///   silent client is tolerated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_consecutive_failures: u32,
    pub max_pending_frames: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Process-wide fallbacks for fields a request or session leaves unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionDefaults {
    pub default_language: Option<String>,
    pub default_initial_prompt: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            name: "Whisper STT Service".to_string(),
            version: "1.0.0".to_string(),
            env: "production".to_string(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            whisper_model: "base.en".to_string(),
            compute_type: "f32".to_string(),
            device: "auto".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            slot_wait_ms: 30_000,
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            timeout_secs: 60,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_mb: 25,
            requests_per_minute: 60,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            max_pending_frames: 16,
            heartbeat_interval_secs: 5,
            client_timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from every layer in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: nested override
    /// - `APP_CORS__ALLOWED_ORIGINS=https://a.example,https://b.example`: list override
    /// - `PORT=9000`, `WHISPER_MODEL=small`: flat overrides used by container platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cors.allowed_origins")
                    .try_parsing(true),
            );

        for (var, key) in LEGACY_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        if let Ok(origins) = env::var("CORS_ALLOW_ORIGINS") {
            settings = settings.set_override("cors.allowed_origins", split_list(&origins))?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.engine.pool_size == 0 {
            return Err(anyhow::anyhow!("Engine pool size must be greater than 0"));
        }

        if self.limits.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        if self.transcoder.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Transcoder timeout must be greater than 0"));
        }

        if self.session.max_pending_frames == 0 {
            return Err(anyhow::anyhow!("Session frame queue must hold at least one frame"));
        }

        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.limits.max_upload_mb * 1024 * 1024
    }

    pub fn slot_wait(&self) -> Duration {
        Duration::from_millis(self.engine.slot_wait_ms)
    }

    pub fn transcoder_timeout(&self) -> Duration {
        Duration::from_secs(self.transcoder.timeout_secs)
    }

    /// Configured CORS origins, or the local development set when none are given.
    pub fn cors_origins(&self) -> Vec<String> {
        if self.cors.allowed_origins.is_empty() {
            DEV_ORIGINS.iter().map(|o| o.to_string()).collect()
        } else {
            self.cors.allowed_origins.clone()
        }
    }

    pub fn default_session_config(&self) -> SessionConfig {
        SessionConfig::new(
            self.transcription.default_language.clone(),
            self.transcription.default_initial_prompt.clone(),
        )
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.name, "Whisper STT Service");
        assert_eq!(config.models.whisper_model, "base.en");
        assert_eq!(config.max_upload_bytes(), 25 * 1024 * 1024);
        assert_eq!(config.limits.requests_per_minute, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.max_pending_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cors_fallback() {
        let mut config = AppConfig::default();
        assert_eq!(config.cors_origins().len(), 3);

        config.cors.allowed_origins = vec!["https://app.example".to_string()];
        assert_eq!(config.cors_origins(), vec!["https://app.example".to_string()]);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" https://a.example, ,https://b.example "),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_defaults_survive_layering() {
        let built: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .set_override("engine.pool_size", 3)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(built.engine.pool_size, 3);
        assert_eq!(built.server.port, 8000);
        assert!(built.transcription.default_language.is_none());
        assert!(built.cors.allowed_origins.is_empty());
        assert_eq!(built.cors_origins().len(), DEV_ORIGINS.len());
    }

    #[test]
    fn test_partial_sections_fall_back_to_defaults() {
        let built: AppConfig = config::Config::builder()
            .set_override("limits.requests_per_minute", 5)
            .unwrap()
            .set_override("cors.allow_credentials", true)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(built.limits.requests_per_minute, 5);
        assert_eq!(built.limits.max_upload_mb, 25);
        assert!(built.cors.allow_credentials);
        assert!(built.cors.allowed_origins.is_empty());
        assert_eq!(built.session.max_pending_frames, 16);
        assert_eq!(built.models.whisper_model, "base.en");
    }
}
