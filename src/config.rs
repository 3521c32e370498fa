use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "gemma-3-27b-it";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Runtime settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// `None` means the upstream call may take as long as it needs.
    pub upstream_timeout: Option<Duration>,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first if a
    /// `.env` file should be honoured.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get("API_KEY")
            .or_else(|| get("GEMINI_API_KEY"))
            .ok_or(ConfigError::MissingApiKey)?;

        let port = match get("PORT") {
            Some(raw) => parse_positive("PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        let max_upload_bytes = match get("MAX_UPLOAD_BYTES") {
            Some(raw) => parse_positive("MAX_UPLOAD_BYTES", &raw)?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        let upstream_timeout = get("UPSTREAM_TIMEOUT_SECS")
            .map(|raw| parse_positive::<u64>("UPSTREAM_TIMEOUT_SECS", &raw))
            .transpose()?
            .map(Duration::from_secs);

        Ok(Config {
            api_key,
            model: get("MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: get("GEMINI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            port,
            upload_dir: get("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            max_upload_bytes,
            upstream_timeout,
        })
    }
}

fn parse_positive<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidNumber {
            name,
            value: raw.to_string(),
        }),
    }
}
