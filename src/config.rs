use crate::constants::{cache as cache_constants, network, retry as retry_constants};
use crate::errors::ToolError;
use url::Url;

/// Gateway settings, loaded once from the environment in `App::initialize`
/// and passed explicitly to every component that needs them.
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub default_system: Option<i64>,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Settings {
    /// Load settings from `EMS_*` environment variables.
    ///
    /// Required: `EMS_BASE_URL`, `EMS_USERNAME`, `EMS_PASSWORD`.
    /// Optional: `EMS_DEFAULT_SYSTEM`, `EMS_CACHE_TTL`, `EMS_REQUEST_TIMEOUT`,
    /// `EMS_MAX_RETRIES`.
    pub fn from_env() -> Result<Self, ToolError> {
        let base_url = required_env("EMS_BASE_URL")?;
        let username = required_env("EMS_USERNAME")?;
        let password = required_env("EMS_PASSWORD")?;

        Ok(Self {
            base_url: normalize_base_url(&base_url)?,
            username,
            password,
            default_system: optional_env("EMS_DEFAULT_SYSTEM")
                .map(|raw| {
                    raw.parse::<i64>().map_err(|_| {
                        ToolError::invalid_params("EMS_DEFAULT_SYSTEM must be an integer")
                    })
                })
                .transpose()?,
            cache_ttl_secs: parse_u64_env("EMS_CACHE_TTL", cache_constants::DEFAULT_TTL_SECS)?,
            request_timeout_secs: parse_u64_env(
                "EMS_REQUEST_TIMEOUT",
                network::REQUEST_TIMEOUT_SECS,
            )?,
            max_retries: parse_u64_env("EMS_MAX_RETRIES", retry_constants::MAX_RETRIES as u64)?
                as u32,
        })
    }
}

fn required_env(name: &str) -> Result<String, ToolError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(
            ToolError::invalid_params(format!("{} is required", name)).with_hint(format!(
                "Set the {} environment variable before starting the server.",
                name
            )),
        ),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u64_env(name: &str, fallback: u64) -> Result<u64, ToolError> {
    match optional_env(name) {
        None => Ok(fallback),
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            ToolError::invalid_params(format!("{} must be a non-negative integer", name))
        }),
    }
}

/// Normalize the EMS base URL: drop a trailing slash, drop a trailing `/api`
/// (the client and token manager add it themselves), upgrade plain HTTP.
pub fn normalize_base_url(raw: &str) -> Result<String, ToolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ToolError::invalid_params("EMS base URL cannot be empty"));
    }
    let mut url = trimmed.trim_end_matches('/').to_string();
    if url.to_lowercase().ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    if let Some(rest) = url.strip_prefix("http://") {
        url = format!("https://{}", rest);
    }
    Url::parse(&url).map_err(|_| {
        ToolError::invalid_params("Invalid EMS base URL")
            .with_hint("Expected a valid URL, e.g. \"https://ems.example.com\".")
            .with_details(serde_json::json!({ "base_url": raw }))
    })?;
    Ok(url)
}
