use crate::config::Settings;
use crate::constants::retry as retry_constants;
use crate::errors::ToolError;
use crate::services::auth::TokenManager;
use crate::services::logger::Logger;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff configuration. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: retry_constants::MAX_RETRIES,
            base_delay: retry_constants::BASE_DELAY_SECS,
            max_delay: retry_constants::MAX_DELAY_SECS,
            exponential_base: retry_constants::EXPONENTIAL_BASE,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay in seconds before the retry following `attempt` (0-indexed).
    /// With jitter the delay is scaled by a uniform factor in [0.5, 1.5).
    pub fn delay(&self, attempt: u32) -> f64 {
        let mut delay = (self.base_delay * self.exponential_base.powi(attempt as i32))
            .min(self.max_delay);
        if self.jitter {
            delay *= 0.5 + rand::random::<f64>();
        }
        delay
    }
}

#[derive(Debug, Deserialize)]
struct EmsErrorResponse {
    message: String,
    #[serde(rename = "messageDetail")]
    message_detail: Option<String>,
}

/// Authenticated HTTP client for the EMS API: injects the bearer token,
/// classifies responses into the typed error taxonomy, and retries
/// retryable failures with exponential backoff. The token is re-fetched on
/// every attempt so a cleared or refreshed token is picked up naturally.
pub struct EmsClient {
    logger: Logger,
    settings: Arc<Settings>,
    token_manager: Arc<TokenManager>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl EmsClient {
    pub fn new(logger: Logger, settings: Arc<Settings>, token_manager: Arc<TokenManager>) -> Self {
        let retry = RetryPolicy {
            max_retries: settings.max_retries,
            ..RetryPolicy::default()
        };
        Self::with_retry_policy(logger, settings, token_manager, retry)
    }

    pub fn with_retry_policy(
        logger: Logger,
        settings: Arc<Settings>,
        token_manager: Arc<TokenManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            logger: logger.child("client"),
            settings,
            token_manager,
            http: reqwest::Client::new(),
            retry,
        }
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.token_manager
    }

    pub async fn get(&self, path: &str) -> Result<Value, ToolError> {
        self.request(Method::GET, path, &[], None, None).await
    }

    pub async fn get_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ToolError> {
        self.request(Method::GET, path, query, None, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ToolError> {
        self.request(Method::POST, path, &[], Some(body), None)
            .await
    }

    /// One logical request. Attempts loop until success, a terminal error,
    /// or the retry budget is spent. A 401 gets a single immediate
    /// token-clear-and-retry outside the backoff policy; a second 401 is a
    /// terminal authentication error.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<Value, ToolError> {
        let url = format!("{}{}", self.settings.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            let token = self.token_manager.get_token().await?;
            let mut headers = self.token_manager.get_auth_headers();
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
            if let Some(extra) = extra_headers.as_ref() {
                // Caller headers win on conflict.
                for (name, value) in extra.iter() {
                    headers.insert(name.clone(), value.clone());
                }
            }

            self.logger.debug(
                "request",
                Some(&serde_json::json!({
                    "method": method.as_str(),
                    "path": path,
                    "attempt": attempt + 1,
                })),
            );

            let mut request = self
                .http
                .request(method.clone(), &url)
                .headers(headers)
                .timeout(Duration::from_secs(self.settings.request_timeout_secs));
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let error = match request.send().await {
                Err(err) if err.is_timeout() => {
                    ToolError::timeout(format!("Request timeout: {}", err))
                }
                Err(err) => ToolError::network(format!("Network error: {}", err)),
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        if text.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_str(&text).map_err(|err| {
                            ToolError::api(format!("Malformed response body: {}", err))
                                .with_status(status.as_u16())
                        });
                    }

                    let code = status.as_u16();
                    if code == 401 {
                        if attempt == 0 {
                            self.logger
                                .info("Got 401, clearing token and retrying", None);
                            self.token_manager.clear_token().await;
                            attempt = 1;
                            continue;
                        }
                        return Err(ToolError::auth("Authentication failed after retry"));
                    }

                    let retry_after = response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    let body_text = response.text().await.unwrap_or_default();

                    match code {
                        403 => {
                            return Err(ToolError::denied(extract_error_message(
                                &body_text,
                                "Access denied",
                            ))
                            .with_status(403))
                        }
                        404 => {
                            return Err(ToolError::not_found(extract_error_message(
                                &body_text,
                                "Resource not found",
                            ))
                            .with_status(404))
                        }
                        429 => ToolError::rate_limited("Rate limit exceeded", retry_after),
                        code if code >= 500 => ToolError::server(extract_error_message(
                            &body_text,
                            &format!("Server error: {}", code),
                        ))
                        .with_status(code),
                        code => {
                            return Err(ToolError::api(extract_error_message(
                                &body_text,
                                &format!("API error: {}", code),
                            ))
                            .with_status(code))
                        }
                    }
                }
            };

            if attempt >= self.retry.max_retries {
                self.logger.error(
                    "Max retries exceeded",
                    Some(&serde_json::json!({
                        "method": method.as_str(),
                        "path": path,
                        "error": error.message,
                    })),
                );
                return Err(error);
            }

            // An explicit Retry-After overrides computed backoff exactly.
            let delay = error
                .retry_after_secs
                .map(|secs| secs as f64)
                .unwrap_or_else(|| self.retry.delay(attempt));
            self.logger.info(
                "Retrying request",
                Some(&serde_json::json!({
                    "method": method.as_str(),
                    "path": path,
                    "delay_secs": delay,
                    "attempt": attempt + 1,
                    "max_retries": self.retry.max_retries,
                })),
            );
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            attempt += 1;
        }
    }
}

/// Pull a human-readable message out of an EMS error envelope, falling back
/// to the supplied default when the body is not the standard shape.
fn extract_error_message(body: &str, default: &str) -> String {
    match serde_json::from_str::<EmsErrorResponse>(body) {
        Ok(parsed) => match parsed.message_detail {
            Some(detail) => format!("{}: {}", parsed.message, detail),
            None => parsed.message,
        },
        Err(_) => default.to_string(),
    }
}
