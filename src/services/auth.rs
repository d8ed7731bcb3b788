use crate::config::Settings;
use crate::constants::auth;
use crate::errors::ToolError;
use crate::services::logger::Logger;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;

/// A bearer token together with its computed expiry and the base URL it was
/// issued for. Replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub issued_for: String,
}

impl CachedToken {
    /// A token is treated as invalid once it is within `buffer_secs` of its
    /// real expiry, so it cannot expire mid-request.
    pub fn is_valid(&self, buffer_secs: i64) -> bool {
        Utc::now() < self.expires_at - Duration::seconds(buffer_secs)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: i64,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Owns the OAuth password-grant exchange and the cached bearer token for
/// one EMS base URL. The token lock serializes exchanges: concurrent callers
/// wait for the in-flight exchange and then observe its cached result, so
/// the backend never sees a thundering herd of simultaneous OAuth requests.
///
/// Constructed once in `App::initialize` and shared as `Arc<TokenManager>`;
/// there is deliberately no global instance.
pub struct TokenManager {
    logger: Logger,
    settings: Arc<Settings>,
    http: reqwest::Client,
    token: tokio::sync::Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(logger: Logger, settings: Arc<Settings>) -> Self {
        Self {
            logger: logger.child("auth"),
            settings,
            http: reqwest::Client::new(),
            token: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns a valid access token, performing a fresh exchange if the
    /// cached one is missing, stale, or was issued for a different base URL.
    pub async fn get_token(&self) -> Result<String, ToolError> {
        let mut slot = self.token.lock().await;
        if let Some(token) = slot.as_ref() {
            if token.is_valid(auth::TOKEN_EXPIRY_BUFFER_SECS)
                && token.issued_for == self.settings.base_url
            {
                self.logger.debug("Using cached token", None);
                return Ok(token.access_token.clone());
            }
            self.logger
                .debug("Token expired or base URL changed, refreshing", None);
        }

        let fresh = self.request_token().await?;
        let access_token = fresh.access_token.clone();
        *slot = Some(fresh);
        Ok(access_token)
    }

    /// Drops the cached token; the next `get_token` call performs a fresh
    /// exchange. Called by the HTTP engine after an observed 401.
    pub async fn clear_token(&self) {
        let mut slot = self.token.lock().await;
        *slot = None;
        self.logger.debug("Token cache cleared", None);
    }

    /// Static identification headers for API requests. Authorization is
    /// deliberately excluded; callers add it after awaiting `get_token`.
    pub fn get_auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Adi-Application-Name",
            HeaderValue::from_static(auth::APPLICATION_NAME),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(auth::USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        headers
    }

    async fn request_token(&self) -> Result<CachedToken, ToolError> {
        let token_url = format!("{}{}", self.settings.base_url, auth::TOKEN_ENDPOINT);
        self.logger.debug(
            "Requesting new token",
            Some(&serde_json::json!({ "url": token_url })),
        );

        let form = [
            ("grant_type", "password"),
            ("username", self.settings.username.as_str()),
            ("password", self.settings.password.as_str()),
        ];

        // The token endpoint call itself is never retried; transient faults
        // here surface as auth errors and the next request starts over.
        let response = self
            .http
            .post(&token_url)
            .headers(self.get_auth_headers())
            .form(&form)
            .timeout(std::time::Duration::from_secs(
                auth::TOKEN_REQUEST_TIMEOUT_SECS,
            ))
            .send()
            .await
            .map_err(|err| {
                ToolError::auth(format!("Network error during authentication: {}", err))
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            let parsed: TokenResponse = serde_json::from_str(&body).map_err(|err| {
                ToolError::auth(format!("Malformed token response: {}", err))
            })?;
            let expires_at = Utc::now() + Duration::seconds(parsed.expires_in);
            self.logger.info(
                "Authentication successful",
                Some(&serde_json::json!({ "expires_at": expires_at.to_rfc3339() })),
            );
            return Ok(CachedToken {
                access_token: parsed.access_token,
                token_type: parsed.token_type,
                expires_at,
                issued_for: self.settings.base_url.clone(),
            });
        }

        if status.as_u16() == 400 {
            if let Ok(oauth) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                let message = oauth
                    .error_description
                    .unwrap_or_else(|| oauth.error.clone());
                return Err(ToolError::auth(message).with_code(oauth.error));
            }
            return Err(ToolError::auth(format!("Authentication failed: {}", body)));
        }

        Err(ToolError::auth(format!(
            "Unexpected response from token endpoint ({}): {} {}",
            token_url,
            status.as_u16(),
            body
        )))
    }
}
