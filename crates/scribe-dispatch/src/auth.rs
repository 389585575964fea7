//! Bearer-credential cache for the REST backend.
//!
//! Login happens lazily on the first submission and again after a 401
//! invalidates the cached token. The refresh path is single-flight: callers
//! queue on the cache lock, and whoever enters first performs the login.

use scribe_core::config::ApiConfig;
use serde_json::json;

/// Tokens shorter than this cannot be real and are treated as a failed login.
const MIN_TOKEN_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("login request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("access denied ({0})")]
    Denied(reqwest::StatusCode),
    #[error("login reply carried no usable access_token")]
    BadToken,
}

/// An authentication header, ready to attach to a backend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: &'static str,
    pub value: String,
}

pub struct AuthTokenCache {
    http: reqwest::Client,
    login_url: String,
    passwd: String,
    apikey: Option<String>,
    cached: tokio::sync::Mutex<Option<String>>,
    logins: std::sync::atomic::AtomicUsize,
}

impl AuthTokenCache {
    pub fn new(http: reqwest::Client, api: &ApiConfig) -> Self {
        AuthTokenCache {
            http,
            login_url: api.login_url(),
            passwd: api.passwd.clone(),
            apikey: api.apikey.clone(),
            cached: tokio::sync::Mutex::new(None),
            logins: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of login round-trips performed. Exposed for tests of the
    /// single-flight property.
    pub fn login_count(&self) -> usize {
        self.logins.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn header(&self) -> Result<AuthHeader, AuthError> {
        // API-key mode bypasses login entirely.
        if let Some(key) = &self.apikey {
            if key.len() < MIN_TOKEN_LEN {
                tracing::error!("configured apikey is too short for the backend; check the configuration file");
            }
            return Ok(AuthHeader {
                name: "apikey",
                value: key.clone(),
            });
        }

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(AuthHeader {
                name: "authorization",
                value: token.clone(),
            });
        }

        let token = self.login().await?;
        *cached = Some(token.clone());
        Ok(AuthHeader {
            name: "authorization",
            value: token,
        })
    }

    /// Drop the cached token that produced a 401. Only the matching value is
    /// cleared, so concurrent failures trigger a single refresh.
    pub async fn invalidate(&self, seen: &str) {
        let mut cached = self.cached.lock().await;
        if cached.as_deref() == Some(seen) {
            *cached = None;
        }
    }

    async fn login(&self) -> Result<String, AuthError> {
        tracing::debug!(url = %self.login_url, "attempt to authenticate API server");
        self.logins
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let res = self
            .http
            .post(&self.login_url)
            .json(&json!({ "username": "vr_server", "password": self.passwd }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(AuthError::Denied(res.status()));
        }

        let body: serde_json::Value = res.json().await?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or(AuthError::BadToken)?;
        if token.len() < MIN_TOKEN_LEN {
            return Err(AuthError::BadToken);
        }
        Ok(token.to_string())
    }
}
