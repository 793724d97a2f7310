//! OAuth2 client-credentials token lifecycle for the registry.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A cached token is refreshed this many seconds before its stated expiry.
const EXPIRY_BUFFER_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("registry credentials are not configured")]
    MissingCredentials,

    #[error("token request rejected: HTTP {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("token request failed: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expires_at.timestamp() - EXPIRY_BUFFER_SECS
    }
}

/// Acquires and caches a bearer token via the client-credentials grant.
///
/// Owned by a single `RegistryClient`; the cached token never leaves this
/// type except as the string handed to `bearer_auth`.
pub struct TokenManager {
    http: reqwest::Client,
    auth_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        auth_url: impl Into<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            auth_url: auth_url.into().trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            cached: RwLock::new(None),
        }
    }

    /// Return a valid bearer token, requesting a fresh one only when no
    /// cached token exists or the cached one is within the expiry buffer.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if !token.is_expired(Utc::now()) {
                return Ok(token.value.clone());
            }
        }
        self.request_token().await
    }

    /// Drop the cached token. Called after the registry reports 401 so the
    /// next `get_token` fetches a fresh one.
    pub async fn invalidate(&self) {
        debug!("invalidating cached registry token");
        *self.cached.write().await = None;
    }

    async fn request_token(&self) -> Result<String, AuthError> {
        let (client_id, client_secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => (id, secret),
            _ => return Err(AuthError::MissingCredentials),
        };

        let response = self
            .http
            .post(format!(
                "{}/accesstoken?grant_type=client_credentials",
                self.auth_url
            ))
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }

        let token: TokenResponse = response.json().await?;
        let expires_at = Utc::now() + Duration::seconds(token.expires_in as i64);
        let value = token.access_token.clone();
        *self.cached.write().await = Some(CachedToken {
            value: token.access_token,
            expires_at,
        });
        info!("acquired registry access token, valid for {}s", token.expires_in);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_buffer() {
        let now = Utc::now();
        let token = CachedToken {
            value: "t".to_string(),
            expires_at: now + Duration::seconds(3600),
        };
        assert!(!token.is_expired(now));

        // Inside the 5-minute buffer counts as expired.
        let token = CachedToken {
            value: "t".to_string(),
            expires_at: now + Duration::seconds(200),
        };
        assert!(token.is_expired(now));

        let token = CachedToken {
            value: "t".to_string(),
            expires_at: now - Duration::seconds(100),
        };
        assert!(token.is_expired(now));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_an_auth_error() {
        let manager = TokenManager::new(reqwest::Client::new(), "http://localhost:1", None, None);
        assert!(matches!(
            manager.get_token().await,
            Err(AuthError::MissingCredentials)
        ));

        let manager = TokenManager::new(
            reqwest::Client::new(),
            "http://localhost:1",
            Some(String::new()),
            Some("secret".to_string()),
        );
        assert!(matches!(
            manager.get_token().await,
            Err(AuthError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_invalidate_clears_cache() {
        let manager = TokenManager::new(reqwest::Client::new(), "http://localhost:1", None, None);
        *manager.cached.write().await = Some(CachedToken {
            value: "stale".to_string(),
            expires_at: Utc::now() + Duration::seconds(3600),
        });
        assert_eq!(manager.get_token().await.unwrap(), "stale");

        manager.invalidate().await;
        // With no credentials configured, a refresh after invalidation must
        // surface the configuration problem instead of the stale token.
        assert!(matches!(
            manager.get_token().await,
            Err(AuthError::MissingCredentials)
        ));
    }
}
