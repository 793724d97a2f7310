//! Registry API client.
//!
//! One `RegistryClient` owns the HTTP client and the token manager and
//! exposes the four operations the sync pipelines need. Pipelines depend on
//! the `RegistryApi` trait rather than the concrete client so they can be
//! exercised against a fake registry.

pub mod extract;
pub mod token;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::RegistryConfig;
use token::{AuthError, TokenManager};

/// Identifier system under which the registry indexes national identity
/// numbers.
pub const NIK_IDENTIFIER_SYSTEM: &str = "https://fhir.kemkes.go.id/id/nik";

/// All registry calls share one blocking-style timeout.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(8);

/// Longest response-body excerpt carried into an error reason.
const EXCERPT_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Token endpoint failure; fatal to the whole run.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Timeout or connection-level failure; the row is retryable.
    #[error("registry request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// 401 that survived one token refresh; never retried further.
    #[error("registry rejected the request even after a token refresh")]
    Unauthorized,

    /// Any other non-2xx answer.
    #[error("registry answered HTTP {status}: {detail}")]
    Status {
        status: reqwest::StatusCode,
        detail: String,
    },

    /// A 2xx answer whose body was not JSON.
    #[error("registry answered with a non-JSON body: {0}")]
    InvalidJson(String),
}

/// The remote operations the pipelines perform.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Search the registry for the patient holding a national identity
    /// number. Returns the raw search envelope.
    async fn patient_by_nik(&self, nik: &str) -> Result<Value, RegistryError>;

    /// Search for conditions already attached to an encounter.
    async fn conditions_by_encounter(&self, encounter_id: &str) -> Result<Value, RegistryError>;

    /// Create a condition record.
    async fn create_condition(&self, payload: &Value) -> Result<Value, RegistryError>;

    /// Complete a visit: one composite call that creates consent, encounter
    /// and vitals on the remote side.
    async fn complete_visit(&self, payload: &Value) -> Result<Value, RegistryError>;
}

enum Call<'a> {
    Get {
        url: String,
        query: Vec<(&'static str, String)>,
    },
    Post {
        url: String,
        payload: &'a Value,
    },
}

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let tokens = TokenManager::new(
            http.clone(),
            config.auth_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
        );
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Send an authorized call. On 401 the cached token is invalidated and
    /// the call retried exactly once with a fresh token; a second 401 is
    /// surfaced as `Unauthorized`.
    async fn dispatch(&self, call: &Call<'_>) -> Result<Value, RegistryError> {
        let mut refreshed = false;
        loop {
            let bearer = self.tokens.get_token().await?;
            let request = match call {
                Call::Get { url, query } => self.http.get(url.as_str()).query(query),
                Call::Post { url, payload } => self.http.post(url.as_str()).json(payload),
            };
            let response = request.bearer_auth(&bearer).send().await?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                if refreshed {
                    return Err(RegistryError::Unauthorized);
                }
                debug!("registry reported 401, refreshing token and retrying once");
                self.tokens.invalidate().await;
                refreshed = true;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RegistryError::Status {
                    status,
                    detail: failure_detail(&body),
                });
            }

            let body = response.text().await?;
            return serde_json::from_str(&body)
                .map_err(|_| RegistryError::InvalidJson(excerpt(&body)));
        }
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn patient_by_nik(&self, nik: &str) -> Result<Value, RegistryError> {
        self.dispatch(&Call::Get {
            url: format!("{}/Patient", self.base_url),
            query: vec![("identifier", format!("{NIK_IDENTIFIER_SYSTEM}|{nik}"))],
        })
        .await
    }

    async fn conditions_by_encounter(&self, encounter_id: &str) -> Result<Value, RegistryError> {
        self.dispatch(&Call::Get {
            url: format!("{}/Condition", self.base_url),
            query: vec![("encounter", encounter_id.to_string())],
        })
        .await
    }

    async fn create_condition(&self, payload: &Value) -> Result<Value, RegistryError> {
        self.dispatch(&Call::Post {
            url: format!("{}/Condition", self.base_url),
            payload,
        })
        .await
    }

    async fn complete_visit(&self, payload: &Value) -> Result<Value, RegistryError> {
        self.dispatch(&Call::Post {
            url: format!("{}/workflow/complete-visit", self.base_url),
            payload,
        })
        .await
    }
}

/// Distill a failure reason from an error body. The registry reports
/// validation problems as FHIR `OperationOutcome` resources; surface the
/// issue text from those instead of the raw JSON.
fn failure_detail(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if parsed["resourceType"] == "OperationOutcome" {
            let issues: Vec<&str> = parsed["issue"]
                .as_array()
                .map(|issues| {
                    issues
                        .iter()
                        .filter_map(|issue| issue["details"]["text"].as_str())
                        .collect()
                })
                .unwrap_or_default();
            if !issues.is_empty() {
                return issues.join("; ");
            }
        }
    }
    excerpt(body)
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= EXCERPT_LEN {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < EXCERPT_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &trimmed[..cut])
    }
}
