//! HTTP remote for session upload.
//!
//! `PUT {base}/sessions/{clientSessionId}` with the full session payload:
//! - any 2xx → `{ "remoteId": "..." }`; a 2xx without that body is an invalid response
//! - 409 → `{ "remoteId": "...", "session": { ... } }`, the server's version
//! - anything else is a failure, classified by status code

use std::time::Duration;

use base64::Engine;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::SyncConfig;
use crate::error::{RemoteError, Result, TrackerError};
use crate::sync::{PutOutcome, RemoteSession, RemoteStore, SessionPayload};

/// Longest error body kept in a sync record.
const MAX_ERROR_BODY: usize = 200;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredBody {
    remote_id: String,
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl HttpRemote {
    /// Authenticate with an API key (Basic auth, `API_KEY:{key}`).
    pub fn new(base_url: &str, api_key: &str, config: &SyncConfig) -> Result<Self> {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
        Self::with_auth_header(base_url, format!("Basic {}", auth), config)
    }

    /// Use a pre-formatted `Authorization` header value (e.g. `Bearer ...`).
    pub fn with_auth_header(base_url: &str, auth_header: String, config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_concurrency.max(1) * 2)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TrackerError::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    fn session_url(&self, client_session_id: &str) -> String {
        format!("{}/sessions/{}", self.base_url, client_session_id)
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Connectivity(e.to_string())
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

impl RemoteStore for HttpRemote {
    async fn put_session(&self, payload: &SessionPayload) -> std::result::Result<PutOutcome, RemoteError> {
        let url = self.session_url(&payload.client_session_id);
        let response = self
            .client
            .put(&url)
            .header("Authorization", &self.auth_header)
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        debug!("[HttpRemote] PUT {} -> {}", url, status);

        match status {
            StatusCode::CONFLICT => {
                let remote: RemoteSession = response
                    .json()
                    .await
                    .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
                Ok(PutOutcome::Conflict { remote })
            }
            status if status.is_success() => {
                let body: StoredBody = response
                    .json()
                    .await
                    .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
                Ok(PutOutcome::Stored {
                    remote_id: body.remote_id,
                })
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::status(other.as_u16(), truncate(body)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url_ignores_trailing_slash() {
        let remote =
            HttpRemote::new("https://api.example.com/v1/", "key", &SyncConfig::default()).unwrap();
        assert_eq!(
            remote.session_url("abc"),
            "https://api.example.com/v1/sessions/abc"
        );
    }

    #[test]
    fn test_api_key_header() {
        let remote = HttpRemote::new("http://localhost", "secret", &SyncConfig::default()).unwrap();
        // base64("API_KEY:secret")
        assert_eq!(remote.auth_header, "Basic QVBJX0tFWTpzZWNyZXQ=");
    }

    #[test]
    fn test_truncate_keeps_char_boundary() {
        let body = "é".repeat(150);
        let cut = truncate(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
