//! HTTP implementation of [`RemoteService`] for the SiteHero sync API.
//!
//! Sends each batch as `POST /api/sync/batch` with the session's bearer
//! token. The session itself is owned by the auth layer; it hands tokens in
//! through [`HttpRemoteService::set_token`] and learns about expiry from the
//! sync manager's `auth_required` status.

use crate::config::RemoteConfig;
use crate::error::{RemoteError, SyncResult};
use crate::remote::{BatchRequest, BatchResponse, RemoteService};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const BATCH_PATH: &str = "/api/sync/batch";

/// Remote service reached over HTTPS.
#[derive(Clone)]
pub struct HttpRemoteService {
    client: Client,
    config: RemoteConfig,
    token: Arc<RwLock<Option<String>>>,
}

impl HttpRemoteService {
    pub fn new(config: RemoteConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            token: Arc::new(RwLock::new(None)),
        })
    }

    /// Installs the session token (after sign-in or session restore).
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    pub async fn has_token(&self) -> bool {
        self.token.read().await.is_some()
    }

    fn batch_url(&self) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), BATCH_PATH)
    }
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn send_batch(&self, request: &BatchRequest) -> Result<BatchResponse, RemoteError> {
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or(RemoteError::AuthExpired)?;

        let resp = self
            .client
            .post(self.batch_url())
            .bearer_auth(&token)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_success() {
            debug!("batch of {} for {} accepted", request.operations.len(), request.table);
            return resp
                .json::<BatchResponse>()
                .await
                .map_err(|e| RemoteError::Transient(format!("malformed batch response: {e}")));
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transient(err.to_string())
    }
}

/// Maps a non-success HTTP status onto the sync error taxonomy.
fn classify_status(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::AuthExpired,
        StatusCode::REQUEST_TIMEOUT => RemoteError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient(format!("{status}: rate limited")),
        s if s.is_server_error() => RemoteError::Transient(format!("{status}: {body}")),
        s => {
            warn!("sync batch rejected with {s}: {body}");
            RemoteError::Validation(format!("{status}: {body}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, String::new()), RemoteError::AuthExpired);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, String::new()), RemoteError::AuthExpired);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT, String::new()), RemoteError::Timeout);
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad".into()),
            RemoteError::Validation(_)
        ));
    }
}
