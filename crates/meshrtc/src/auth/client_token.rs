//! Access tokens from the signaling service's client_token endpoint

use super::{TokenCache, TokenProvider};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

const JOSE_CONTENT_TYPE: &str = "application/jose";

#[derive(Debug, Deserialize)]
struct ClientTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Exchanges an opaque refresh token for short-lived access tokens
///
/// The endpoint may rotate the refresh token; the latest value is published
/// through [`ClientTokenProvider::subscribe_refresh_token`] so embedders can
/// persist it.
pub struct ClientTokenProvider {
    client: reqwest::Client,
    refresh_url: String,
    refresh_token: watch::Sender<String>,
    cache: TokenCache,
}

impl ClientTokenProvider {
    /// Create a provider
    ///
    /// # Arguments
    ///
    /// * `refresh_url` - PUT endpoint accepting the refresh token
    /// * `refresh_token` - Initial refresh token
    /// * `timeout` - Per-request timeout
    pub fn new(
        refresh_url: impl Into<String>,
        refresh_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::AuthError(format!("Failed to create HTTP client: {}", e)))?;

        let (refresh_token, _) = watch::channel(refresh_token.into());

        Ok(Self {
            client,
            refresh_url: refresh_url.into(),
            refresh_token,
            cache: TokenCache::default(),
        })
    }

    /// Observe refresh token rotations
    pub fn subscribe_refresh_token(&self) -> watch::Receiver<String> {
        self.refresh_token.subscribe()
    }

    /// The refresh token currently in use
    pub fn current_refresh_token(&self) -> String {
        self.refresh_token.borrow().clone()
    }

    async fn refresh(&self) -> Result<String> {
        let refresh_token = self.current_refresh_token();
        debug!(url = %self.refresh_url, "Refreshing signaling access token");

        let response = self
            .client
            .put(&self.refresh_url)
            .header(CONTENT_TYPE, JOSE_CONTENT_TYPE)
            .header(ACCEPT, JOSE_CONTENT_TYPE)
            .body(refresh_token.into_bytes())
            .send()
            .await
            .map_err(|e| Error::AuthError(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("json"))
            .unwrap_or(false);
        let body = response
            .text()
            .await
            .map_err(|e| Error::AuthError(format!("Failed to read token response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::AuthError(format!(
                "Token refresh failed: HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        if !is_json {
            return Ok(body.trim().to_string());
        }

        let parsed: ClientTokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::AuthError(format!("Malformed token response: {}", e)))?;

        if let Some(rotated) = parsed.refresh_token {
            let changed = self.refresh_token.send_if_modified(|current| {
                if *current != rotated {
                    *current = rotated;
                    true
                } else {
                    false
                }
            });
            if changed {
                info!("Signaling refresh token rotated");
            }
        }

        Ok(parsed.access_token)
    }
}

#[async_trait]
impl TokenProvider for ClientTokenProvider {
    async fn token(&self) -> Result<String> {
        self.cache.get_or_refresh(|| self.refresh()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_tokens::jwt_expiring_in;
    use serde_json::json;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> ClientTokenProvider {
        ClientTokenProvider::new(
            format!("{}/client_token", server.uri()),
            "refresh-1",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_jose_response_is_cached() {
        let server = MockServer::start().await;
        let token = jwt_expiring_in(3600);

        Mock::given(method("PUT"))
            .and(path("/client_token"))
            .and(header("content-type", "application/jose"))
            .and(body_string("refresh-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/jose")
                    .set_body_string(token.clone()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert_eq!(provider.token().await.unwrap(), token);
        assert_eq!(provider.token().await.unwrap(), token);
    }

    #[tokio::test]
    async fn test_json_response_rotates_refresh_token() {
        let server = MockServer::start().await;
        let token = jwt_expiring_in(3600);

        Mock::given(method("PUT"))
            .and(path("/client_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "refresh_token": "refresh-2"
            })))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let mut rotations = provider.subscribe_refresh_token();

        assert_eq!(provider.token().await.unwrap(), token);
        assert!(rotations.has_changed().unwrap());
        assert_eq!(*rotations.borrow_and_update(), "refresh-2");
        assert_eq!(provider.current_refresh_token(), "refresh-2");
    }

    #[tokio::test]
    async fn test_near_expiry_token_is_refreshed() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/client_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(jwt_expiring_in(60)))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(&server);
        provider.token().await.unwrap();
        provider.token().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/client_token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("revoked"))
            .mount(&server)
            .await;

        let err = provider(&server).token().await.unwrap_err();
        match err {
            Error::AuthError(msg) => assert!(msg.contains("401")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
