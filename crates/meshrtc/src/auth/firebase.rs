//! Access tokens from the Firebase secure token service

use super::{TokenCache, TokenProvider};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";

#[derive(Debug, Deserialize)]
struct SecureTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Firebase ID tokens refreshed through `securetoken.googleapis.com`
pub struct FirebaseTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    refresh_token: watch::Sender<String>,
    cache: TokenCache,
}

impl FirebaseTokenProvider {
    /// Create a provider for the production token endpoint
    pub fn new(api_key: &str, refresh_token: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::with_endpoint(
            format!("{}?key={}", SECURE_TOKEN_URL, api_key),
            refresh_token,
            timeout,
        )
    }

    /// Create a provider for an explicit token endpoint (emulator, tests)
    pub fn with_endpoint(
        endpoint: impl Into<String>,
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
            endpoint: endpoint.into(),
            refresh_token,
            cache: TokenCache::default(),
        })
    }

    /// Observe refresh token rotations
    pub fn subscribe_refresh_token(&self) -> watch::Receiver<String> {
        self.refresh_token.subscribe()
    }

    async fn refresh(&self) -> Result<String> {
        let refresh_token = self.refresh_token.borrow().clone();
        debug!("Refreshing Firebase ID token");

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::AuthError(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
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

        let parsed: SecureTokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::AuthError(format!("Malformed token response: {}", e)))?;

        if let Some(rotated) = parsed.refresh_token {
            self.refresh_token.send_if_modified(|current| {
                if *current != rotated {
                    *current = rotated;
                    true
                } else {
                    false
                }
            });
        }

        parsed
            .access_token
            .or(parsed.id_token)
            .ok_or_else(|| Error::AuthError("Token response carries no token".to_string()))
    }
}

#[async_trait]
impl TokenProvider for FirebaseTokenProvider {
    async fn token(&self) -> Result<String> {
        self.cache.get_or_refresh(|| self.refresh()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_tokens::jwt_expiring_in;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_refresh_posts_form_and_rotates() {
        let server = MockServer::start().await;
        let token = jwt_expiring_in(3600);

        Mock::given(method("POST"))
            .and(path("/v1/token"))
            .and(query_param("key", "api-key"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=fb-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "id_token": token,
                "refresh_token": "fb-refresh-2",
                "expires_in": "3600"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = FirebaseTokenProvider::with_endpoint(
            format!("{}/v1/token?key=api-key", server.uri()),
            "fb-refresh",
            Duration::from_secs(5),
        )
        .unwrap();
        let rotations = provider.subscribe_refresh_token();

        assert_eq!(provider.token().await.unwrap(), token);
        assert_eq!(provider.token().await.unwrap(), token);
        assert_eq!(*rotations.borrow(), "fb-refresh-2");
    }

    #[tokio::test]
    async fn test_missing_token_is_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let provider = FirebaseTokenProvider::with_endpoint(
            format!("{}/v1/token", server.uri()),
            "fb-refresh",
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(matches!(
            provider.token().await,
            Err(Error::AuthError(_))
        ));
    }

    #[test]
    fn test_production_endpoint_carries_key() {
        let provider =
            FirebaseTokenProvider::new("abc123", "rt", Duration::from_secs(5)).unwrap();
        assert_eq!(
            provider.endpoint,
            "https://securetoken.googleapis.com/v1/token?key=abc123"
        );
    }
}
