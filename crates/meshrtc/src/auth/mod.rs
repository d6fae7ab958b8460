//! Bearer tokens for the signaling service
//!
//! Refreshing providers cache the current access token and reuse it until it
//! is within [`REFRESH_MARGIN_SECS`] of the `exp` claim carried in the JWT. Only
//! one refresh runs at a time; concurrent callers wait for it and share the
//! result.

mod client_token;
mod firebase;

pub use client_token::ClientTokenProvider;
pub use firebase::FirebaseTokenProvider;

use crate::config::AuthConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Tokens are refreshed once they are this many seconds from expiry
pub const REFRESH_MARGIN_SECS: i64 = 180;

/// Source of bearer tokens for signaling requests
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token valid for at least the next few minutes
    async fn token(&self) -> Result<String>;
}

/// A fixed token that is never refreshed
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Build the provider selected in configuration
pub fn provider_from_config(
    auth: &AuthConfig,
    request_timeout: std::time::Duration,
) -> Result<Arc<dyn TokenProvider>> {
    let provider: Arc<dyn TokenProvider> = match auth {
        AuthConfig::Static { token } => Arc::new(StaticTokenProvider::new(token.clone())),
        AuthConfig::ClientToken {
            refresh_url,
            refresh_token,
        } => Arc::new(ClientTokenProvider::new(
            refresh_url.clone(),
            refresh_token.clone(),
            request_timeout,
        )?),
        AuthConfig::Firebase {
            api_key,
            refresh_token,
            refresh_url,
        } => {
            let provider = match refresh_url {
                Some(url) => FirebaseTokenProvider::with_endpoint(
                    url.clone(),
                    refresh_token.clone(),
                    request_timeout,
                )?,
                None => FirebaseTokenProvider::new(api_key, refresh_token.clone(), request_timeout)?,
            };
            Arc::new(provider)
        }
    };
    Ok(provider)
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

/// Read the `exp` claim of a JWT without verifying its signature
pub fn token_expiry(token: &str) -> Result<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| Error::AuthError(format!("Unreadable access token: {}", e)))?;

    let exp = data
        .claims
        .exp
        .ok_or_else(|| Error::AuthError("Access token has no exp claim".to_string()))?;

    Utc.timestamp_opt(exp, 0)
        .single()
        .ok_or_else(|| Error::AuthError(format!("Access token exp out of range: {}", exp)))
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Single-flight cache for an expiring access token
#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    current: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    /// Return the cached token, or run `refresh` to obtain a new one
    pub(crate) async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let mut current = self.current.lock().await;

        if let Some(cached) = current.as_ref() {
            if cached.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(cached.token.clone());
            }
            debug!(expires_at = %cached.expires_at, "Access token near expiry, refreshing");
        }

        let token = refresh().await?;
        let expires_at = token_expiry(&token)?;
        *current = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims {
        sub: String,
        aud: String,
        exp: i64,
    }

    /// A signed JWT expiring `ttl_secs` from now
    pub fn jwt_expiring_in(ttl_secs: i64) -> String {
        let claims = Claims {
            sub: "mesh-test".to_string(),
            aud: "signaling".to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_tokens::jwt_expiring_in;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_token_expiry_reads_exp_without_key() {
        let token = jwt_expiring_in(3600);
        let exp = token_expiry(&token).unwrap();
        let remaining = exp - Utc::now();
        assert!(remaining > Duration::minutes(59));
        assert!(remaining <= Duration::minutes(60));
    }

    #[test]
    fn test_token_expiry_rejects_garbage() {
        assert!(matches!(
            token_expiry("not-a-jwt"),
            Err(Error::AuthError(_))
        ));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("abc");
        assert_eq!(provider.token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_cache_reuses_fresh_token() {
        let cache = TokenCache::default();
        let refreshes = AtomicUsize::new(0);
        let token = jwt_expiring_in(3600);

        for _ in 0..3 {
            let got = cache
                .get_or_refresh(|| {
                    let refreshes = &refreshes;
                    let token = token.clone();
                    async move {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        Ok(token)
                    }
                })
                .await
                .unwrap();
            assert_eq!(got, token);
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_refreshes_inside_margin() {
        let cache = TokenCache::default();
        let refreshes = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_refresh(|| {
                    let refreshes = &refreshes;
                    async move {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        Ok(jwt_expiring_in(120))
                    }
                })
                .await
                .unwrap();
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_propagates_refresh_failure() {
        let cache = TokenCache::default();
        let err = cache
            .get_or_refresh(|| async { Err(Error::AuthError("denied".to_string())) })
            .await
            .unwrap_err();
        assert!(err.is_signaling_error());
    }
}
