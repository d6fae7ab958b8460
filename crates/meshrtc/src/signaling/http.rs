//! HTTP signaling client
//!
//! # Protocol
//!
//! - POST `{base}/offer` with [`RegisterOfferRequest`] registers an offer
//! - POST `{base}/offer` with a JSON array of [`AnswerSubmission`] submits answers
//! - GET `{base}/offer/{sdp_id}` polls for an answer; 204 means none yet. The
//!   answer comes back base64 encoded
//!
//! Every request carries `Authorization: Bearer <token>`, `X-Client-Id` and
//! `Accept: application/json`.

use super::model::{AnswerInfo, AnswerSubmission, OfferRegistration, RegisterOfferRequest};
use super::SignalingClient;
use crate::auth::TokenProvider;
use crate::config::SignalingConfig;
use crate::types::Role;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Header identifying the calling client
pub const CLIENT_ID_HEADER: &str = "X-Client-Id";

/// Signaling client for the HTTP offer/answer service
pub struct HttpSignalingClient {
    /// Base URL without trailing slash
    base_url: String,

    /// Identity sent with every request
    client_id: Uuid,

    /// Bearer token source
    tokens: Arc<dyn TokenProvider>,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

impl HttpSignalingClient {
    /// Create a new signaling client
    ///
    /// # Arguments
    ///
    /// * `config` - Base URL, client identity and request timeout
    /// * `tokens` - Bearer token source
    pub fn new(config: &SignalingConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "Signaling base_url must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::SignalingError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            client_id: config.client_id.unwrap_or_else(Uuid::new_v4),
            tokens,
            client,
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, "application/json")
            .header(CLIENT_ID_HEADER, self.client_id.to_string()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::SignalingError(format!("Malformed {}: {}", what, e)))
    }
}

#[async_trait]
impl SignalingClient for HttpSignalingClient {
    fn client_id(&self) -> Uuid {
        self.client_id
    }

    #[instrument(skip(self, offer_sdp, established_clients), fields(established = established_clients.len()))]
    async fn register_offer(
        &self,
        role: Role,
        offer_sdp: &str,
        established_clients: &[Uuid],
    ) -> Result<OfferRegistration> {
        let body = RegisterOfferRequest::new(role, offer_sdp, established_clients);
        let request = self.request(Method::POST, "/offer").await?.json(&body);
        let response = self.send(request).await?;
        let registration: OfferRegistration = Self::parse(response, "offer registration").await?;

        debug!(
            sdp_id = %registration.registered_offer.sdp_id,
            received = registration.received_offer_array.len(),
            "Offer registered"
        );
        Ok(registration)
    }

    async fn register_answers(&self, answers: &[AnswerSubmission]) -> Result<()> {
        let request = self.request(Method::POST, "/offer").await?.json(answers);
        self.send(request).await?;
        debug!(count = answers.len(), "Answers registered");
        Ok(())
    }

    async fn poll_answer(&self, sdp_id: Uuid) -> Result<Option<AnswerInfo>> {
        let request = self
            .request(Method::GET, &format!("/offer/{}", sdp_id))
            .await?;
        let response = self.send(request).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let answer = Self::parse::<AnswerInfo>(response, "answer")
            .await?
            .decode_answer();
        if answer.sdp_id != sdp_id {
            return Err(Error::SignalingError(format!(
                "Answer for {} returned while polling {}",
                answer.sdp_id, sdp_id
            )));
        }
        Ok(Some(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::signaling::model::OfferInfo;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, client_id: Uuid) -> HttpSignalingClient {
        let config = SignalingConfig {
            base_url: format!("{}/", server.uri()),
            client_id: Some(client_id),
            request_timeout_secs: 5,
        };
        HttpSignalingClient::new(&config, Arc::new(StaticTokenProvider::new("tok"))).unwrap()
    }

    #[tokio::test]
    async fn test_register_offer_sends_headers_and_body() {
        let server = MockServer::start().await;
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let established = Uuid::new_v4();

        let registered = OfferInfo::new(Uuid::new_v4(), me, Role::Provider, "mine");
        let received = OfferInfo::new(Uuid::new_v4(), peer, Role::Subscriber, "theirs");

        Mock::given(method("POST"))
            .and(path("/offer"))
            .and(header("authorization", "Bearer tok"))
            .and(header("x-client-id", me.to_string().as_str()))
            .and(header("accept", "application/json"))
            .and(body_json(json!({
                "role": "provider",
                "offer": "bWluZQ==",
                "established_clients": [established],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "registered_offer": registered,
                "received_offer_array": [received],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let registration = client(&server, me)
            .register_offer(Role::Provider, "mine", &[established])
            .await
            .unwrap();

        assert_eq!(registration.registered_offer.sdp_id, registered.sdp_id);
        assert_eq!(registration.received_offer_array.len(), 1);
        assert_eq!(
            registration.received_offer_array[0].offer_sdp().unwrap(),
            "theirs"
        );
    }

    #[tokio::test]
    async fn test_register_answers_posts_array() {
        let server = MockServer::start().await;
        let answers = vec![
            AnswerSubmission {
                sdp_id: Uuid::new_v4(),
                answer: "a1".to_string(),
            },
            AnswerSubmission {
                sdp_id: Uuid::new_v4(),
                answer: "a2".to_string(),
            },
        ];

        Mock::given(method("POST"))
            .and(path("/offer"))
            .and(body_json(json!(answers)))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, Uuid::new_v4())
            .register_answers(&answers)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_answer_no_content() {
        let server = MockServer::start().await;
        let sdp_id = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path(format!("/offer/{}", sdp_id)))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let answer = client(&server, Uuid::new_v4())
            .poll_answer(sdp_id)
            .await
            .unwrap();
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn test_poll_answer_decodes_base64_answer() {
        let server = MockServer::start().await;
        let sdp_id = Uuid::new_v4();
        let answerer = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path(format!("/offer/{}", sdp_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sdp_id": sdp_id,
                "answer_client_id": answerer,
                "answer": "dj0wIGFuc3dlcg==",
            })))
            .mount(&server)
            .await;

        let answer = client(&server, Uuid::new_v4())
            .poll_answer(sdp_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.answer_client_id, answerer);
        assert_eq!(answer.answer, "v=0 answer");
    }

    #[tokio::test]
    async fn test_poll_answer_plain_answer_passes_through() {
        let server = MockServer::start().await;
        let sdp_id = Uuid::new_v4();
        let answerer = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path(format!("/offer/{}", sdp_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sdp_id": sdp_id,
                "answer_client_id": answerer,
                "answer": "v=0 answer",
            })))
            .mount(&server)
            .await;

        let answer = client(&server, Uuid::new_v4())
            .poll_answer(sdp_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.answer_client_id, answerer);
        assert_eq!(answer.answer, "v=0 answer");
    }

    #[tokio::test]
    async fn test_server_error_is_signaling_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/offer"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server, Uuid::new_v4())
            .register_offer(Role::Subscriber, "x", &[])
            .await
            .unwrap_err();

        match &err {
            Error::HttpStatus { status, body } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.is_signaling_error());
    }

    #[tokio::test]
    async fn test_malformed_registration_is_signaling_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/offer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
            .mount(&server)
            .await;

        let err = client(&server, Uuid::new_v4())
            .register_offer(Role::Provider, "x", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignalingError(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = SignalingConfig {
            base_url: "https://signal.example.com/api/".to_string(),
            client_id: None,
            request_timeout_secs: 5,
        };
        let client =
            HttpSignalingClient::new(&config, Arc::new(StaticTokenProvider::new("t"))).unwrap();
        assert_eq!(client.base_url(), "https://signal.example.com/api");
    }
}
