//! Cliente HTTP para o endpoint `v1/messages` da Anthropic.
//!
//! [`MessageSender`] é o ponto de injeção usado pelo modelo de linguagem;
//! nos testes ele é substituído por mocks ou por um servidor `wiremock`.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use super::error::AnthropicError;
use super::types::{MessagesRequest, MessagesResponse};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Qualquer coisa capaz de enviar uma requisição Messages e devolver a resposta.
pub trait MessageSender: Send + Sync {
    fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> impl Future<Output = Result<MessagesResponse, AnthropicError>> + Send;
}

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Cria um cliente apontando para uma URL base customizada (útil para testes).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }
}

impl MessageSender for AnthropicClient {
    async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
        debug!(model = %req.model, max_tokens = req.max_tokens, "sending messages request");
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            warn!(retry_after_ms = retry_after, "anthropic rate limit hit");
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::types::Message;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> MessagesRequest {
        MessagesRequest {
            model: "claude-haiku-4-5".into(),
            max_tokens: 256,
            system: None,
            messages: vec![Message {
                role: "user".into(),
                content: "Olá".into(),
            }],
        }
    }

    async fn client_for(server: &MockServer) -> AnthropicClient {
        AnthropicClient::with_base_url("sk-test".into(), format!("{}/v1/messages", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn send_message_parses_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "{\"ok\": true}"}],
                "model": "claude-haiku-4-5",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 3, "output_tokens": 4}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resp = client_for(&server).await.send_message(&request()).await.unwrap();
        assert_eq!(resp.id, "msg_1");
        assert_eq!(resp.text(), "{\"ok\": true}");
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.send_message(&request()).await.unwrap_err();
        assert!(matches!(err, AnthropicError::RateLimited { retry_after_ms: 7000 }));
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.send_message(&request()).await.unwrap_err();
        match err {
            AnthropicError::ApiError { status, message } => {
                assert_eq!(status, 529);
                assert_eq!(message, "overloaded");
            }
            other => panic!("expected ApiError, got {other:?}"),
        }
    }
}
