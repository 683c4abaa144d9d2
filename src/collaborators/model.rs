use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::anthropic::{AnthropicError, Message, MessageSender, MessagesRequest};
use crate::error::CollaboratorError;

/// Which model class a step needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheap and quick: classification, short answers.
    Fast,
    /// Long-form generation: syllabi, lesson exposition.
    Large,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, tier: ModelTier) -> Result<String, CollaboratorError>;
}

/// [`LanguageModel`] over the Anthropic Messages API.
pub struct AnthropicModel<C> {
    client: C,
    fast_model: String,
    large_model: String,
    max_tokens: u32,
}

impl<C: MessageSender> AnthropicModel<C> {
    pub fn new(client: C, fast_model: String, large_model: String, max_tokens: u32) -> Self {
        Self {
            client,
            fast_model,
            large_model,
            max_tokens,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Large => &self.large_model,
        }
    }
}

#[async_trait]
impl<C: MessageSender> LanguageModel for AnthropicModel<C> {
    async fn complete(&self, prompt: &str, tier: ModelTier) -> Result<String, CollaboratorError> {
        let req = MessagesRequest {
            model: self.model_for(tier).to_string(),
            max_tokens: self.max_tokens,
            system: None,
            messages: vec![Message {
                role: "user".into(),
                content: prompt.to_string(),
            }],
        };

        let response = self.client.send_message(&req).await?;
        debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "model call finished"
        );

        let text = response.text();
        if text.trim().is_empty() {
            return Err(AnthropicError::EmptyResponse {
                stop_reason: response.stop_reason.unwrap_or_else(|| "none".into()),
            }
            .into());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{ContentBlock, MessagesResponse, Usage};
    use std::sync::Mutex;

    struct MockClient {
        reply: Option<String>,
        models: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn replying(text: Option<&str>) -> Self {
            Self {
                reply: text.map(str::to_string),
                models: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageSender for MockClient {
        async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
            self.models.lock().unwrap().push(req.model.clone());
            match &self.reply {
                Some(text) => Ok(MessagesResponse {
                    id: "mock".into(),
                    content: vec![ContentBlock {
                        content_type: "text".into(),
                        text: text.clone(),
                    }],
                    model: req.model.clone(),
                    stop_reason: Some("end_turn".into()),
                    usage: Usage {
                        input_tokens: 1,
                        output_tokens: 1,
                    },
                }),
                None => Err(AnthropicError::ApiError {
                    status: 500,
                    message: "mock error".into(),
                }),
            }
        }
    }

    fn model(client: MockClient) -> AnthropicModel<MockClient> {
        AnthropicModel::new(client, "fast-model".into(), "large-model".into(), 1024)
    }

    #[tokio::test]
    async fn tier_selects_model() {
        let m = model(MockClient::replying(Some("ok")));
        m.complete("a", ModelTier::Fast).await.unwrap();
        m.complete("b", ModelTier::Large).await.unwrap();
        assert_eq!(*m.client.models.lock().unwrap(), vec!["fast-model", "large-model"]);
    }

    #[tokio::test]
    async fn api_errors_map_to_model_errors() {
        let err = model(MockClient::replying(None))
            .complete("a", ModelTier::Fast)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Model(ref m) if m.contains("status 500")));
    }

    #[tokio::test]
    async fn blank_reply_is_an_error() {
        let err = model(MockClient::replying(Some("   ")))
            .complete("a", ModelTier::Large)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Model(_)));
    }
}
