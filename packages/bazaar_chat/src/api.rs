//! Collaborators the chat core consumes: the credential source and the REST
//! API for conversation lists and message history.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ChatError, Result};
use crate::protocol::{
    ConversationSummary, CreateConversationRequest, CreateConversationResponse, Message,
};

/// Source of the bearer credential. Read once per connect attempt.
pub trait TokenStore: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Token store holding a fixed credential (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticTokenStore(Option<String>);

impl StaticTokenStore {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn empty() -> Self {
        Self(None)
    }
}

impl TokenStore for StaticTokenStore {
    fn token(&self) -> Option<String> {
        self.0.clone().filter(|t| !t.is_empty())
    }
}

/// REST collaborator. The chat core only reads from and updates what this
/// returns; it never originates conversation rows itself.
pub trait ChatApi: Send + Sync {
    fn list_conversations(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>>>;

    fn get_messages<'a>(
        &'a self,
        conversation_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>>>;

    fn create_conversation<'a>(
        &'a self,
        provider_id: &'a str,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<String>>;

    fn mark_read<'a>(&'a self, conversation_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// [`ChatApi`] over HTTP with bearer-token auth.
#[derive(Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self
            .tokens
            .token()
            .ok_or_else(|| ChatError::Auth("no credential available".to_string()))?;
        Ok(request.bearer_auth(token))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .authorized(request)?
            .send()
            .await
            .map_err(|e| ChatError::Api(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChatError::Auth("credential rejected by server".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body = %body, "api request failed");
            return Err(ChatError::Api(error_reason(status, &body)));
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Server errors carry `{"error": "..."}`; anything else is passed through.
fn error_reason(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body.to_string()
    }
}

fn api_error(err: reqwest::Error) -> ChatError {
    ChatError::Api(err.to_string())
}

impl ChatApi for HttpChatApi {
    fn list_conversations(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>>> {
        async move {
            let request = self.client.get(self.url("/api/conversations"));
            self.send(request).await?.json().await.map_err(api_error)
        }
        .boxed()
    }

    fn get_messages<'a>(
        &'a self,
        conversation_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>>> {
        async move {
            let request = self
                .client
                .get(self.url(&format!("/api/conversations/{conversation_id}/messages")))
                .query(&[("limit", limit)]);
            self.send(request).await?.json().await.map_err(api_error)
        }
        .boxed()
    }

    fn create_conversation<'a>(
        &'a self,
        provider_id: &'a str,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            let request = self
                .client
                .post(self.url("/api/conversations"))
                .json(&CreateConversationRequest {
                    provider_id: provider_id.to_string(),
                    service_id: service_id.to_string(),
                });
            let created: CreateConversationResponse =
                self.send(request).await?.json().await.map_err(api_error)?;
            Ok(created.conversation_id)
        }
        .boxed()
    }

    fn mark_read<'a>(&'a self, conversation_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let request = self
                .client
                .post(self.url(&format!("/api/conversations/{conversation_id}/read")));
            self.send(request).await?;
            Ok(())
        }
        .boxed()
    }
}
