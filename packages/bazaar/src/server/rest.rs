//! REST surface for conversation lists and history.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bazaar_chat::protocol::{CreateConversationRequest, CreateConversationResponse};
use bazaar_chat::{ConversationSummary, Message};
use serde::Deserialize;

use super::AppState;
use super::store::StoreError;
use crate::metrics::HealthStatus;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

/// Caller identity from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl axum::extract::FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .and_then(|token| state.auth.resolve(token))
            .map(AuthUser)
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({"error": "Authentication required"})),
                )
            })
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match self {
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::NotParticipant => StatusCode::FORBIDDEN,
            StoreError::Archived => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Json<Vec<ConversationSummary>> {
    Json(state.store.list_for(&user_id).await)
}

pub async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateConversationRequest>,
) -> Result<Json<CreateConversationResponse>, StoreError> {
    let conversation_id = state
        .store
        .create_conversation(&user_id, &request.provider_id, &request.service_id)
        .await?;
    tracing::info!(
        conversation = %conversation_id,
        customer = %user_id,
        provider = %request.provider_id,
        "conversation opened"
    );
    Ok(Json(CreateConversationResponse { conversation_id }))
}

pub async fn get_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, StoreError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Ok(Json(state.store.messages(&id, &user_id, limit).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, StoreError> {
    state.store.mark_read(&id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn archive(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, StoreError> {
    state.store.archive(&id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Health check endpoint - returns server status and metrics
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    let status = if metrics.frames.dropped == 0 {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthStatus {
        status: status.to_string(),
        conversations: state.store.conversation_count().await as u64,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::server::test_state;

    async fn call(
        state: &AppState,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = crate::server::router(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let state = test_state();
        let (status, body) = call(&state, "GET", "/api/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Authentication required");
    }

    #[tokio::test]
    async fn test_create_list_and_read_flow() {
        let state = test_state();
        let (status, created) = call(
            &state,
            "POST",
            "/api/conversations",
            Some("alice"),
            Some(serde_json::json!({"providerId": "bob", "serviceId": "svc-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created["conversationId"].as_str().unwrap().to_string();

        state
            .store
            .append(&id, "alice", "hello", bazaar_chat::MessageType::Text, None)
            .await
            .unwrap();

        let (status, list) = call(&state, "GET", "/api/conversations", Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list[0]["id"], id.as_str());
        assert_eq!(list[0]["otherParty"], "alice");
        assert_eq!(list[0]["unreadCount"], 1);
        assert_eq!(list[0]["lastMessageText"], "hello");

        let uri = format!("/api/conversations/{id}/messages?limit=10");
        let (status, messages) = call(&state, "GET", &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages[0]["content"], "hello");
        assert_eq!(messages[0]["type"], "text");

        let uri = format!("/api/conversations/{id}/read");
        let (status, _) = call(&state, "POST", &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, list) = call(&state, "GET", "/api/conversations", Some("bob"), None).await;
        assert_eq!(list[0]["unreadCount"], 0);
    }

    #[tokio::test]
    async fn test_store_errors_map_to_status() {
        let state = test_state();
        let (status, body) = call(
            &state,
            "GET",
            "/api/conversations/nope/messages",
            Some("alice"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "conversation not found");

        let id = state
            .store
            .create_conversation("alice", "bob", "svc-1")
            .await
            .unwrap();
        let uri = format!("/api/conversations/{id}/messages");
        let (status, body) = call(&state, "GET", &uri, Some("carol"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "not a participant");

        let (status, _) = call(
            &state,
            "POST",
            "/api/conversations",
            Some("alice"),
            Some(serde_json::json!({"providerId": "alice", "serviceId": "svc-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = test_state();
        state
            .store
            .create_conversation("alice", "bob", "svc-1")
            .await
            .unwrap();
        let (status, body) = call(&state, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["conversations"], 1);
        assert_eq!(body["metrics"]["connections"]["active"], 0);
    }
}
