//! 聊天服务 HTTP 处理器
//!
//! 身份来自网关注入的头，见 [`CallerIdentity`]。

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde_json::json;

use crate::error::GatewayError;
use crate::identity::CallerIdentity;

use super::router::ChatState;
use super::types::{ChatCreate, ChatUpdate, MessageCreate, MessageUpdate, SuccessResponse};

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| GatewayError::InvalidRequest(e.body_text()))
}

/// GET /api/chats
pub async fn list_chats(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
) -> Response {
    match state.service.list_chats(&identity).await {
        Ok(chats) => Json(chats).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/chats
pub async fn create_chat(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    payload: Result<Json<ChatCreate>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state.service.create_chat(&identity, request).await {
        Ok(chat) => Json(chat).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/chats/{chat_id}
pub async fn get_chat(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path(chat_id): Path<String>,
) -> Response {
    match state.service.get_chat(&identity, &chat_id).await {
        Ok(chat) => Json(chat).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PUT /api/chats/{chat_id}
/// 重命名聊天
pub async fn update_chat(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path(chat_id): Path<String>,
    payload: Result<Json<ChatUpdate>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state
        .service
        .rename_chat(&identity, &chat_id, &request.title)
        .await
    {
        Ok(chat) => Json(chat).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/chats/{chat_id}
/// 同时删除聊天内的全部消息
pub async fn delete_chat(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path(chat_id): Path<String>,
) -> Response {
    match state.service.delete_chat(&identity, &chat_id).await {
        Ok(()) => Json(SuccessResponse::new("Chat deleted successfully")).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/chats/{chat_id}/messages
pub async fn list_messages(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path(chat_id): Path<String>,
) -> Response {
    match state.service.list_messages(&identity, &chat_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/chats/{chat_id}/messages
/// 发送消息，返回助手回复
pub async fn send_message(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path(chat_id): Path<String>,
    payload: Result<Json<MessageCreate>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state.service.send_message(&identity, &chat_id, request).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PUT /api/chats/{chat_id}/messages/{message_id}
pub async fn update_message(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path((chat_id, message_id)): Path<(String, String)>,
    payload: Result<Json<MessageUpdate>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    match state
        .service
        .update_message(&identity, &chat_id, &message_id, &request.content)
        .await
    {
        Ok(message) => Json(message).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/chats/{chat_id}/messages/{message_id}
pub async fn delete_message(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> Response {
    match state
        .service
        .delete_message(&identity, &chat_id, &message_id)
        .await
    {
        Ok(()) => Json(SuccessResponse::new("Message deleted successfully")).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/chats/{chat_id}/stream
/// 以 SSE 推送助手回复
pub async fn stream_message(
    State(state): State<ChatState>,
    CallerIdentity(identity): CallerIdentity,
    Path(chat_id): Path<String>,
    payload: Result<Json<MessageCreate>, JsonRejection>,
) -> Response {
    let request = match body(payload) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let events = match state
        .service
        .stream_message(&identity, &chat_id, request)
        .await
    {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let events = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "chat-service",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "Chat Service",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}
