//! AI 服务 HTTP 处理器

use std::convert::Infallible;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde_json::json;

use crate::error::GatewayError;
use crate::identity::USER_ID_HEADER;
use crate::inference::{InferenceRequest, StreamEvent};

use super::router::AiState;

/// 解析请求体；未显式给出 user_id 时使用网关注入的身份
fn parse_request(
    headers: &HeaderMap,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> Result<InferenceRequest, GatewayError> {
    let Json(mut request) = payload.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    if request.user_id.is_none() {
        request.user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    Ok(request)
}

/// POST /inference
/// POST /multimodal
/// 阻塞式推理，多模态请求用 `text` 字段携带文本
pub async fn inference(
    State(state): State<AiState>,
    headers: HeaderMap,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> Response {
    let request = match parse_request(&headers, payload) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    match state.orchestrator.infer(request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /inference/stream
/// 以 SSE 推送片段：`{"response": "..."}`，结束时 `[DONE]`，出错时 `{"error", "partial", "done": true}`
pub async fn inference_stream(
    State(state): State<AiState>,
    headers: HeaderMap,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> Response {
    let request = match parse_request(&headers, payload) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let mut fragments = match state.orchestrator.infer_stream(request).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let events = async_stream::stream! {
        while let Some(event) = fragments.next().await {
            match event {
                StreamEvent::Fragment(text) => {
                    yield Ok::<_, Infallible>(Event::default().data(json!({ "response": text }).to_string()));
                }
                StreamEvent::Error { error, partial } => {
                    let payload = json!({ "error": error.to_string(), "partial": partial, "done": true });
                    yield Ok(Event::default().data(payload.to_string()));
                    return;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// GET /metrics
pub async fn metrics(State(state): State<AiState>) -> impl IntoResponse {
    Json(json!({
        "service": "ai-service",
        "metrics": state.orchestrator.metrics(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /health
/// 探测上游推理服务
pub async fn health(State(state): State<AiState>) -> impl IntoResponse {
    let upstream_healthy = state.orchestrator.upstream_healthy().await;
    Json(json!({
        "status": if upstream_healthy { "healthy" } else { "degraded" },
        "model_loaded": upstream_healthy,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "AI Service",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": ["/inference", "/inference/stream", "/multimodal", "/health", "/metrics"],
    }))
}
