//! 网关 HTTP 处理器

use std::collections::BTreeMap;

use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
};
use futures::future::join_all;
use serde::Serialize;

use crate::error::GatewayError;
use crate::identity::Identity;

use super::forwarder::ForwardRequest;
use super::router::{GatewayState, route_service};

/// GET|POST|PUT|DELETE /api/{prefix}/*
/// 按路径前缀选择目标服务并转发
pub async fn proxy_handler(
    State(state): State<GatewayState>,
    Extension(identity): Extension<Identity>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let Some(service) = route_service(&path) else {
        return GatewayError::NotFound(format!("No route for {}", path)).into_response();
    };

    let request = ForwardRequest {
        method,
        path,
        query: uri.query().map(str::to_string),
        headers,
        body,
    };

    match state.forwarder.forward(service, request, &identity).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct GatewayHealth {
    pub status: &'static str,
    pub services: BTreeMap<String, &'static str>,
    pub timestamp: String,
}

/// GET /health
/// 并发探测每个服务的 `/health`
pub async fn health(State(state): State<GatewayState>) -> Json<GatewayHealth> {
    let probes = state.forwarder.targets().iter().map(|(name, base)| {
        let request = state
            .health_client
            .get(format!("{}/health", base))
            .timeout(state.health_timeout);
        async move {
            let healthy = match request.send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    tracing::warn!(service = %name, "健康检查失败: {}", e);
                    false
                }
            };
            (name.to_string(), if healthy { "healthy" } else { "unhealthy" })
        }
    });

    let services: BTreeMap<String, &'static str> = join_all(probes).await.into_iter().collect();
    let status = if services.values().all(|s| *s == "healthy") {
        "healthy"
    } else {
        "degraded"
    };

    Json(GatewayHealth {
        status,
        services,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /
pub async fn root(State(state): State<GatewayState>) -> impl IntoResponse {
    let services: Vec<&str> = state.forwarder.targets().iter().map(|(name, _)| name).collect();
    Json(serde_json::json!({
        "message": "Chat API Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "services": services,
    }))
}
