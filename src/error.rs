//! 请求路径上的错误分类
//!
//! 网关、聊天服务和 AI 服务共用同一套错误类型，
//! 每个变体映射到一个固定的 HTTP 状态码和 `error.type` 字符串。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// API 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// 错误详情
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// 网关错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// 缺少或无效的凭据 (401)
    Unauthenticated(String),
    /// 身份无权访问该资源 (403)
    Forbidden(String),
    /// 路由表中不存在的服务 (404)
    UnknownService(String),
    /// 资源不存在 (404)
    NotFound(String),
    /// 请求体不合法 (400)
    InvalidRequest(String),
    /// 超出速率限制 (429)
    RateLimited,
    /// 上游超时 (504)
    UpstreamTimeout,
    /// 上游返回非 2xx
    UpstreamError { status: u16, message: String },
    /// 无法连接目标服务 (503)
    ServiceUnavailable(String),
    /// 其他内部错误 (500)
    InternalError(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::UnknownService(_) | GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamError { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "authentication_error",
            GatewayError::Forbidden(_) => "permission_error",
            GatewayError::UnknownService(_) => "unknown_service",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::RateLimited => "rate_limit_error",
            GatewayError::UpstreamTimeout => "timeout_error",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::ServiceUnavailable(_) => "service_unavailable",
            GatewayError::InternalError(_) => "internal_error",
        }
    }

    pub fn to_response_body(&self) -> ErrorResponse {
        ErrorResponse::new(self.error_type(), self.to_string())
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Unauthenticated(msg) => write!(f, "{}", msg),
            GatewayError::Forbidden(msg) => write!(f, "{}", msg),
            GatewayError::UnknownService(name) => write!(f, "Service {} not found", name),
            GatewayError::NotFound(msg) => write!(f, "{}", msg),
            GatewayError::InvalidRequest(msg) => write!(f, "{}", msg),
            GatewayError::RateLimited => write!(f, "Rate limit exceeded"),
            GatewayError::UpstreamTimeout => write!(f, "Upstream timeout"),
            GatewayError::UpstreamError { status, message } => {
                write!(f, "Upstream error (HTTP {}): {}", status, message)
            }
            GatewayError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            GatewayError::InternalError(msg) => write!(f, "Internal server error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// reqwest 传输层错误映射：超时 -> 504，连接失败 -> 503，其他 -> 500
impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::UpstreamTimeout
        } else if e.is_connect() {
            GatewayError::ServiceUnavailable(e.to_string())
        } else {
            GatewayError::InternalError(e.to_string())
        }
    }
}

/// 存储层错误一律视为内部错误
impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        GatewayError::InternalError(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_response_body())).into_response()
    }
}
