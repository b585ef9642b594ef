//! 请求转发器
//!
//! 服务名解析 -> 速率限制 -> 改写请求头 -> 转发 -> 原样回传状态码和响应头。
//! 任何一步被拒绝都不会发出网络请求；转发失败不重试。

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{self, InvalidHeaderValue},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;

use crate::error::GatewayError;
use crate::identity::{Identity, USER_EMAIL_HEADER, USER_ID_HEADER};
use crate::rate_limit::RateLimiter;

#[cfg(feature = "sensitive-logs")]
use crate::common::{LOG_BODY_LIMIT, truncate_for_log};

use super::targets::ForwardTargets;

/// 请求关联 ID 头；客户端未提供时由网关生成
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 逐跳头，不能跨连接转发
static HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// 待转发的入站请求
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// 原始路径（含 `/api/...` 前缀）
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 回传给客户端的响应体
#[derive(Debug)]
pub enum ForwardBody {
    /// 已完整读取（并按需改写）的响应体
    Full(Bytes),
    /// `text/event-stream` 逐块透传，客户端断开时随之丢弃上游连接
    Stream(Body),
}

/// 目标服务的响应
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ForwardBody,
}

impl IntoResponse for ForwardResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            ForwardBody::Full(bytes) => Body::from(bytes),
            ForwardBody::Stream(body) => body,
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub struct Forwarder {
    targets: Arc<ForwardTargets>,
    limiter: Arc<dyn RateLimiter>,
    client: Client,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(
        targets: Arc<ForwardTargets>,
        limiter: Arc<dyn RateLimiter>,
        client: Client,
        timeout: Duration,
    ) -> Self {
        Self {
            targets,
            limiter,
            client,
            timeout,
        }
    }

    pub fn targets(&self) -> &ForwardTargets {
        &self.targets
    }

    /// 转发请求到指定服务
    ///
    /// `timeout` 约束等待响应头和读取普通响应体；流式响应只受 client 的整体超时约束。
    pub async fn forward(
        &self,
        service: &str,
        request: ForwardRequest,
        identity: &Identity,
    ) -> Result<ForwardResponse, GatewayError> {
        let base = self
            .targets
            .resolve(service)
            .ok_or_else(|| GatewayError::UnknownService(service.to_string()))?;

        let endpoint = format!("{}:{}", service, request.path);
        if !self.limiter.allow(&identity.id, &endpoint) {
            tracing::warn!(user = %identity.id, endpoint = %endpoint, "超出速率限制");
            return Err(GatewayError::RateLimited);
        }

        let mut url = format!("{}{}", base, request.path);
        if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        let request_id = request
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let headers = outbound_headers(&request.headers, identity, &request_id)?;

        tracing::debug!(
            service = %service,
            request_id = %request_id,
            method = %request.method,
            url = %url,
            "转发请求"
        );
        #[cfg(feature = "sensitive-logs")]
        tracing::debug!(
            "转发请求体: {}",
            truncate_for_log(&String::from_utf8_lossy(&request.body), LOG_BODY_LIMIT)
        );

        let deadline = tokio::time::Instant::now() + self.timeout;
        let send = self
            .client
            .request(request.method, &url)
            .headers(headers)
            .body(request.body)
            .send();
        let response = match tokio::time::timeout_at(deadline, send).await {
            Ok(result) => result.map_err(|e| {
                let err = GatewayError::from(e);
                tracing::error!(service = %service, url = %url, "转发失败: {}", err);
                err
            })?,
            Err(_) => {
                tracing::error!(service = %service, url = %url, "转发超时");
                return Err(GatewayError::UpstreamTimeout);
            }
        };

        let status = response.status();
        let upstream_headers = response.headers().clone();

        if is_event_stream(&upstream_headers) {
            tracing::info!(
                service = %service,
                request_id = %request_id,
                status = status.as_u16(),
                "开始透传流式响应"
            );
            return Ok(ForwardResponse {
                status,
                headers: relay_headers(&upstream_headers),
                body: ForwardBody::Stream(Body::from_stream(response.bytes_stream())),
            });
        }

        let body = match tokio::time::timeout_at(deadline, response.bytes()).await {
            Ok(result) => result.map_err(|e| {
                let err = GatewayError::from(e);
                tracing::error!(service = %service, url = %url, "读取响应体失败: {}", err);
                err
            })?,
            Err(_) => {
                tracing::error!(service = %service, url = %url, "读取响应体超时");
                return Err(GatewayError::UpstreamTimeout);
            }
        };

        tracing::info!(
            service = %service,
            request_id = %request_id,
            status = status.as_u16(),
            "转发完成"
        );
        #[cfg(feature = "sensitive-logs")]
        tracing::debug!(
            "目标服务响应体: {}",
            truncate_for_log(&String::from_utf8_lossy(&body), LOG_BODY_LIMIT)
        );

        Ok(relay_response(status, &upstream_headers, body))
    }
}

/// 出站请求头：去掉 host、逐跳头和长度相关头，注入调用方身份（覆盖客户端传入的同名头）
fn outbound_headers(
    inbound: &HeaderMap,
    identity: &Identity,
    request_id: &str,
) -> Result<HeaderMap, GatewayError> {
    let mut headers = inbound.clone();
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::ACCEPT_ENCODING);
    for name in HOP_BY_HOP_HEADERS.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");

    let invalid = |_: InvalidHeaderValue| {
        GatewayError::InvalidRequest("Identity cannot be encoded as a header".to_string())
    };
    headers.insert(USER_ID_HEADER, HeaderValue::from_str(&identity.id).map_err(invalid)?);
    headers.insert(USER_EMAIL_HEADER, HeaderValue::from_str(&identity.email).map_err(invalid)?);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    Ok(headers)
}

fn content_type_is(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with(mime))
}

fn is_json(headers: &HeaderMap) -> bool {
    content_type_is(headers, "application/json")
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    content_type_is(headers, "text/event-stream")
}

/// 回传的响应头：去掉长度和逐跳头
fn relay_headers(upstream_headers: &HeaderMap) -> HeaderMap {
    let mut headers = upstream_headers.clone();
    headers.remove(header::CONTENT_LENGTH);
    for name in HOP_BY_HOP_HEADERS.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

/// 构造回传给客户端的响应
///
/// JSON 响应解析后重新序列化；其他内容包装为 `{"data": "<text>"}`；
/// 声明为 JSON 但无法解析的响应体原样回传。
fn relay_response(status: StatusCode, upstream_headers: &HeaderMap, body: Bytes) -> ForwardResponse {
    let mut headers = relay_headers(upstream_headers);

    let body = if is_json(upstream_headers) {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => Bytes::from(bytes),
                Err(_) => body,
            },
            Err(e) => {
                tracing::debug!("目标服务返回的 JSON 无法解析，原样回传: {}", e);
                body
            }
        }
    } else {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let wrapped = serde_json::json!({ "data": String::from_utf8_lossy(&body) });
        Bytes::from(wrapped.to_string())
    };

    ForwardResponse {
        status,
        headers,
        body: ForwardBody::Full(body),
    }
}
