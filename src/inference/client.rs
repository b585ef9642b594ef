//! 上游推理服务客户端
//!
//! 非流式调用 `POST {url}/chat`，按 `RetryPolicy` 重试；
//! 流式调用 `POST {url}/chat/stream`，开始读取后不再重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

use crate::common::{LOG_BODY_LIMIT, truncate_for_log};
use crate::error::GatewayError;
use crate::http_client::build_client;
use crate::model::config::UpstreamConfig;

use super::retry::{RetryPolicy, Sleeper, TokioSleeper};
use super::sse::{FragmentStream, decode_stream};
use super::types::{InferenceRequest, UpstreamReply};

/// 上游探活超时
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// 推理后端
///
/// 编排器只依赖这个 trait，测试中使用手写的 mock
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// 阻塞式推理（含重试）
    async fn complete(&self, request: &InferenceRequest) -> Result<UpstreamReply, GatewayError>;

    /// 流式推理，返回惰性片段流
    async fn stream(&self, request: &InferenceRequest) -> Result<FragmentStream, GatewayError>;

    /// 上游 `/health` 是否返回 2xx
    async fn health(&self) -> bool;
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, proxy_url: Option<&str>) -> anyhow::Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let stream_timeout = Duration::from_secs(config.stream_timeout_secs);
        let client = build_client(proxy_url, request_timeout.max(stream_timeout))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            retry: RetryPolicy::exponential(
                config.max_attempts,
                Duration::from_millis(config.retry_base_delay_ms),
            ),
            sleeper: Arc::new(TokioSleeper),
            request_timeout,
            stream_timeout,
        })
    }

    /// 替换重试等待实现
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_timeouts(mut self, request_timeout: Duration, stream_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.stream_timeout = stream_timeout;
        self
    }

    fn post(&self, path: &str, body: &InferenceRequest, timeout: Duration) -> RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn error_from_response(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status, "上游返回错误: {}", truncate_for_log(&body, LOG_BODY_LIMIT));
        GatewayError::UpstreamError {
            status,
            message: truncate_for_log(&body, LOG_BODY_LIMIT),
        }
    }
}

#[async_trait]
impl InferenceBackend for UpstreamClient {
    async fn complete(&self, request: &InferenceRequest) -> Result<UpstreamReply, GatewayError> {
        let (attempts, value) = self
            .retry
            .execute(self.sleeper.as_ref(), |attempt| {
                let req = self.post("/chat", request, self.request_timeout);
                async move {
                    tracing::debug!(attempt, "调用上游 /chat");
                    let response = req.send().await?;
                    if !response.status().is_success() {
                        return Err(Self::error_from_response(response).await);
                    }
                    Ok((attempt, response.json::<Value>().await?))
                }
            })
            .await?;

        let mut reply = UpstreamReply::from_value(&value)?;
        reply.attempts = attempts;
        Ok(reply)
    }

    async fn stream(&self, request: &InferenceRequest) -> Result<FragmentStream, GatewayError> {
        let response = self
            .post("/chat/stream", request, self.stream_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(decode_stream(response.bytes_stream()))
    }

    async fn health(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("上游探活失败: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::retry::testing::RecordingSleeper;
    use crate::inference::sse::StreamEvent;
    use crate::test_support::{closed_addr, spawn_app};
    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
    };
    use futures::StreamExt;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Default)]
    struct Stub {
        hits: Arc<AtomicU32>,
        /// 前 N 次返回 500
        fail_first: u32,
    }

    async fn chat(State(stub): State<Stub>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
        let n = stub.hits.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= stub.fail_first {
            return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
        }
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Json(json!({
            "response": format!("echo: {}", body["prompt"].as_str().unwrap_or_default()),
            "tokens_used": 7,
            "conversation_id": body["conversation_id"],
            "personality_used": body["personality"],
            "auth": auth,
        }))
        .into_response()
    }

    async fn slow(State(stub): State<Stub>) -> impl IntoResponse {
        stub.hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Json(json!({"response": "too late"}))
    }

    async fn chat_stream() -> impl IntoResponse {
        (
            [("content-type", "text/event-stream")],
            "data: {\"response\":\"a\"}\n\ndata: {\"response\":\"b\"}\n\ndata: [DONE]\n\n",
        )
    }

    async fn spawn_stub(stub: Stub) -> SocketAddr {
        let app = Router::new()
            .route("/chat", post(chat))
            .route("/slow/chat", post(slow))
            .route("/chat/stream", post(chat_stream))
            .route("/down/chat/stream", post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .route("/health", get(|| async { "ok" }))
            .with_state(stub);
        spawn_app(app).await
    }

    fn client_for(url: String, sleeper: Arc<RecordingSleeper>) -> UpstreamClient {
        let config = UpstreamConfig {
            url,
            api_key: Some("upstream-key".into()),
            ..Default::default()
        };
        UpstreamClient::new(&config, None).unwrap().with_sleeper(sleeper)
    }

    fn request(prompt: &str) -> InferenceRequest {
        serde_json::from_value(json!({"prompt": prompt, "conversation_id": "conv_1"})).unwrap()
    }

    #[tokio::test]
    async fn test_complete_success_sends_bearer() {
        let stub = Stub::default();
        let addr = spawn_stub(stub.clone()).await;
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(format!("http://{}/", addr), sleeper.clone());

        let reply = client.complete(&request("hello")).await.unwrap();
        assert_eq!(reply.text, "echo: hello");
        assert_eq!(reply.tokens_used, Some(7));
        assert_eq!(reply.conversation_id.as_deref(), Some("conv_1"));
        assert_eq!(reply.personality_used.as_deref(), Some("helpful"));
        assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays.lock().is_empty());
    }

    #[tokio::test]
    async fn test_complete_retries_then_succeeds() {
        let stub = Stub {
            fail_first: 2,
            ..Default::default()
        };
        let addr = spawn_stub(stub.clone()).await;
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(format!("http://{}", addr), sleeper.clone());

        let reply = client.complete(&request("hello")).await.unwrap();
        assert_eq!(reply.text, "echo: hello");
        assert_eq!(reply.attempts, 3);
        assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeper.delays.lock(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_complete_gives_up_after_three_attempts() {
        let stub = Stub {
            fail_first: 100,
            ..Default::default()
        };
        let addr = spawn_stub(stub.clone()).await;
        let client = client_for(format!("http://{}", addr), Arc::new(RecordingSleeper::default()));

        let err = client.complete(&request("hello")).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::UpstreamError {
                status: 500,
                message: "boom".into()
            }
        );
        assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_complete_timeout() {
        let stub = Stub::default();
        let addr = spawn_stub(stub.clone()).await;
        let client = client_for(format!("http://{}/slow", addr), Arc::new(RecordingSleeper::default()))
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(100));

        let err = client.complete(&request("hello")).await.unwrap_err();
        assert_eq!(err, GatewayError::UpstreamTimeout);
        assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stream_fragments() {
        let addr = spawn_stub(Stub::default()).await;
        let client = client_for(format!("http://{}", addr), Arc::new(RecordingSleeper::default()));

        let events: Vec<_> = client.stream(&request("hello")).await.unwrap().collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Fragment("a".into()),
                StreamEvent::Fragment("b".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_non_2xx_is_not_retried() {
        let addr = spawn_stub(Stub::default()).await;
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(format!("http://{}/down", addr), sleeper.clone());

        let result = client.stream(&request("hello")).await;
        assert!(matches!(
            result,
            Err(GatewayError::UpstreamError { status: 503, .. })
        ));
        assert!(sleeper.delays.lock().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let addr = spawn_stub(Stub::default()).await;
        let client = client_for(format!("http://{}", addr), Arc::new(RecordingSleeper::default()));
        assert!(client.health().await);

        let down = client_for(
            format!("http://{}", closed_addr().await),
            Arc::new(RecordingSleeper::default()),
        );
        assert!(!down.health().await);
    }
}
