//! 推理编排
//!
//! 由聊天消息构造推理请求，调用后端（阻塞或流式），维护聚合指标并归一化应答。
//!
//! 单次调用的状态：
//! `Pending -> Requesting -> {Succeeded, Retrying -> Requesting, Failed}`，
//! 最多重入两次。流式调用在至少发出一个片段后中断为 `StreamedPartial`，
//! 一个片段都没有则为 `Failed`。

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use crate::error::GatewayError;
use crate::model::config::UpstreamConfig;

use super::client::InferenceBackend;
use super::metrics::{LatencyAverage, Metrics, MetricsSnapshot};
use super::sse::{FragmentStream, StreamEvent};
use super::types::{ChatMessage, DEFAULT_PERSONALITY, InferenceRequest, InferenceResult};

/// 单次推理调用的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Requesting,
    Retrying,
    Succeeded,
    Failed,
    StreamedPartial,
}

impl CallState {
    /// 流式调用出错后的终止状态
    pub fn after_stream_error(partial: bool) -> Self {
        if partial {
            CallState::StreamedPartial
        } else {
            CallState::Failed
        }
    }
}

pub struct Orchestrator {
    backend: Arc<dyn InferenceBackend>,
    metrics: Arc<Metrics>,
    max_new_tokens: u32,
    temperature: f32,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: &UpstreamConfig) -> Self {
        Self {
            backend,
            metrics: Arc::new(Metrics::new(LatencyAverage::from_legacy_flag(
                config.legacy_latency_average,
            ))),
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
        }
    }

    /// 由一条聊天消息构造推理请求
    pub fn build_request(&self, message: &ChatMessage) -> InferenceRequest {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        InferenceRequest {
            prompt: Some(message.content.clone()).filter(|s| !s.is_empty()),
            image_url: non_empty(&message.image_url),
            audio_url: non_empty(&message.audio_url),
            video_url: non_empty(&message.video_url),
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            personality: message
                .personality
                .clone()
                .unwrap_or_else(|| DEFAULT_PERSONALITY.to_string()),
            enable_functions: message.enable_functions,
            conversation_id: message.conversation_id.clone(),
            user_id: message.user_id.clone(),
        }
    }

    pub async fn respond(&self, message: &ChatMessage) -> Result<InferenceResult, GatewayError> {
        self.infer(self.build_request(message)).await
    }

    /// 阻塞式推理
    ///
    /// 成功：请求数 +1、累加 token、更新平均延迟、记录时间；失败：错误数 +1 并返回错误。
    /// 请求本身不合法时直接拒绝，不计入指标。
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResult, GatewayError> {
        request.validate()?;
        tracing::debug!(state = ?CallState::Pending, multimodal = request.is_multimodal(), "推理请求已构造");

        let start = Instant::now();
        tracing::debug!(state = ?CallState::Requesting, "开始推理");
        match self.backend.complete(&request).await {
            Ok(reply) => {
                let latency = start.elapsed();
                self.metrics
                    .record_success(reply.tokens_used.unwrap_or(0), latency);
                tracing::debug!(
                    state = ?CallState::Succeeded,
                    attempts = reply.attempts,
                    latency_ms = latency.as_millis() as u64,
                    tokens = reply.tokens_used.unwrap_or(0),
                    "推理完成"
                );
                Ok(InferenceResult::from_reply(reply, latency))
            }
            Err(e) => {
                self.metrics.record_error();
                tracing::error!(state = ?CallState::Failed, "推理失败: {}", e);
                Err(e)
            }
        }
    }

    pub async fn respond_stream(&self, message: &ChatMessage) -> Result<FragmentStream, GatewayError> {
        self.infer_stream(self.build_request(message)).await
    }

    /// 流式推理
    ///
    /// 建立连接失败时直接返回错误；之后的中断以终止事件的形式出现在流里。
    /// 流正常结束时请求数 +1 并更新延迟，出错时错误数 +1。
    /// 消费方提前丢弃流（客户端断开）时不记录。
    pub async fn infer_stream(&self, request: InferenceRequest) -> Result<FragmentStream, GatewayError> {
        request.validate()?;

        let start = Instant::now();
        let inner = match self.backend.stream(&request).await {
            Ok(s) => s,
            Err(e) => {
                self.metrics.record_error();
                tracing::error!(state = ?CallState::Failed, "流式推理建立失败: {}", e);
                return Err(e);
            }
        };

        let metrics = self.metrics.clone();
        Ok(Box::pin(async_stream::stream! {
            let mut inner = inner;
            let mut fragments = 0usize;
            while let Some(event) = inner.next().await {
                match event {
                    StreamEvent::Fragment(text) => {
                        fragments += 1;
                        yield StreamEvent::Fragment(text);
                    }
                    StreamEvent::Error { error, partial } => {
                        metrics.record_error();
                        tracing::warn!(
                            state = ?CallState::after_stream_error(partial),
                            fragments,
                            "流式推理中断: {}",
                            error
                        );
                        yield StreamEvent::Error { error, partial };
                        return;
                    }
                }
            }
            metrics.record_success(0, start.elapsed());
            tracing::debug!(state = ?CallState::Succeeded, fragments, "流式推理完成");
        }))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn upstream_healthy(&self) -> bool {
        self.backend.health().await
    }
}
