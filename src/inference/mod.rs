//! 推理：上游客户端、重试、流式解码、指标与编排

pub mod client;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod sse;
pub mod types;

use std::sync::Arc;

use crate::model::config::Config;

pub use client::{InferenceBackend, UpstreamClient};
pub use orchestrator::{CallState, Orchestrator};
pub use sse::{FragmentStream, StreamEvent};
pub use types::{ChatMessage, InferenceRequest, InferenceResult};

/// 按配置构建编排器
pub fn build_orchestrator(config: &Config) -> anyhow::Result<Arc<Orchestrator>> {
    let client = UpstreamClient::new(&config.upstream, config.proxy_url.as_deref())?;
    tracing::info!(upstream = %config.upstream.url, "推理上游已配置");
    Ok(Arc::new(Orchestrator::new(Arc::new(client), &config.upstream)))
}
