//! AI 服务路由配置

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::common::cors::cors_layer;
use crate::inference::{Orchestrator, build_orchestrator};
use crate::model::config::Config;

use super::handlers::{health, inference, inference_stream, metrics, root};

/// AI 服务共享状态
#[derive(Clone)]
pub struct AiState {
    pub orchestrator: Arc<Orchestrator>,
}

fn inference_routes() -> Router<AiState> {
    Router::new()
        .route("/inference", post(inference))
        .route("/inference/stream", post(inference_stream))
        .route("/multimodal", post(inference))
}

/// 创建 AI 服务路由
///
/// # 端点
/// - `POST /inference` - 阻塞式推理
/// - `POST /inference/stream` - SSE 流式推理
/// - `POST /multimodal` - 多模态推理（文本可选）
/// - `GET /metrics` - 推理指标
/// - `GET /health` - 探测上游
///
/// 推理端点同时挂载在 `/api/ai` 下，供网关按原路径转发
pub fn create_ai_router(state: AiState) -> Router {
    Router::new()
        .merge(inference_routes())
        .nest("/api/ai", inference_routes())
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/", get(root))
        .with_state(state)
}

pub fn build_ai_router(config: &Config) -> anyhow::Result<Router> {
    let state = AiState {
        orchestrator: build_orchestrator(config)?,
    };
    Ok(create_ai_router(state).layer(cors_layer(&config.cors_origins)))
}
