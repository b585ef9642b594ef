//! 网关路由配置

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{MethodFilter, get, on},
};
use reqwest::Client;

use crate::common::cors::cors_layer;
use crate::http_client::build_client;
use crate::identity::{IdentityResolver, identity_middleware};
use crate::model::config::Config;
use crate::rate_limit::FixedWindowLimiter;

use super::forwarder::Forwarder;
use super::handlers::{health, proxy_handler, root};
use super::targets::ForwardTargets;

/// 路径前缀 -> 目标服务
const ROUTES: &[(&str, &str)] = &[
    ("chats", "chat"),
    ("ai", "ai"),
    ("users", "user"),
    ("subscriptions", "subscription"),
    ("files", "file"),
    ("profile", "user"),
    ("settings", "user"),
    ("upload", "file"),
    ("usage", "subscription"),
];

/// 网关共享状态
#[derive(Clone)]
pub struct GatewayState {
    pub forwarder: Arc<Forwarder>,
    /// 健康检查使用的 client
    pub health_client: Client,
    pub health_timeout: Duration,
}

/// 根据请求路径选择目标服务
///
/// `/api/admin/stats*` 交给 subscription，其余 `/api/admin/*` 交给 user
pub fn route_service(path: &str) -> Option<&'static str> {
    let rest = path.strip_prefix("/api/")?;
    let (prefix, sub) = rest.split_once('/').unwrap_or((rest, ""));

    if prefix == "admin" {
        return Some(if sub.starts_with("stats") {
            "subscription"
        } else {
            "user"
        });
    }

    ROUTES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, service)| *service)
}

/// 创建网关路由
///
/// # 端点
/// - `GET|POST|PUT|DELETE /api/{chats,ai,users,subscriptions,files,profile,settings,upload,usage,admin}/*` - 转发
/// - `GET /health` - 探测所有服务
/// - `GET /` - 网关信息
///
/// # 认证
/// 转发路由需要 `Authorization: Bearer <token>`
pub fn create_gateway_router(state: GatewayState, resolver: Arc<IdentityResolver>) -> Router {
    let methods = MethodFilter::GET
        .or(MethodFilter::POST)
        .or(MethodFilter::PUT)
        .or(MethodFilter::DELETE);

    let prefixes = ROUTES.iter().map(|(p, _)| *p).chain(["admin"]);
    let mut api: Router<GatewayState> = Router::new();
    for prefix in prefixes {
        api = api
            .route(&format!("/api/{}", prefix), on(methods, proxy_handler))
            .route(&format!("/api/{}/{{*path}}", prefix), on(methods, proxy_handler));
    }

    api.layer(middleware::from_fn_with_state(resolver, identity_middleware))
        .route("/health", get(health))
        .route("/", get(root))
        .with_state(state)
}

/// 按配置组装网关：身份解析、限流、转发目标、CORS
pub fn build_gateway_router(config: &Config) -> anyhow::Result<Router> {
    let resolver = Arc::new(IdentityResolver::from_config(&config.auth)?);
    let targets = Arc::new(ForwardTargets::new(&config.services));
    let limiter = Arc::new(FixedWindowLimiter::from_config(&config.rate_limit));

    let forward_timeout = Duration::from_secs(config.forward_timeout_secs);
    let stream_timeout = Duration::from_secs(config.forward_stream_timeout_secs);
    let health_timeout = Duration::from_secs(config.health_timeout_secs);
    let proxy = config.proxy_url.as_deref();

    tracing::info!(
        services = targets.len(),
        max_requests = config.rate_limit.max_requests,
        window_secs = config.rate_limit.window_secs,
        "网关已配置"
    );
    for (name, url) in targets.iter() {
        tracing::info!("  {} -> {}", name, url);
    }

    let forwarder = Forwarder::new(
        targets,
        limiter,
        build_client(proxy, stream_timeout.max(forward_timeout))?,
        forward_timeout,
    );
    let state = GatewayState {
        forwarder: Arc::new(forwarder),
        health_client: build_client(proxy, health_timeout)?,
        health_timeout,
    };

    Ok(create_gateway_router(state, resolver).layer(cors_layer(&config.cors_origins)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::make_test_token;
    use crate::model::config::AuthConfig;
    use crate::test_support::{closed_addr, spawn_app};
    use axum::{
        Json,
        http::HeaderMap,
        response::sse::{Event, Sse},
        routing::{any, post},
    };
    use std::convert::Infallible;
    use serde_json::{Value, json};
    use std::net::SocketAddr;

    const SECRET: &str = "gateway-test-secret";

    #[test]
    fn test_route_service() {
        assert_eq!(route_service("/api/chats"), Some("chat"));
        assert_eq!(route_service("/api/chats/chat_1/messages"), Some("chat"));
        assert_eq!(route_service("/api/ai/inference"), Some("ai"));
        assert_eq!(route_service("/api/profile/me"), Some("user"));
        assert_eq!(route_service("/api/settings"), Some("user"));
        assert_eq!(route_service("/api/upload/avatar"), Some("file"));
        assert_eq!(route_service("/api/usage/current"), Some("subscription"));
        assert_eq!(route_service("/api/admin/stats/daily"), Some("subscription"));
        assert_eq!(route_service("/api/admin/users"), Some("user"));
        assert_eq!(route_service("/api/unknown/x"), None);
        assert_eq!(route_service("/health"), None);
    }

    async fn echo(headers: HeaderMap) -> Json<Value> {
        Json(json!({
            "x_user_id": headers.get("x-user-id").and_then(|v| v.to_str().ok()),
        }))
    }

    async fn spawn_backend() -> SocketAddr {
        let app = Router::new()
            .route("/api/chats", any(echo))
            .route("/api/chats/{*rest}", any(echo))
            .route(
                "/api/chats/c1/stream",
                post(|| async {
                    Sse::new(futures::stream::iter([
                        Ok::<_, Infallible>(Event::default().data(r#"{"content":"a","done":false}"#)),
                        Ok(Event::default().data(r#"{"content":"","done":true}"#)),
                    ]))
                }),
            )
            .route("/health", get(|| async { "ok" }));
        spawn_app(app).await
    }

    async fn spawn_gateway(chat: SocketAddr, max_requests: u32) -> SocketAddr {
        let mut config = Config::default();
        config.services.clear();
        config
            .services
            .insert("chat".into(), format!("http://{}", chat));
        config
            .services
            .insert("file".into(), format!("http://{}", closed_addr().await));
        config.auth = AuthConfig {
            jwt_secret: Some(SECRET.into()),
            ..Default::default()
        };
        config.rate_limit.max_requests = max_requests;
        spawn_app(build_gateway_router(&config).unwrap()).await
    }

    fn token() -> String {
        let exp = chrono::Utc::now().timestamp() as u64 + 600;
        make_test_token(SECRET, "user_7", exp)
    }

    #[tokio::test]
    async fn test_forwards_with_identity() {
        let gateway = spawn_gateway(spawn_backend().await, 100).await;
        let resp = reqwest::Client::new()
            .get(format!("http://{}/api/chats/chat_1", gateway))
            .bearer_auth(token())
            .header("x-user-id", "spoofed")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["x_user_id"], "user_7");
    }

    #[tokio::test]
    async fn test_stream_relayed_as_event_stream() {
        let gateway = spawn_gateway(spawn_backend().await, 100).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/chats/c1/stream", gateway))
            .bearer_auth(token())
            .json(&json!({"content": "hello"}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));
        let text = resp.text().await.unwrap();
        let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(
            lines,
            vec![
                r#"data: {"content":"a","done":false}"#,
                r#"data: {"content":"","done":true}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let gateway = spawn_gateway(spawn_backend().await, 100).await;
        let resp = reqwest::Client::new()
            .get(format!("http://{}/api/chats", gateway))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn test_rate_limited_after_cap() {
        let gateway = spawn_gateway(spawn_backend().await, 2).await;
        let client = reqwest::Client::new();
        let token = token();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let resp = client
                .get(format!("http://{}/api/chats", gateway))
                .bearer_auth(&token)
                .send()
                .await
                .unwrap();
            statuses.push(resp.status().as_u16());
        }
        assert_eq!(statuses, vec![200, 200, 429]);
    }

    #[tokio::test]
    async fn test_unconfigured_service_is_404() {
        let gateway = spawn_gateway(spawn_backend().await, 100).await;
        let resp = reqwest::Client::new()
            .get(format!("http://{}/api/users/me", gateway))
            .bearer_auth(token())
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["message"], "Service user not found");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_503() {
        let gateway = spawn_gateway(spawn_backend().await, 100).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/upload/avatar", gateway))
            .bearer_auth(token())
            .body("bytes")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn test_health_reports_degraded() {
        let gateway = spawn_gateway(spawn_backend().await, 100).await;
        let body: Value = reqwest::get(format!("http://{}/health", gateway))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"]["chat"], "healthy");
        assert_eq!(body["services"]["file"], "unhealthy");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_root_lists_services() {
        let gateway = spawn_gateway(spawn_backend().await, 100).await;
        let body: Value = reqwest::get(format!("http://{}/", gateway))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["services"], json!(["chat", "file"]));
    }
}
