//! 聊天服务路由配置

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::common::cors::cors_layer;
use crate::inference::build_orchestrator;
use crate::model::config::Config;

use super::handlers::{
    create_chat, delete_chat, delete_message, get_chat, health, list_chats, list_messages, root,
    send_message, stream_message, update_chat, update_message,
};
use super::repository::InMemoryChatRepository;
use super::service::ChatService;

/// 聊天服务共享状态
#[derive(Clone)]
pub struct ChatState {
    pub service: Arc<ChatService>,
}

/// 创建聊天服务路由
///
/// # 端点
/// - `GET/POST /api/chats` - 列出 / 创建聊天
/// - `GET/PUT/DELETE /api/chats/{chat_id}` - 查看 / 重命名 / 删除聊天
/// - `GET/POST /api/chats/{chat_id}/messages` - 列出消息 / 发送消息
/// - `PUT/DELETE /api/chats/{chat_id}/messages/{message_id}` - 编辑 / 删除消息
/// - `POST /api/chats/{chat_id}/stream` - SSE 流式回复
/// - `GET /health`
///
/// # 认证
/// 信任网关注入的 `X-User-ID` / `X-User-Email`，缺少时返回 401
pub fn create_chat_router(state: ChatState) -> Router {
    Router::new()
        .route("/api/chats", get(list_chats).post(create_chat))
        .route(
            "/api/chats/{chat_id}",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route(
            "/api/chats/{chat_id}/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/api/chats/{chat_id}/messages/{message_id}",
            put(update_message).delete(delete_message),
        )
        .route("/api/chats/{chat_id}/stream", post(stream_message))
        .route("/health", get(health))
        .route("/", get(root))
        .with_state(state)
}

pub fn build_chat_router(config: &Config) -> anyhow::Result<Router> {
    let service = ChatService::new(
        Arc::new(InMemoryChatRepository::new()),
        build_orchestrator(config)?,
    );
    let state = ChatState {
        service: Arc::new(service),
    };
    Ok(create_chat_router(state).layer(cors_layer(&config.cors_origins)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::service::testing::service_with;
    use crate::inference::StreamEvent;
    use crate::inference::orchestrator::testing::MockBackend;
    use crate::test_support::spawn_app;
    use serde_json::{Value, json};
    use std::net::SocketAddr;

    async fn spawn(backend: MockBackend) -> SocketAddr {
        let (service, _) = service_with(Arc::new(backend));
        let state = ChatState {
            service: Arc::new(service),
        };
        spawn_app(create_chat_router(state)).await
    }

    fn as_user(builder: reqwest::RequestBuilder, user: &str) -> reqwest::RequestBuilder {
        builder
            .header("x-user-id", user)
            .header("x-user-email", format!("{}@example.com", user))
    }

    async fn create(client: &reqwest::Client, addr: SocketAddr, user: &str) -> String {
        let body: Value = as_user(client.post(format!("http://{}/api/chats", addr)), user)
            .json(&json!({"title": "Trip"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_missing_identity_is_401() {
        let addr = spawn(MockBackend::replying("x", 1)).await;
        let resp = reqwest::get(format!("http://{}/api/chats", addr))
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["message"], "User ID not found in headers");
    }

    #[tokio::test]
    async fn test_chat_crud() {
        let addr = spawn(MockBackend::replying("x", 1)).await;
        let client = reqwest::Client::new();
        let chat_id = create(&client, addr, "alice").await;

        let chat: Value = as_user(client.get(format!("http://{}/api/chats/{}", addr, chat_id)), "alice")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(chat["title"], "Trip");
        assert_eq!(chat["user_id"], "alice");
        assert_eq!(chat["message_count"], 0);

        let renamed: Value = as_user(client.put(format!("http://{}/api/chats/{}", addr, chat_id)), "alice")
            .json(&json!({"title": "Holiday"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(renamed["title"], "Holiday");

        let resp = as_user(client.get(format!("http://{}/api/chats/{}", addr, chat_id)), "bob")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);

        let resp = as_user(client.delete(format!("http://{}/api/chats/{}", addr, chat_id)), "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["message"], "Chat deleted successfully");

        let resp = as_user(client.get(format!("http://{}/api/chats/{}", addr, chat_id)), "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_send_and_edit_message() {
        let addr = spawn(MockBackend::replying("Bonjour", 5)).await;
        let client = reqwest::Client::new();
        let chat_id = create(&client, addr, "alice").await;

        let reply: Value = as_user(
            client.post(format!("http://{}/api/chats/{}/messages", addr, chat_id)),
            "alice",
        )
        .json(&json!({"content": "Say hi in French"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
        assert_eq!(reply["role"], "assistant");
        assert_eq!(reply["content"], "Bonjour");
        assert_eq!(reply["is_edited"], false);

        let messages: Vec<Value> = as_user(
            client.get(format!("http://{}/api/chats/{}/messages", addr, chat_id)),
            "alice",
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
        assert_eq!(messages.len(), 2);
        let user_msg_id = messages[0]["id"].as_str().unwrap();

        let edited: Value = as_user(
            client.put(format!(
                "http://{}/api/chats/{}/messages/{}",
                addr, chat_id, user_msg_id
            )),
            "alice",
        )
        .json(&json!({"content": "Say hello in French"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
        assert_eq!(edited["is_edited"], true);
        assert!(edited["edited_at"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_body_is_400() {
        let addr = spawn(MockBackend::replying("x", 1)).await;
        let client = reqwest::Client::new();
        let chat_id = create(&client, addr, "alice").await;

        let resp = as_user(
            client.post(format!("http://{}/api/chats/{}/messages", addr, chat_id)),
            "alice",
        )
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_stream_wire_format() {
        let addr = spawn(MockBackend::streaming(vec![
            StreamEvent::Fragment("a".into()),
            StreamEvent::Fragment("b".into()),
        ]))
        .await;
        let client = reqwest::Client::new();
        let chat_id = create(&client, addr, "alice").await;

        let text = as_user(
            client.post(format!("http://{}/api/chats/{}/stream", addr, chat_id)),
            "alice",
        )
        .json(&json!({"content": "hello"}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

        let events: Vec<Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert_eq!(events.len(), 4);
        let message_id = events[0]["messageId"].clone();
        assert_eq!(events[0]["content"], "");
        assert_eq!(events[1]["content"], "a");
        assert_eq!(events[2]["content"], "b");
        assert_eq!(
            events[3],
            json!({"messageId": message_id, "content": "", "done": true, "fullResponse": "ab"})
        );
    }

    #[tokio::test]
    async fn test_health() {
        let addr = spawn(MockBackend::replying("x", 1)).await;
        let body: Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "chat-service");
    }
}
