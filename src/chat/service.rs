//! 聊天业务逻辑
//!
//! 所有操作先校验聊天归属：聊天不存在返回 404，不属于调用方返回 403。
//! 发送消息时先写入用户消息，再调用编排器生成助手回复。

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::identity::Identity;
use crate::inference::{CallState, ChatMessage, Orchestrator, StreamEvent};

use super::model::{Chat, Message, NewMessage, Role};
use super::repository::ChatRepository;
use super::types::{ChatCreate, ChatResponse, ChatStreamEvent, MessageCreate};

/// 推送给客户端的流式回复
pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatStreamEvent> + Send>>;

/// 记录领域事件
fn publish(event: &str, payload: Value) {
    tracing::info!(event, "发布事件: {}", payload);
}

pub struct ChatService {
    repo: Arc<dyn ChatRepository>,
    orchestrator: Arc<Orchestrator>,
}

impl ChatService {
    pub fn new(repo: Arc<dyn ChatRepository>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { repo, orchestrator }
    }

    async fn owned_chat(&self, identity: &Identity, chat_id: &str) -> Result<Chat, GatewayError> {
        let chat = self
            .repo
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Chat not found".to_string()))?;
        if chat.user_id != identity.id {
            tracing::warn!(chat_id, user_id = %identity.id, "拒绝访问他人的聊天");
            return Err(GatewayError::Forbidden("Access denied".to_string()));
        }
        Ok(chat)
    }

    async fn message_in_chat(&self, chat: &Chat, message_id: &str) -> Result<Message, GatewayError> {
        let message = self
            .repo
            .get_message(message_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Message not found".to_string()))?;
        if message.chat_id != chat.id {
            return Err(GatewayError::NotFound(
                "Message not found in this chat".to_string(),
            ));
        }
        Ok(message)
    }

    async fn chat_response(&self, chat: Chat) -> Result<ChatResponse, GatewayError> {
        let count = self.repo.count_messages(&chat.id).await?;
        Ok(ChatResponse::new(chat, count))
    }

    pub async fn list_chats(&self, identity: &Identity) -> Result<Vec<ChatResponse>, GatewayError> {
        let chats = self.repo.list_chats(&identity.id).await?;
        let mut responses = Vec::with_capacity(chats.len());
        for chat in chats {
            responses.push(self.chat_response(chat).await?);
        }
        Ok(responses)
    }

    pub async fn create_chat(
        &self,
        identity: &Identity,
        request: ChatCreate,
    ) -> Result<ChatResponse, GatewayError> {
        let chat = self
            .repo
            .create_chat(&identity.id, &request.title, request.workspace_id)
            .await?;
        publish(
            "chat.created",
            json!({ "chat_id": chat.id, "user_id": chat.user_id, "title": chat.title }),
        );
        Ok(ChatResponse::new(chat, 0))
    }

    pub async fn get_chat(&self, identity: &Identity, chat_id: &str) -> Result<ChatResponse, GatewayError> {
        let chat = self.owned_chat(identity, chat_id).await?;
        self.chat_response(chat).await
    }

    pub async fn rename_chat(
        &self,
        identity: &Identity,
        chat_id: &str,
        title: &str,
    ) -> Result<ChatResponse, GatewayError> {
        self.owned_chat(identity, chat_id).await?;
        let chat = self
            .repo
            .rename_chat(chat_id, title)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Chat not found".to_string()))?;
        publish(
            "chat.updated",
            json!({ "chat_id": chat.id, "user_id": identity.id, "title": chat.title }),
        );
        self.chat_response(chat).await
    }

    pub async fn delete_chat(&self, identity: &Identity, chat_id: &str) -> Result<(), GatewayError> {
        self.owned_chat(identity, chat_id).await?;
        self.repo.delete_chat(chat_id).await?;
        publish(
            "chat.deleted",
            json!({ "chat_id": chat_id, "user_id": identity.id }),
        );
        Ok(())
    }

    pub async fn list_messages(&self, identity: &Identity, chat_id: &str) -> Result<Vec<Message>, GatewayError> {
        self.owned_chat(identity, chat_id).await?;
        Ok(self.repo.list_messages(chat_id).await?)
    }

    pub async fn update_message(
        &self,
        identity: &Identity,
        chat_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, GatewayError> {
        let chat = self.owned_chat(identity, chat_id).await?;
        self.message_in_chat(&chat, message_id).await?;
        let message = self
            .repo
            .update_message_content(message_id, content, true)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Message not found".to_string()))?;
        publish(
            "message.updated",
            json!({ "message_id": message.id, "chat_id": chat.id, "user_id": identity.id }),
        );
        Ok(message)
    }

    pub async fn delete_message(
        &self,
        identity: &Identity,
        chat_id: &str,
        message_id: &str,
    ) -> Result<(), GatewayError> {
        let chat = self.owned_chat(identity, chat_id).await?;
        self.message_in_chat(&chat, message_id).await?;
        self.repo.delete_message(message_id).await?;
        publish(
            "message.deleted",
            json!({ "message_id": message_id, "chat_id": chat.id, "user_id": identity.id }),
        );
        Ok(())
    }

    /// 写入用户消息并返回交给编排器的输入
    async fn accept_user_message(
        &self,
        identity: &Identity,
        chat: &Chat,
        request: &MessageCreate,
    ) -> Result<ChatMessage, GatewayError> {
        if !request.has_input() {
            return Err(GatewayError::InvalidRequest(
                "Message must contain text or media".to_string(),
            ));
        }

        let message = self
            .repo
            .add_message(
                Role::User,
                NewMessage {
                    chat_id: chat.id.clone(),
                    content: request.content.clone(),
                    image_url: request.image_url.clone(),
                    audio_url: request.audio_url.clone(),
                    ..Default::default()
                },
            )
            .await?;
        publish(
            "message.sent",
            json!({ "message_id": message.id, "chat_id": chat.id, "user_id": identity.id, "role": "user" }),
        );

        Ok(ChatMessage {
            content: request.content.clone(),
            image_url: request.image_url.clone(),
            audio_url: request.audio_url.clone(),
            video_url: request.video_url.clone(),
            personality: Some(request.personality.clone()),
            enable_functions: request.enable_functions,
            conversation_id: Some(chat.id.clone()),
            user_id: Some(identity.id.clone()),
        })
    }

    /// 发送消息并等待完整回复，返回助手消息
    ///
    /// 推理失败时用户消息保留，错误原样返回。
    pub async fn send_message(
        &self,
        identity: &Identity,
        chat_id: &str,
        request: MessageCreate,
    ) -> Result<Message, GatewayError> {
        let chat = self.owned_chat(identity, chat_id).await?;
        let input = self.accept_user_message(identity, &chat, &request).await?;

        let result = self.orchestrator.respond(&input).await.map_err(|e| {
            tracing::error!(chat_id, "获取 AI 回复失败: {}", e);
            e
        })?;

        let reply = self
            .repo
            .add_message(
                Role::Assistant,
                NewMessage {
                    chat_id: chat.id.clone(),
                    content: result.text,
                    function_calls: result.function_calls,
                    personality_used: result.personality_used.or(input.personality),
                    conversation_id: result.conversation_id.or(input.conversation_id),
                    ..Default::default()
                },
            )
            .await?;
        publish(
            "message.sent",
            json!({ "message_id": reply.id, "chat_id": chat.id, "user_id": identity.id, "role": "assistant" }),
        );
        Ok(reply)
    }

    /// 发送消息并以事件流返回回复
    ///
    /// 助手消息先以空内容占位，首个事件携带其 ID。
    /// 正常结束时写入完整文本；中断时保留已收到的部分，一个片段都没有则删除占位。
    pub async fn stream_message(
        &self,
        identity: &Identity,
        chat_id: &str,
        request: MessageCreate,
    ) -> Result<ChatEventStream, GatewayError> {
        let chat = self.owned_chat(identity, chat_id).await?;
        let input = self.accept_user_message(identity, &chat, &request).await?;

        let mut fragments = self.orchestrator.respond_stream(&input).await?;

        let placeholder = self
            .repo
            .add_message(
                Role::Assistant,
                NewMessage {
                    chat_id: chat.id.clone(),
                    personality_used: input.personality.clone(),
                    conversation_id: input.conversation_id.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let message_id = placeholder.id;
        let user_id = identity.id.clone();
        let mut pending = PendingReply::new(self.repo.clone(), message_id.clone());

        Ok(Box::pin(async_stream::stream! {
            yield ChatStreamEvent::chunk(&message_id, "");

            while let Some(event) = fragments.next().await {
                match event {
                    StreamEvent::Fragment(text) => {
                        pending.text.push_str(&text);
                        yield ChatStreamEvent::chunk(&message_id, text);
                    }
                    StreamEvent::Error { error, partial } => {
                        tracing::warn!(
                            state = ?CallState::after_stream_error(partial),
                            message_id = %message_id,
                            "流式回复中断: {}",
                            error
                        );
                        pending.settle(false).await;
                        yield ChatStreamEvent::error(error.to_string(), partial);
                        return;
                    }
                }
            }

            let full_response = pending.text.clone();
            pending.settle(true).await;
            publish(
                "message.sent",
                json!({ "message_id": message_id, "chat_id": chat.id, "user_id": user_id, "role": "assistant" }),
            );
            yield ChatStreamEvent::done(&message_id, full_response);
        }))
    }
}

/// 流式回复的占位消息
///
/// 流被提前丢弃（客户端断开）时在后台按中断处理。
struct PendingReply {
    repo: Arc<dyn ChatRepository>,
    message_id: String,
    text: String,
    settled: bool,
}

impl PendingReply {
    fn new(repo: Arc<dyn ChatRepository>, message_id: String) -> Self {
        Self {
            repo,
            message_id,
            text: String::new(),
            settled: false,
        }
    }

    async fn settle(&mut self, completed: bool) {
        self.settled = true;
        let text = std::mem::take(&mut self.text);
        if let Err(e) = persist_reply(&*self.repo, &self.message_id, &text, completed).await {
            tracing::error!(message_id = %self.message_id, "保存流式回复失败: {}", e);
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let repo = self.repo.clone();
        let message_id = std::mem::take(&mut self.message_id);
        let text = std::mem::take(&mut self.text);
        tracing::info!(message_id = %message_id, "客户端断开，保存已收到的回复");
        handle.spawn(async move {
            if let Err(e) = persist_reply(&*repo, &message_id, &text, false).await {
                tracing::error!(message_id = %message_id, "保存流式回复失败: {}", e);
            }
        });
    }
}

/// 完成时总是写入全文；中断时有内容则保留，没有则删除占位
async fn persist_reply(
    repo: &dyn ChatRepository,
    message_id: &str,
    text: &str,
    completed: bool,
) -> anyhow::Result<()> {
    if completed || !text.is_empty() {
        repo.update_message_content(message_id, text, false).await?;
    } else {
        repo.delete_message(message_id).await?;
    }
    Ok(())
}
