//! 聊天存储抽象
//!
//! 服务层只依赖 [`ChatRepository`]；当前提供进程内实现，
//! 换成数据库时只需要新增一个实现。

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::model::{Chat, Message, NewMessage, Role};

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        workspace_id: Option<String>,
    ) -> Result<Chat>;

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>>;

    /// 用户的全部聊天，最新的在前
    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>>;

    async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<Option<Chat>>;

    /// 删除聊天及其全部消息，返回聊天是否存在
    async fn delete_chat(&self, chat_id: &str) -> Result<bool>;

    async fn add_message(&self, role: Role, message: NewMessage) -> Result<Message>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>>;

    /// 聊天内的消息，按创建顺序
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>>;

    async fn count_messages(&self, chat_id: &str) -> Result<usize>;

    /// 替换消息内容；`edited` 为真时同时记录编辑时间
    async fn update_message_content(
        &self,
        message_id: &str,
        content: &str,
        edited: bool,
    ) -> Result<Option<Message>>;

    async fn delete_message(&self, message_id: &str) -> Result<bool>;
}

#[derive(Default)]
struct Store {
    chats: Vec<Chat>,
    messages: Vec<Message>,
}

/// 进程内存储，重启即丢失
#[derive(Default)]
pub struct InMemoryChatRepository {
    store: RwLock<Store>,
    chat_seq: AtomicU64,
    message_seq: AtomicU64,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        workspace_id: Option<String>,
    ) -> Result<Chat> {
        let n = self.chat_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let chat = Chat {
            id: format!("chat_{}", n),
            title: title.to_string(),
            user_id: user_id.to_string(),
            workspace_id,
            created_at: Utc::now(),
        };
        self.store.write().chats.push(chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        Ok(self
            .store
            .read()
            .chats
            .iter()
            .find(|c| c.id == chat_id)
            .cloned())
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>> {
        // 按插入顺序倒序，时间相同时也保持最新在前
        Ok(self
            .store
            .read()
            .chats
            .iter()
            .rev()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<Option<Chat>> {
        let mut store = self.store.write();
        Ok(store.chats.iter_mut().find(|c| c.id == chat_id).map(|chat| {
            chat.title = title.to_string();
            chat.clone()
        }))
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<bool> {
        let mut store = self.store.write();
        let before = store.chats.len();
        store.chats.retain(|c| c.id != chat_id);
        if store.chats.len() == before {
            return Ok(false);
        }
        store.messages.retain(|m| m.chat_id != chat_id);
        Ok(true)
    }

    async fn add_message(&self, role: Role, message: NewMessage) -> Result<Message> {
        let n = self.message_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let message = Message {
            id: format!("msg_{}", n),
            chat_id: message.chat_id,
            role,
            content: message.content,
            image_url: message.image_url,
            audio_url: message.audio_url,
            function_calls: message.function_calls,
            personality_used: message.personality_used,
            conversation_id: message.conversation_id,
            created_at: Utc::now(),
            edited_at: None,
            is_edited: false,
        };
        self.store.write().messages.push(message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .store
            .read()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .store
            .read()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn count_messages(&self, chat_id: &str) -> Result<usize> {
        Ok(self
            .store
            .read()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .count())
    }

    async fn update_message_content(
        &self,
        message_id: &str,
        content: &str,
        edited: bool,
    ) -> Result<Option<Message>> {
        let mut store = self.store.write();
        Ok(store
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .map(|message| {
                message.content = content.to_string();
                if edited {
                    message.edited_at = Some(Utc::now());
                    message.is_edited = true;
                }
                message.clone()
            }))
    }

    async fn delete_message(&self, message_id: &str) -> Result<bool> {
        let mut store = self.store.write();
        let before = store.messages.len();
        store.messages.retain(|m| m.id != message_id);
        Ok(store.messages.len() != before)
    }
}
