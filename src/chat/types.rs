//! 聊天服务 API 类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::types::DEFAULT_PERSONALITY;

use super::model::Chat;

// ============ 请求 ============

/// 创建聊天请求
#[derive(Debug, Deserialize)]
pub struct ChatCreate {
    pub title: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// 重命名聊天请求
#[derive(Debug, Deserialize)]
pub struct ChatUpdate {
    pub title: String,
}

/// 发送消息请求
#[derive(Debug, Clone, Deserialize)]
pub struct MessageCreate {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    /// AI 人格，默认 helpful
    #[serde(default = "default_personality")]
    pub personality: String,
    #[serde(default = "default_enable_functions")]
    pub enable_functions: bool,
}

fn default_personality() -> String {
    DEFAULT_PERSONALITY.to_string()
}

fn default_enable_functions() -> bool {
    true
}

impl MessageCreate {
    /// 至少要有文本或一个媒体地址
    pub fn has_input(&self) -> bool {
        !self.content.trim().is_empty()
            || [&self.image_url, &self.audio_url, &self.video_url]
                .iter()
                .any(|url| url.as_deref().is_some_and(|u| !u.is_empty()))
    }
}

/// 编辑消息请求
#[derive(Debug, Deserialize)]
pub struct MessageUpdate {
    pub content: String,
}

// ============ 响应 ============

/// 聊天详情（带消息数）
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub title: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

impl ChatResponse {
    pub fn new(chat: Chat, message_count: usize) -> Self {
        Self {
            id: chat.id,
            title: chat.title,
            user_id: chat.user_id,
            workspace_id: chat.workspace_id,
            created_at: chat.created_at,
            message_count,
        }
    }
}

/// 操作成功响应
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

impl SuccessResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// 流式回复推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatStreamEvent {
    /// 片段；首个事件内容为空，用来告知助手消息 ID
    #[serde(rename_all = "camelCase")]
    Chunk {
        message_id: String,
        content: String,
        done: bool,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        message_id: String,
        content: String,
        done: bool,
        full_response: String,
    },
    Error {
        error: String,
        partial: bool,
        done: bool,
    },
}

impl ChatStreamEvent {
    pub fn chunk(message_id: &str, content: impl Into<String>) -> Self {
        ChatStreamEvent::Chunk {
            message_id: message_id.to_string(),
            content: content.into(),
            done: false,
        }
    }

    pub fn done(message_id: &str, full_response: impl Into<String>) -> Self {
        ChatStreamEvent::Done {
            message_id: message_id.to_string(),
            content: String::new(),
            done: true,
            full_response: full_response.into(),
        }
    }

    pub fn error(error: impl Into<String>, partial: bool) -> Self {
        ChatStreamEvent::Error {
            error: error.into(),
            partial,
            done: true,
        }
    }
}
