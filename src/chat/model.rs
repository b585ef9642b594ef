//! 聊天与消息数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 聊天
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 消息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    pub function_calls: Option<Value>,
    pub personality_used: Option<String>,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
}

/// 待写入的消息（id 和时间由存储层分配）
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub chat_id: String,
    pub content: String,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    pub function_calls: Option<Value>,
    pub personality_used: Option<String>,
    pub conversation_id: Option<String>,
}
