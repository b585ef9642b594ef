//! 推理请求/响应类型

use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::GatewayError;

pub const DEFAULT_PERSONALITY: &str = "helpful";

fn default_max_new_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_personality() -> String {
    DEFAULT_PERSONALITY.to_string()
}

fn default_true() -> bool {
    true
}

/// 发往上游模型的推理请求
///
/// 每轮对话构造一次，按值传递，之后不再修改。
/// 同一结构也是 AI 服务 `/inference` 与 `/multimodal` 的请求体
/// （多模态请求用 `text` 字段携带文本）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default, alias = "text", skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_personality")]
    pub personality: String,

    #[serde(default = "default_true")]
    pub enable_functions: bool,

    #[serde(default)]
    pub conversation_id: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,
}

impl InferenceRequest {
    /// 文本和所有媒体引用都为空的请求不发往上游
    pub fn validate(&self) -> Result<(), GatewayError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if present(&self.prompt)
            || present(&self.image_url)
            || present(&self.audio_url)
            || present(&self.video_url)
        {
            Ok(())
        } else {
            Err(GatewayError::InvalidRequest(
                "Request must contain text or a media reference".to_string(),
            ))
        }
    }

    pub fn is_multimodal(&self) -> bool {
        self.image_url.is_some() || self.audio_url.is_some() || self.video_url.is_some()
    }
}

/// 聊天服务交给编排器的一条用户消息
#[derive(Debug, Clone, Default)]
pub struct ChatMessage {
    pub content: String,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    pub video_url: Option<String>,
    pub personality: Option<String>,
    pub enable_functions: bool,
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
}

/// 上游 `/chat` 的应答
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamReply {
    pub text: String,
    pub function_calls: Option<Value>,
    pub tokens_used: Option<u64>,
    pub conversation_id: Option<String>,
    pub personality_used: Option<String>,
    /// 成功时是第几次尝试
    pub attempts: u32,
}

impl UpstreamReply {
    /// 解析上游 JSON 应答
    ///
    /// 文本依次取 `response` / `text` / `content`；带 `error` 字段的应答视为上游错误
    pub fn from_value(value: &Value) -> Result<Self, GatewayError> {
        let Some(obj) = value.as_object() else {
            return Err(GatewayError::UpstreamError {
                status: 502,
                message: "upstream reply is not a JSON object".to_string(),
            });
        };

        if let Some(err) = obj.get("error").filter(|v| !v.is_null()) {
            let message = err
                .as_str()
                .map(str::to_string)
                .or_else(|| err.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| err.to_string());
            return Err(GatewayError::UpstreamError {
                status: 502,
                message,
            });
        }

        let text = ["response", "text", "content"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            text,
            function_calls: obj.get("function_calls").filter(|v| !v.is_null()).cloned(),
            tokens_used: obj.get("tokens_used").and_then(Value::as_u64),
            conversation_id: obj
                .get("conversation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            personality_used: obj
                .get("personality_used")
                .and_then(Value::as_str)
                .map(str::to_string),
            attempts: 1,
        })
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// 归一化后的推理结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    #[serde(rename = "response")]
    pub text: String,
    pub conversation_id: Option<String>,
    pub function_calls: Option<Value>,
    pub personality_used: Option<String>,
    pub tokens_used: Option<u64>,
    /// 墙钟耗时（含重试等待），序列化为秒
    #[serde(rename = "processing_time", serialize_with = "serialize_secs")]
    pub latency: Duration,
}

impl InferenceResult {
    pub fn from_reply(reply: UpstreamReply, latency: Duration) -> Self {
        Self {
            text: reply.text,
            conversation_id: reply.conversation_id,
            function_calls: reply.function_calls,
            personality_used: reply.personality_used,
            tokens_used: reply.tokens_used,
            latency,
        }
    }
}
