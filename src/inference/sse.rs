//! 上游流式应答解码
//!
//! 上游以 `data: <json>` 行推送片段，`data: [DONE]` 表示结束。
//! 一行可能被拆到多个网络分块里，由 `LineBuffer` 负责重组。

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::GatewayError;

/// 流结束标记
const DONE_MARKER: &str = "[DONE]";

/// 流式事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// 一段文本
    Fragment(String),
    /// 终止错误；`partial` 表示此前是否已经发出过片段
    Error { error: GatewayError, partial: bool },
}

/// 片段流：惰性、只进、不可重放
pub type FragmentStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// 按行切分字节流
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// 追加一个分块，返回其中所有完整的行（不含换行符）
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// 取出没有换行结尾的剩余内容
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// 单行解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    Fragment(String),
    Done,
    /// 上游在流内报告的错误
    Error(String),
    /// 空行、注释、非 data 行、无法解析或没有文本的负载
    Skip,
}

/// 解析一行
pub fn parse_data_line(line: &str) -> SseLine {
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return SseLine::Skip;
    }
    if payload == DONE_MARKER {
        return SseLine::Done;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("跳过无法解析的流式负载: {}", e);
            return SseLine::Skip;
        }
    };

    if let Some(err) = value.get("error").filter(|v| !v.is_null()) {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return SseLine::Error(message);
    }

    match extract_fragment(&value) {
        Some(text) => SseLine::Fragment(text),
        None => SseLine::Skip,
    }
}

/// 依次尝试 `response` / `text` / `content` / `delta.content`，取第一个非空字符串
pub fn extract_fragment(value: &Value) -> Option<String> {
    let candidates = [
        value.get("response"),
        value.get("text"),
        value.get("content"),
        value.get("delta").and_then(|d| d.get("content")),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// 把上游字节流解码为片段流
///
/// 遇到 `[DONE]` 或字节流结束即完成；传输错误或上游报错产生一个终止错误事件后结束。
/// 丢弃返回的流会同时丢弃底层字节流，从而断开上游连接。
pub fn decode_stream<S, E>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<GatewayError> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::default();
        let mut emitted = false;
        let mut finished = false;

        'read: while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    let error: GatewayError = e.into();
                    tracing::warn!(partial = emitted, "上游流中断: {}", error);
                    yield StreamEvent::Error { error, partial: emitted };
                    finished = true;
                    break 'read;
                }
            };

            for line in lines.push(&bytes) {
                match parse_data_line(&line) {
                    SseLine::Fragment(text) => {
                        emitted = true;
                        yield StreamEvent::Fragment(text);
                    }
                    SseLine::Done => {
                        finished = true;
                        break 'read;
                    }
                    SseLine::Error(message) => {
                        tracing::warn!(partial = emitted, "上游流内报错: {}", message);
                        yield StreamEvent::Error {
                            error: GatewayError::UpstreamError { status: 502, message },
                            partial: emitted,
                        };
                        finished = true;
                        break 'read;
                    }
                    SseLine::Skip => {}
                }
            }
        }

        if !finished {
            if let Some(line) = lines.finish() {
                match parse_data_line(&line) {
                    SseLine::Fragment(text) => yield StreamEvent::Fragment(text),
                    SseLine::Error(message) => {
                        yield StreamEvent::Error {
                            error: GatewayError::UpstreamError { status: 502, message },
                            partial: emitted,
                        };
                    }
                    SseLine::Done | SseLine::Skip => {}
                }
            }
        }
    })
}
