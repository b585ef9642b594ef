//! 公共工具模块

pub mod auth;
pub mod cors;

/// 日志中记录上游响应体时的最大字节数
pub const LOG_BODY_LIMIT: usize = 512;

/// 截断字符串用于日志输出，不会切断多字节字符
pub fn truncate_for_log(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut end = max_bytes.saturating_sub(3);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
