//! Authorization 头解析

/// 解析 `Authorization: Bearer <token>` 头的值
///
/// 只接受 Bearer 方案；方案不符或 token 为空时返回 None
pub fn parse_bearer(value: &str) -> Option<&str> {
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}
