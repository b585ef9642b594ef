//! 身份模块
//!
//! - 网关侧：`IdentityResolver` 校验 Bearer 凭据，中间件把 `Identity` 放入请求扩展
//! - 服务侧：`CallerIdentity` 从网关注入的 `X-User-ID` / `X-User-Email` 头中读取身份

mod jwt;
mod middleware;

use axum::{extract::FromRequestParts, http::request::Parts};
use serde::Serialize;

use crate::error::GatewayError;

pub use jwt::IdentityResolver;
pub use middleware::identity_middleware;

#[cfg(test)]
pub(crate) use jwt::make_test_token;

/// 网关注入的用户 ID 头
pub const USER_ID_HEADER: &str = "x-user-id";
/// 网关注入的用户邮箱头
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// 调用方身份（单个请求内不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub session_id: Option<String>,
}

/// 下游服务使用的身份提取器
///
/// 信任网关注入的头；缺少 `X-User-ID` 时返回 401
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub Identity);

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let id = header(USER_ID_HEADER).ok_or_else(|| {
            GatewayError::Unauthenticated("User ID not found in headers".to_string())
        })?;

        Ok(CallerIdentity(Identity {
            id,
            email: header(USER_EMAIL_HEADER).unwrap_or_default(),
            session_id: None,
        }))
    }
}
