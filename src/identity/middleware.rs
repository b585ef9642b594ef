//! 网关身份认证中间件

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::IdentityResolver;

/// 校验 Bearer 凭据，并把解析出的 `Identity` 注入请求扩展
pub async fn identity_middleware(
    State(resolver): State<Arc<IdentityResolver>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match resolver.resolve(authorization) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(path = %request.uri().path(), "拒绝未认证请求: {}", e);
            e.into_response()
        }
    }
}
