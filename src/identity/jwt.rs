//! Bearer 凭据校验
//!
//! 使用配置的密钥（HS256 共享密钥或 RS256 公钥）校验签名、过期时间和签发者，
//! 成功后从 claims 中取出调用方身份。

use anyhow::{Context, bail};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::common::auth;
use crate::error::GatewayError;
use crate::model::config::AuthConfig;

use super::Identity;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// 用户 ID
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// 会话 ID
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub exp: Option<u64>,
    #[serde(default)]
    pub iss: Option<String>,
}

/// 身份解析器
///
/// 启动时根据配置构建一次，之后只读
pub struct IdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl IdentityResolver {
    /// 从配置构建解析器
    ///
    /// 未配置任何密钥且未开启 `allowUnverified` 时返回错误
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        if let Some(pem) = &config.jwt_public_key_pem {
            let key = DecodingKey::from_rsa_pem(pem.as_bytes()).context("解析 RS256 公钥失败")?;
            return Ok(Self::verified(key, Algorithm::RS256, config.issuer.as_deref()));
        }

        if let Some(secret) = &config.jwt_secret {
            if secret.is_empty() {
                bail!("jwtSecret 不能为空");
            }
            let key = DecodingKey::from_secret(secret.as_bytes());
            return Ok(Self::verified(key, Algorithm::HS256, config.issuer.as_deref()));
        }

        if config.allow_unverified {
            tracing::warn!("身份校验已关闭签名验证（allowUnverified），请勿在生产环境使用");
            return Ok(Self::unverified());
        }

        bail!("未配置 JWT 校验密钥：请设置 auth.jwtSecret / auth.jwtPublicKeyPem 或环境变量 JWT_SECRET")
    }

    fn verified(key: DecodingKey, algorithm: Algorithm, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self { key, validation }
    }

    fn unverified() -> Self {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(&[]),
            validation,
        }
    }

    /// 从 Authorization 头的值解析身份
    pub fn resolve(&self, authorization: Option<&str>) -> Result<Identity, GatewayError> {
        let token = authorization.and_then(auth::parse_bearer).ok_or_else(|| {
            GatewayError::Unauthenticated("Missing or invalid authorization header".to_string())
        })?;

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!("凭据校验失败: {}", e);
            GatewayError::Unauthenticated("Invalid token".to_string())
        })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(GatewayError::Unauthenticated("Invalid token".to_string()));
        }

        Ok(Identity {
            id: claims.sub,
            email: claims.email.unwrap_or_default(),
            session_id: claims.sid,
        })
    }
}

/// 签发测试用 HS256 token
#[cfg(test)]
pub(crate) fn make_test_token(secret: &str, sub: &str, exp: u64) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let claims = Claims {
        sub: sub.to_string(),
        email: Some(format!("{}@example.com", sub)),
        sid: Some("sess_1".to_string()),
        exp: Some(exp),
        iss: Some("https://issuer.example".to_string()),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-gateway-secret";

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn hs256_resolver() -> IdentityResolver {
        IdentityResolver::from_config(&AuthConfig {
            jwt_secret: Some(SECRET.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_valid_token() {
        let token = make_test_token(SECRET, "user_42", now() + 600);
        let identity = hs256_resolver()
            .resolve(Some(&format!("Bearer {}", token)))
            .unwrap();

        assert_eq!(identity.id, "user_42");
        assert_eq!(identity.email, "user_42@example.com");
        assert_eq!(identity.session_id.as_deref(), Some("sess_1"));
    }

    #[test]
    fn test_resolve_rejects_missing_or_wrong_scheme() {
        let resolver = hs256_resolver();
        assert!(matches!(
            resolver.resolve(None),
            Err(GatewayError::Unauthenticated(_))
        ));
        assert!(matches!(
            resolver.resolve(Some("Basic dXNlcjpwYXNz")),
            Err(GatewayError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_wrong_key() {
        let token = make_test_token("some-other-secret", "user_42", now() + 600);
        let result = hs256_resolver().resolve(Some(&format!("Bearer {}", token)));
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_resolve_rejects_expired_token() {
        let token = make_test_token(SECRET, "user_42", now() - 3600);
        let result = hs256_resolver().resolve(Some(&format!("Bearer {}", token)));
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_issuer_mismatch() {
        let resolver = IdentityResolver::from_config(&AuthConfig {
            jwt_secret: Some(SECRET.to_string()),
            issuer: Some("https://someone-else.example".to_string()),
            ..Default::default()
        })
        .unwrap();
        let token = make_test_token(SECRET, "user_42", now() + 600);
        assert!(resolver.resolve(Some(&format!("Bearer {}", token))).is_err());
    }

    #[test]
    fn test_unverified_mode_decodes_any_signature() {
        let resolver = IdentityResolver::from_config(&AuthConfig {
            allow_unverified: true,
            ..Default::default()
        })
        .unwrap();
        let token = make_test_token("whatever", "user_dev", now() + 600);
        let identity = resolver.resolve(Some(&format!("Bearer {}", token))).unwrap();
        assert_eq!(identity.id, "user_dev");

        // 不是 JWT 的字符串仍然拒绝
        assert!(resolver.resolve(Some("Bearer not-a-jwt")).is_err());
    }

    #[test]
    fn test_missing_key_is_startup_error() {
        assert!(IdentityResolver::from_config(&AuthConfig::default()).is_err());
    }
}
