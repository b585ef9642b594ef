use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 身份认证配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// HS256 共享密钥
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// RS256 公钥（PEM 格式），优先于 jwtSecret
    #[serde(default)]
    pub jwt_public_key_pem: Option<String>,

    /// 期望的签发者（可选）
    #[serde(default)]
    pub issuer: Option<String>,

    /// 仅用于本地开发：跳过签名校验直接解码 token
    #[serde(default)]
    pub allow_unverified: bool,
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// 每个窗口内允许的最大请求数
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// 窗口长度（秒）
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// 同时跟踪的 (身份, 端点) 键数量上限
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_secs() -> u64 {
    60 * 60
}

fn default_max_keys() -> usize {
    100_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            max_keys: default_max_keys(),
        }
    }
}

/// 上游推理服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// 推理服务基础地址
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// 推理服务 API 密钥（可选，以 Bearer 方式发送）
    #[serde(default)]
    pub api_key: Option<String>,

    /// 非流式调用的最大尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// 重试基础延迟（毫秒），每次翻倍
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// 非流式调用超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// 流式调用超时（秒）
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// 使用旧版 `(旧均值 + 新延迟) / 2` 的平均延迟算法（兼容已有看板）
    #[serde(default)]
    pub legacy_latency_average: bool,
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_stream_timeout_secs() -> u64 {
    120
}

fn default_max_new_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_key: None,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            legacy_latency_average: false,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    /// 监听端口，未配置时按运行角色选择默认端口
    #[serde(default)]
    pub port: Option<u16>,

    /// 后端服务名 -> 基础地址
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, String>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// CORS 允许的来源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 转发请求超时（秒）
    #[serde(default = "default_forward_timeout_secs")]
    pub forward_timeout_secs: u64,

    /// 透传流式响应的整体超时（秒）
    #[serde(default = "default_forward_stream_timeout_secs")]
    pub forward_stream_timeout_secs: u64,

    /// 健康检查超时（秒）
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// 已知服务及其环境变量前缀和默认地址
const KNOWN_SERVICES: &[(&str, &str, &str)] = &[
    ("chat", "CHAT_SERVICE_URL", "http://localhost:8002"),
    ("ai", "AI_SERVICE_URL", "http://localhost:8001"),
    ("user", "USER_SERVICE_URL", "http://localhost:8003"),
    ("subscription", "SUBSCRIPTION_SERVICE_URL", "http://localhost:8004"),
    ("file", "FILE_SERVICE_URL", "http://localhost:8005"),
];

fn default_services() -> BTreeMap<String, String> {
    KNOWN_SERVICES
        .iter()
        .map(|(name, _, url)| (name.to_string(), url.to_string()))
        .collect()
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_forward_timeout_secs() -> u64 {
    30
}

fn default_forward_stream_timeout_secs() -> u64 {
    120
}

fn default_health_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            services: default_services(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upstream: UpstreamConfig::default(),
            cors_origins: default_cors_origins(),
            proxy_url: None,
            forward_timeout_secs: default_forward_timeout_secs(),
            forward_stream_timeout_secs: default_forward_stream_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置，文件不存在时返回默认配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 用进程环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// 用任意键值来源覆盖配置（环境变量优先于配置文件）
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, env_key, _) in KNOWN_SERVICES {
            if let Some(url) = lookup(env_key) {
                self.services.insert(name.to_string(), url);
            }
        }

        if let Some(url) = lookup("RADON_API_URL") {
            self.upstream.url = url;
        }
        if let Some(key) = lookup("RADON_API_KEY") {
            self.upstream.api_key = Some(key);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(value) = lookup("RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.max_requests = value
                .parse()
                .with_context(|| format!("RATE_LIMIT_MAX_REQUESTS 不是有效数字: {}", value))?;
        }
        if let Some(value) = lookup("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = value
                .parse()
                .with_context(|| format!("RATE_LIMIT_WINDOW_SECS 不是有效数字: {}", value))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.services.len(), 5);
        assert_eq!(config.services["chat"], "http://localhost:8002");
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window_secs, 3600);
        assert_eq!(config.upstream.max_attempts, 3);
        assert_eq!(config.upstream.request_timeout_secs, 60);
        assert_eq!(config.upstream.stream_timeout_secs, 120);
        assert_eq!(config.forward_timeout_secs, 30);
        assert_eq!(config.forward_stream_timeout_secs, 120);
        assert_eq!(config.health_timeout_secs, 5);
        assert!(!config.upstream.legacy_latency_average);
    }

    #[test]
    fn test_partial_json_uses_field_defaults() {
        let json = r#"{
            "port": 9100,
            "rateLimit": { "maxRequests": 5 },
            "upstream": { "url": "http://model:8000", "legacyLatencyAverage": true }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.port, Some(9100));
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window_secs, 3600);
        assert_eq!(config.upstream.url, "http://model:8000");
        assert!(config.upstream.legacy_latency_average);
        assert_eq!(config.upstream.max_new_tokens, 2048);
        assert_eq!(config.services.len(), 5);
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let path = std::env::temp_dir().join(format!("chat-gateway-{}.json", uuid::Uuid::new_v4()));
        let config = Config::load(&path).unwrap();
        assert_eq!(config.config_path(), Some(path.as_path()));
        assert_eq!(config.services.len(), 5);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CHAT_SERVICE_URL", "http://chat.internal:80"),
            ("RADON_API_URL", "http://model.internal"),
            ("RADON_API_KEY", "secret-key"),
            ("RATE_LIMIT_MAX_REQUESTS", "7"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.services["chat"], "http://chat.internal:80");
        assert_eq!(config.services["ai"], "http://localhost:8001");
        assert_eq!(config.upstream.url, "http://model.internal");
        assert_eq!(config.upstream.api_key.as_deref(), Some("secret-key"));
        assert_eq!(config.rate_limit.max_requests, 7);
    }

    #[test]
    fn test_env_override_rejects_bad_number() {
        let mut config = Config::default();
        let result = config.apply_overrides_from(|k| {
            (k == "RATE_LIMIT_WINDOW_SECS").then(|| "an hour".to_string())
        });
        assert!(result.is_err());
    }
}
