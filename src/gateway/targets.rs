//! 转发目标表：服务名 -> 基础地址
//!
//! 启动时确定，之后只读，通过 `Arc` 共享。

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ForwardTargets {
    targets: BTreeMap<String, String>,
}

impl ForwardTargets {
    pub fn new(services: &BTreeMap<String, String>) -> Self {
        let targets = services
            .iter()
            .map(|(name, url)| (name.clone(), url.trim_end_matches('/').to_string()))
            .collect();
        Self { targets }
    }

    /// 查找服务的基础地址（不含结尾 `/`）
    pub fn resolve(&self, service: &str) -> Option<&str> {
        self.targets.get(service).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.targets.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}
