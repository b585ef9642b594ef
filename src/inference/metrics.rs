//! 推理指标
//!
//! 进程级聚合：总请求数、总 token 数、平均延迟、错误数、最近请求时间。

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// 平均延迟算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyAverage {
    /// 真实的累计均值
    Running,
    /// `(旧均值 + 新延迟) / 2`，与已有看板保持一致
    Legacy,
}

impl LatencyAverage {
    pub fn from_legacy_flag(legacy: bool) -> Self {
        if legacy { Self::Legacy } else { Self::Running }
    }
}

/// 指标快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_tokens: u64,
    /// 平均延迟（秒）
    pub average_latency: f64,
    pub error_count: u64,
    pub last_request: Option<DateTime<Utc>>,
}

pub struct Metrics {
    mode: LatencyAverage,
    inner: Mutex<MetricsSnapshot>,
}

impl Metrics {
    pub fn new(mode: LatencyAverage) -> Self {
        Self {
            mode,
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    /// 记录一次成功的推理
    pub fn record_success(&self, tokens: u64, latency: Duration) {
        let latency = latency.as_secs_f64();
        let mut m = self.inner.lock();
        m.total_requests += 1;
        m.total_tokens = m.total_tokens.saturating_add(tokens);
        m.average_latency = match self.mode {
            LatencyAverage::Running => {
                m.average_latency + (latency - m.average_latency) / m.total_requests as f64
            }
            LatencyAverage::Legacy => (m.average_latency + latency) / 2.0,
        };
        m.last_request = Some(Utc::now());
    }

    pub fn record_error(&self) {
        self.inner.lock().error_count += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(LatencyAverage::Running)
    }
}
