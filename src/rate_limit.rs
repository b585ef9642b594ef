//! 固定窗口速率限制
//!
//! 按 (身份, 端点) 计数，每个键独立的窗口。键总数有上限：
//! 插入新键时先清理过期窗口，仍然超限则淘汰窗口开始时间最早的键。
//! 按窗口开始时间排序的索引让清理和淘汰只触及最早的若干键。

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::model::config::RateLimitConfig;

/// 速率限制器
///
/// 转发器只依赖这个 trait，测试中可以替换成固定放行/拒绝的实现
pub trait RateLimiter: Send + Sync {
    /// 记录一次请求并返回是否放行
    fn allow(&self, identity: &str, endpoint: &str) -> bool;
}

/// 速率窗口
#[derive(Debug, Clone)]
struct RateWindow {
    /// 窗口内已计数的请求
    count: u32,
    /// 窗口开始时间
    window_start: Instant,
}

/// 计数表与按窗口开始时间排序的索引，两者的键集合始终一致
#[derive(Debug, Default)]
struct WindowTable {
    windows: HashMap<String, RateWindow>,
    order: BTreeSet<(Instant, String)>,
}

impl WindowTable {
    fn len(&self) -> usize {
        self.windows.len()
    }

    fn insert(&mut self, key: String, now: Instant) {
        self.order.insert((now, key.clone()));
        self.windows.insert(
            key,
            RateWindow {
                count: 1,
                window_start: now,
            },
        );
    }

    /// 重新开始某个键的窗口
    fn restart(&mut self, key: &str, now: Instant) {
        if let Some(entry) = self.windows.get_mut(key) {
            let start = std::mem::replace(&mut entry.window_start, now);
            entry.count = 1;
            self.order.remove(&(start, key.to_string()));
            self.order.insert((now, key.to_string()));
        }
    }

    /// 移除窗口开始时间最早的键
    fn pop_oldest(&mut self) -> Option<(Instant, String)> {
        let (start, key) = self.order.pop_first()?;
        self.windows.remove(&key);
        Some((start, key))
    }

    fn oldest_start(&self) -> Option<Instant> {
        self.order.first().map(|(start, _)| *start)
    }
}

/// 固定窗口限流器
pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    windows: Mutex<WindowTable>,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys: max_keys.max(1),
            windows: Mutex::new(WindowTable::default()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_requests,
            Duration::from_secs(config.window_secs),
            config.max_keys,
        )
    }

    /// 当前跟踪的键数量
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    fn allow_at(&self, key: String, now: Instant) -> bool {
        let mut table = self.windows.lock();

        if let Some(entry) = table.windows.get_mut(&key) {
            if now.saturating_duration_since(entry.window_start) < self.window {
                entry.count = entry.count.saturating_add(1);
                return entry.count <= self.max_requests;
            }
            table.restart(&key, now);
            return true;
        }

        if table.len() >= self.max_keys {
            self.make_room(&mut table, now);
        }
        table.insert(key, now);
        self.max_requests >= 1
    }

    /// 为新键腾出空间
    ///
    /// 先从最早的一端清理过期窗口，仍然超限再淘汰最早的键。
    fn make_room(&self, table: &mut WindowTable, now: Instant) {
        while let Some(start) = table.oldest_start() {
            if now.saturating_duration_since(start) < self.window {
                break;
            }
            table.pop_oldest();
        }

        while table.len() >= self.max_keys {
            if table.pop_oldest().is_none() {
                break;
            }
        }
        tracing::debug!(tracked = table.len(), "速率限制键数量达到上限，已清理");
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn allow(&self, identity: &str, endpoint: &str) -> bool {
        self.allow_at(format!("{}:{}", identity, endpoint), Instant::now())
    }
}
