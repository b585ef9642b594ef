//! 重试策略
//!
//! 非流式上游调用的重试：最大尝试次数、基础延迟和退避函数，
//! 等待通过 `Sleeper` 注入，测试中使用记录型假时钟。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;

use super::orchestrator::CallState;

/// 等待抽象
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// 基于 tokio 定时器的实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 退避函数：(基础延迟, 已失败次数) -> 下次等待时间
pub type BackoffFn = fn(Duration, u32) -> Duration;

/// 指数退避：base, 2*base, 4*base ...
pub fn exponential_backoff(base: Duration, failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: BackoffFn,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: exponential_backoff,
        }
    }

    /// 第 `failures` 次失败之后、下一次尝试之前的等待时间
    pub fn delay_before_retry(&self, failures: u32) -> Duration {
        (self.backoff)(self.base_delay, failures)
    }

    /// 第 `attempt` 次尝试失败后的调用状态
    pub fn state_after_failure(&self, attempt: u32, err: &GatewayError) -> CallState {
        if attempt < self.max_attempts && is_retryable(err) {
            CallState::Retrying
        } else {
            CallState::Failed
        }
    }

    /// 执行操作，失败时按策略重试
    ///
    /// `op` 接收从 1 开始的尝试序号。只有可重试的错误才会重试，
    /// 耗尽次数后返回最后一次的错误。
    pub async fn execute<T, F, Fut>(&self, sleeper: &dyn Sleeper, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let state = self.state_after_failure(attempt, &err);
            if state != CallState::Retrying {
                return Err(err);
            }
            let delay = self.delay_before_retry(attempt);
            tracing::warn!(
                state = ?state,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "上游调用失败，准备重试: {}",
                err
            );
            sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1))
    }
}

/// 超时、非 2xx、连接失败和其他传输错误可重试；请求本身的问题不重试
fn is_retryable(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::UpstreamTimeout
            | GatewayError::UpstreamError { .. }
            | GatewayError::ServiceUnavailable(_)
            | GatewayError::InternalError(_)
    )
}
