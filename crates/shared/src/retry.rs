//! 事实源打开失败时的退避重试
//!
//! [`RetryPolicy`] 只描述退避节奏，[`RetryPolicy::backoff`] 把它展开为逐次的等待时间；
//! [`retry_with_policy`] 按这个序列重跑操作，哪些错误值得重试由调用方判定。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

/// 退避策略
///
/// 第一次重试前等待 `initial_delay`，之后每次乘以 `multiplier`，单次等待不超过 `max_delay`。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 首次尝试之外的最多重试次数
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 小于 1 或非有限值按 1 处理，即固定间隔
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 失败即返回，不做任何重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// 展开为逐次重试前的等待时间，长度等于 `max_retries`
    pub fn backoff(&self) -> Backoff {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        Backoff {
            next: self.initial_delay,
            max_delay: self.max_delay,
            multiplier,
            remaining: self.max_retries,
        }
    }
}

/// 退避序列
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max_delay: Duration,
    multiplier: f64,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next.min(self.max_delay);
        // 乘积溢出 Duration 时直接封顶
        self.next = Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .map_or(self.max_delay, |next| next.min(self.max_delay));
        Some(delay)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Backoff {}

/// 按策略重跑异步操作
///
/// `is_retryable` 返回 false 的错误立即返回；退避序列用尽后返回最后一次的错误。
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delays = policy.backoff();
    let mut failures: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    info!(operation = operation_name, failures, "重试后成功");
                }
                return Ok(value);
            }
            Err(err) => err,
        };
        failures += 1;

        if !is_retryable(&err) {
            debug!(operation = operation_name, error = %err, "错误不可重试");
            return Err(err);
        }
        let Some(delay) = delays.next() else {
            if policy.is_enabled() {
                warn!(operation = operation_name, failures, error = %err, "重试次数已用尽");
            }
            return Err(err);
        };

        warn!(
            operation = operation_name,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "失败，退避后重试"
        );
        tokio::time::sleep(delay).await;
    }
}
