use super::outcome::DEFAULT_OUTCOME_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 流处理器配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamProcessorConfig {
    /// 单次拉取的事件数
    pub batch_size: usize,
    /// 等待新事件/计划重试的最长单次等待
    pub max_wait: Duration,
    /// 基础设施错误（拉取、持久化）的固定重试间隔
    pub infrastructure_retry_delay: Duration,
    /// 远端未给出重试间隔时的指数退避基数
    pub retry_backoff_base: Duration,
    /// 指数退避上限
    pub max_retry_backoff: Duration,
    /// 处理结果广播通道容量
    pub outcome_capacity: usize,
}

impl Default for StreamProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_wait: Duration::from_secs(60),
            infrastructure_retry_delay: Duration::from_secs(1),
            retry_backoff_base: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
            outcome_capacity: DEFAULT_OUTCOME_CAPACITY,
        }
    }
}

impl StreamProcessorConfig {
    /// 第 `retry_attempts` 次失败后的退避：base * 2^(n-1)，不超过上限
    pub fn retry_backoff(&self, retry_attempts: u32) -> Duration {
        let exponent = retry_attempts.saturating_sub(1).min(16);
        self.retry_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_backoff)
    }
}
