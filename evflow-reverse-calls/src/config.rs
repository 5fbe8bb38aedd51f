use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 反向调用连接配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseCallConfig {
    /// 等待首条连接消息的时限
    pub connect_timeout: Duration,
    /// 存活期限 = 心跳间隔 × 该倍数
    pub keepalive_multiplier: u32,
    /// 进程内传输的消息队列容量
    pub call_queue_capacity: usize,
}

impl Default for ReverseCallConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_multiplier: 3,
            call_queue_capacity: 64,
        }
    }
}

impl ReverseCallConfig {
    pub fn keepalive_timeout(&self, ping_interval: Duration) -> Duration {
        ping_interval.saturating_mul(self.keepalive_multiplier.max(1))
    }
}
