use crate::ids::{StreamKey, TenantId};
use async_trait::async_trait;
use std::time::Duration;

/// 事件等待器
#[async_trait]
pub trait EventWaiter: Send + Sync {
    /// 当流中出现位于 `after`（流内位点）及之后的事件时提前返回，否则在 `timeout` 后返回
    async fn wait_for_event(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        after: u64,
        timeout: Duration,
    );
}
