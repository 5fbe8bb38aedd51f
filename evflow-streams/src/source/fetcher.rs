use crate::error::StreamsResult as Result;
use crate::event::StreamEvent;
use crate::ids::{PartitionId, StreamKey, TenantId};
use crate::position::ProcessingPosition;
use async_trait::async_trait;

/// 事件拉取器
#[async_trait]
pub trait EventFetcher: Send + Sync {
    /// 从 `from`（含）开始拉取至多 `limit` 个事件；
    /// 空结果表示“暂时没有事件”，引擎据此进入等待而非报错。
    async fn fetch_next(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        from: ProcessingPosition,
        limit: usize,
    ) -> Result<Vec<StreamEvent>>;

    /// 分区流：返回 `partition` 中位于 `from`（含）之后的第一个事件
    async fn fetch_in_partition(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        partition: &PartitionId,
        from: ProcessingPosition,
    ) -> Result<Option<StreamEvent>>;
}
