use crate::error::StreamsResult as Result;
use crate::event::CommittedEvent;
use crate::ids::{PartitionId, StreamKey, TenantId};
use async_trait::async_trait;

/// 派生流写入器
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// 追加事件到派生流；同一日志位点重复写入必须是幂等的（至少一次语义下会重放）
    async fn write(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        event: &CommittedEvent,
        partition: &PartitionId,
        partitioned: bool,
    ) -> Result<()>;
}
