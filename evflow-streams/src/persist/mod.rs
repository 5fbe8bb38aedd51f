//! 持久化协议（persist）
//!
//! - `StreamProcessorStates`：按 (ProcessorId, 租户) 存取 `ProcessorState`；
//! - `FilterDefinitions`：持久化过滤器定义，用于注册时校验过滤器是否变更。
//!
//! 具体存储后端由上层实现并注入；`inmemory` 模块提供测试用实现。
//!
use crate::error::StreamsResult as Result;
use crate::filters::FilterDefinition;
use crate::ids::{ProcessorId, StreamKey, TenantId};
use crate::state::ProcessorState;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait StreamProcessorStates: Send + Sync {
    /// `None` 表示从未注册过，调用方以起点状态初始化
    async fn try_get(&self, id: &ProcessorId, tenant: &TenantId) -> Result<Option<ProcessorState>>;

    /// upsert 语义；不同键之间必须可以并发写入
    async fn persist(&self, id: &ProcessorId, tenant: &TenantId, state: &ProcessorState)
    -> Result<()>;
}

#[async_trait]
impl<T> StreamProcessorStates for Arc<T>
where
    T: StreamProcessorStates + ?Sized,
{
    async fn try_get(&self, id: &ProcessorId, tenant: &TenantId) -> Result<Option<ProcessorState>> {
        (**self).try_get(id, tenant).await
    }

    async fn persist(
        &self,
        id: &ProcessorId,
        tenant: &TenantId,
        state: &ProcessorState,
    ) -> Result<()> {
        (**self).persist(id, tenant, state).await
    }
}

#[async_trait]
pub trait FilterDefinitions: Send + Sync {
    async fn try_get(&self, tenant: &TenantId, stream: &StreamKey)
    -> Result<Option<FilterDefinition>>;

    async fn persist(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        definition: &FilterDefinition,
    ) -> Result<()>;
}
