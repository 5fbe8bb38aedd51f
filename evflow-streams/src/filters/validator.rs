use super::definition::FilterDefinition;
use crate::error::{StreamsError, StreamsResult};
use crate::ids::{PartitionId, StreamKey, TenantId};
use crate::persist::FilterDefinitions;
use crate::position::ProcessingPosition;
use crate::source::EventFetcher;
use std::sync::Arc;
use tracing::{debug, info};

const VALIDATION_BATCH_SIZE: usize = 500;

/// 过滤器定义校验
///
/// - 从未持久化过：接受并持久化；
/// - 与已持久化定义相同：接受；
/// - 定义变化：对已过滤的事件日志前缀重新过滤，与现有派生流逐条比较，一致才接受。
pub struct FilterValidator {
    fetcher: Arc<dyn EventFetcher>,
    definitions: Arc<dyn FilterDefinitions>,
}

impl FilterValidator {
    pub fn new(fetcher: Arc<dyn EventFetcher>, definitions: Arc<dyn FilterDefinitions>) -> Self {
        Self {
            fetcher,
            definitions,
        }
    }

    /// `filtered_up_to`：过滤器在事件日志上的当前位点（之前的事件都已写入派生流）
    pub async fn validate(
        &self,
        tenant: &TenantId,
        target: &StreamKey,
        definition: &FilterDefinition,
        filtered_up_to: ProcessingPosition,
    ) -> StreamsResult<()> {
        match self.definitions.try_get(tenant, target).await? {
            Some(persisted) if persisted == *definition => {
                debug!(stream = %target, tenant = %tenant, "filter definition unchanged");
                return Ok(());
            }
            Some(persisted) => {
                if persisted.partitioned() != definition.partitioned() {
                    return Err(StreamsError::FilterValidation {
                        reason: format!(
                            "partitioning of stream {target} cannot change from {} to {}",
                            persisted.partitioned(),
                            definition.partitioned()
                        ),
                    });
                }
                self.compare_with_stream(tenant, target, definition, filtered_up_to)
                    .await?;
                info!(stream = %target, tenant = %tenant, "filter definition changed compatibly");
            }
            None => {}
        }
        self.definitions.persist(tenant, target, definition).await
    }

    async fn compare_with_stream(
        &self,
        tenant: &TenantId,
        target: &StreamKey,
        definition: &FilterDefinition,
        filtered_up_to: ProcessingPosition,
    ) -> StreamsResult<()> {
        let expected = self
            .refilter_event_log(tenant, target, definition, filtered_up_to)
            .await?;
        let actual = self.read_stream(tenant, target).await?;

        if expected.len() != actual.len() {
            return Err(StreamsError::FilterValidation {
                reason: format!(
                    "new filter would produce {} events in stream {target}, it has {}",
                    expected.len(),
                    actual.len()
                ),
            });
        }
        if let Some((position, _)) = expected
            .iter()
            .zip(&actual)
            .enumerate()
            .find(|(_, (expected, actual))| expected != actual)
        {
            return Err(StreamsError::FilterValidation {
                reason: format!("new filter diverges from stream {target} at stream position {position}"),
            });
        }
        Ok(())
    }

    /// 事件日志中 `filtered_up_to` 之前命中新定义的事件：(日志位点, 分区)
    async fn refilter_event_log(
        &self,
        tenant: &TenantId,
        target: &StreamKey,
        definition: &FilterDefinition,
        filtered_up_to: ProcessingPosition,
    ) -> StreamsResult<Vec<(u64, PartitionId)>> {
        let log = StreamKey::event_log(target.scope);
        let end = filtered_up_to.log_position();
        let mut matched = Vec::new();
        let mut from = ProcessingPosition::START;

        while from.log_position() < end {
            let batch = self
                .fetcher
                .fetch_next(tenant, &log, from, VALIDATION_BATCH_SIZE)
                .await?;
            let Some(last) = batch.last() else { break };
            from = last.next_position();
            matched.extend(
                batch
                    .iter()
                    .filter(|e| e.event().log_position() < end)
                    .filter_map(|e| {
                        definition
                            .partition_for(e.event())
                            .map(|partition| (e.event().log_position(), partition))
                    }),
            );
        }
        Ok(matched)
    }

    async fn read_stream(
        &self,
        tenant: &TenantId,
        target: &StreamKey,
    ) -> StreamsResult<Vec<(u64, PartitionId)>> {
        let mut events = Vec::new();
        let mut from = ProcessingPosition::START;
        loop {
            let batch = self
                .fetcher
                .fetch_next(tenant, target, from, VALIDATION_BATCH_SIZE)
                .await?;
            let Some(last) = batch.last() else { break };
            from = last.next_position();
            events.extend(
                batch
                    .iter()
                    .map(|e| (e.event().log_position(), e.partition().clone())),
            );
        }
        Ok(events)
    }
}
