use crate::error::{StreamsError, StreamsResult as Result};
use crate::event::{CommittedEvent, StreamEvent};
use crate::ids::{EventSourceId, EventTypeId, PartitionId, ScopeId, StreamKey, TenantId};
use crate::position::ProcessingPosition;
use crate::source::{EventFetcher, EventWaiter, StreamWriter};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// 内存事件存储：事件日志与派生流共用一张 (租户, 流) 表
#[derive(Default)]
pub struct InMemoryEventStore {
    streams: DashMap<(TenantId, StreamKey), Vec<StreamEvent>>,
    appended: Notify,
    failing_fetches: AtomicUsize,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 向租户的事件日志提交一个事件
    pub fn commit(
        &self,
        tenant: TenantId,
        scope: ScopeId,
        event_source: impl Into<EventSourceId>,
        event_type: EventTypeId,
        payload: Value,
    ) -> CommittedEvent {
        let committed = {
            let mut log = self
                .streams
                .entry((tenant, StreamKey::event_log(scope)))
                .or_default();
            let event = CommittedEvent::builder()
                .log_position(log.len() as u64)
                .event_source(event_source)
                .event_type(event_type)
                .payload(payload)
                .build();
            log.push(StreamEvent::from_event_log(event.clone()));
            event
        };
        self.appended.notify_waiters();
        committed
    }

    /// 流中事件的快照
    pub fn events(&self, tenant: &TenantId, stream: &StreamKey) -> Vec<StreamEvent> {
        self.streams
            .get(&(*tenant, *stream))
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// 让接下来的 `count` 次拉取返回基础设施错误
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    fn len(&self, tenant: &TenantId, stream: &StreamKey) -> u64 {
        self.streams
            .get(&(*tenant, *stream))
            .map_or(0, |events| events.len() as u64)
    }

    fn injected_failure(&self) -> Result<()> {
        let consumed = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StreamsError::fetch("injected fetch failure")),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl EventFetcher for InMemoryEventStore {
    async fn fetch_next(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        from: ProcessingPosition,
        limit: usize,
    ) -> Result<Vec<StreamEvent>> {
        self.injected_failure()?;
        let Some(events) = self.streams.get(&(*tenant, *stream)) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(from.stream_position()).unwrap_or(usize::MAX);
        Ok(events.iter().skip(start).take(limit).cloned().collect())
    }

    async fn fetch_in_partition(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        partition: &PartitionId,
        from: ProcessingPosition,
    ) -> Result<Option<StreamEvent>> {
        self.injected_failure()?;
        let Some(events) = self.streams.get(&(*tenant, *stream)) else {
            return Ok(None);
        };
        let start = usize::try_from(from.stream_position()).unwrap_or(usize::MAX);
        Ok(events
            .iter()
            .skip(start)
            .find(|e| e.partition() == partition)
            .cloned())
    }
}

#[async_trait]
impl EventWaiter for InMemoryEventStore {
    async fn wait_for_event(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        after: u64,
        timeout: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if self.len(tenant, stream) > after {
                return;
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl StreamWriter for InMemoryEventStore {
    async fn write(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        event: &CommittedEvent,
        partition: &PartitionId,
        partitioned: bool,
    ) -> Result<()> {
        {
            let mut events = self.streams.entry((*tenant, *stream)).or_default();
            let already_written = events
                .last()
                .is_some_and(|last| last.event().log_position() >= event.log_position());
            if already_written {
                return Ok(());
            }
            let position = events.len() as u64;
            events.push(StreamEvent::new(
                event.clone(),
                position,
                partition.clone(),
                partitioned,
            ));
        }
        self.appended.notify_waiters();
        Ok(())
    }
}
