//! 流处理器注册表
//!
//! 以 `DashMap` 做“检查并预留”：同一 `ProcessorId` 只允许一个注册者，
//! 工厂在任何分片锁之外执行，工厂失败（或注册 future 被丢弃）时释放预留。
//!
use super::stream_processor::StreamProcessor;
use crate::error::{StreamsError, StreamsResult};
use crate::ids::ProcessorId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

enum Slot {
    Reserved,
    Ready(Arc<StreamProcessor>),
}

#[derive(Default)]
pub struct StreamProcessorRegistry {
    processors: DashMap<ProcessorId, Slot>,
    resolved: Notify,
}

impl StreamProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预留 `id` 后执行工厂；已存在时直接返回 `AlreadyRegistered`，不调用工厂
    pub async fn try_register<F, Fut>(
        &self,
        id: ProcessorId,
        factory: F,
    ) -> StreamsResult<Arc<StreamProcessor>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StreamsResult<StreamProcessor>>,
    {
        match self.processors.entry(id) {
            Entry::Occupied(_) => {
                return Err(StreamsError::AlreadyRegistered { processor: id });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Reserved);
            }
        }
        let reservation = Reservation {
            registry: self,
            id,
            committed: false,
        };

        let processor = Arc::new(factory().await?);
        reservation.commit(processor.clone());
        debug!(processor = %id, "stream processor registered");
        Ok(processor)
    }

    /// 移除并返回处理器；若并发注册仍持有预留，等待其结束后再移除
    pub async fn unregister(&self, id: &ProcessorId) -> Option<Arc<StreamProcessor>> {
        loop {
            let resolved = self.resolved.notified();
            tokio::pin!(resolved);
            resolved.as_mut().enable();

            if let Some((_, Slot::Ready(processor))) = self
                .processors
                .remove_if(id, |_, slot| matches!(slot, Slot::Ready(_)))
            {
                debug!(processor = %id, "stream processor unregistered");
                return Some(processor);
            }
            let reserved = self
                .processors
                .get(id)
                .is_some_and(|slot| matches!(*slot, Slot::Reserved));
            if !reserved {
                return None;
            }
            resolved.await;
        }
    }

    pub fn get(&self, id: &ProcessorId) -> Option<Arc<StreamProcessor>> {
        self.processors.get(id).and_then(|slot| match &*slot {
            Slot::Ready(processor) => Some(processor.clone()),
            Slot::Reserved => None,
        })
    }

    pub fn contains(&self, id: &ProcessorId) -> bool {
        self.processors.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ProcessorId> {
        self.processors.iter().map(|entry| *entry.key()).collect()
    }
}

struct Reservation<'a> {
    registry: &'a StreamProcessorRegistry,
    id: ProcessorId,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, processor: Arc<StreamProcessor>) {
        self.registry
            .processors
            .insert(self.id, Slot::Ready(processor));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry
                .processors
                .remove_if(&self.id, |_, slot| matches!(slot, Slot::Reserved));
        }
        self.registry.resolved.notify_waiters();
    }
}
