use crate::error::{StreamsError, StreamsResult as Result};
use crate::ids::{ProcessorId, TenantId};
use crate::persist::StreamProcessorStates;
use crate::state::ProcessorState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// 内存处理器状态存储，记录每次持久化以便断言
#[derive(Default)]
pub struct InMemoryStreamProcessorStates {
    states: DashMap<(ProcessorId, TenantId), ProcessorState>,
    history: Mutex<Vec<(ProcessorId, TenantId, ProcessorState)>>,
    failing_persists: AtomicUsize,
}

impl InMemoryStreamProcessorStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有成功的持久化，按发生顺序
    pub fn history(&self) -> Vec<(ProcessorId, TenantId, ProcessorState)> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn persist_count(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 让接下来的 `count` 次持久化返回基础设施错误
    pub fn fail_next_persists(&self, count: usize) {
        self.failing_persists.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamProcessorStates for InMemoryStreamProcessorStates {
    async fn try_get(&self, id: &ProcessorId, tenant: &TenantId) -> Result<Option<ProcessorState>> {
        Ok(self.states.get(&(*id, *tenant)).map(|s| s.clone()))
    }

    async fn persist(
        &self,
        id: &ProcessorId,
        tenant: &TenantId,
        state: &ProcessorState,
    ) -> Result<()> {
        if self
            .failing_persists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StreamsError::persistence("injected persist failure"));
        }
        // 经由 JSON 往返，保证与持久化后端看到的内容一致
        let stored: ProcessorState = serde_json::from_str(&serde_json::to_string(state)?)?;
        self.states.insert((*id, *tenant), stored);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*id, *tenant, state.clone()));
        Ok(())
    }
}
