//! 流处理器（StreamProcessor）
//!
//! 把一个 `ProcessorId` 扇出到全部租户：每个租户一个 `ScopedStreamProcessor` 任务。
//! 任一租户循环以非预期错误结束时，整个处理器被标记为失败并优雅停止其余租户，
//! 必须重新注册才能恢复；其他处理器不受影响。
//!
use super::dependencies::StreamProcessorDependencies;
use super::processor::Processor;
use super::scoped::{ProcessorStatus, ScopedStreamProcessor};
use super::strategy::PositionStrategy;
use crate::error::{StreamsError, StreamsResult};
use crate::execution_context::ExecutionContext;
use crate::ids::{ProcessorId, TenantId};
use crate::position::ProcessingPosition;
use crate::state::ProcessorState;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 处理器结束后的结局
#[derive(Debug, Clone, PartialEq, Eq)]
enum Completion {
    Stopped,
    Failed { tenant: TenantId, reason: String },
}

enum Lifecycle {
    Created,
    Running(CancellationToken),
    StoppedBeforeStart,
}

pub struct StreamProcessor {
    id: ProcessorId,
    tenants: BTreeMap<TenantId, Arc<ScopedStreamProcessor>>,
    lifecycle: Mutex<Lifecycle>,
    completion: watch::Sender<Option<Completion>>,
}

impl StreamProcessor {
    /// 为每个租户加载（或初始化）状态并构造处理器；存储错误直接返回，注册因此被拒绝
    pub async fn create<F>(
        id: ProcessorId,
        tenants: Vec<TenantId>,
        strategy: Arc<dyn PositionStrategy>,
        processor_for: F,
        execution_context: &ExecutionContext,
        deps: StreamProcessorDependencies,
    ) -> StreamsResult<Self>
    where
        F: Fn(&TenantId) -> Arc<dyn Processor>,
    {
        let mut scoped = BTreeMap::new();
        for tenant in tenants {
            let state = deps
                .states
                .try_get(&id, &tenant)
                .await?
                .unwrap_or_else(ProcessorState::initial);
            let processor = ScopedStreamProcessor::new(
                id,
                tenant,
                state,
                processor_for(&tenant),
                strategy.clone(),
                execution_context,
                deps.clone(),
            );
            scoped.insert(tenant, Arc::new(processor));
        }

        Ok(Self {
            id,
            tenants: scoped,
            lifecycle: Mutex::new(Lifecycle::Created),
            completion: watch::channel(None).0,
        })
    }

    pub fn id(&self) -> &ProcessorId {
        &self.id
    }

    pub fn tenants(&self) -> impl Iterator<Item = &TenantId> {
        self.tenants.keys()
    }

    /// 启动所有租户循环；`lifetime` 取消时全部停止
    pub fn start(&self, lifetime: &CancellationToken) -> StreamsResult<()> {
        let token = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Created => {
                    let token = lifetime.child_token();
                    *lifecycle = Lifecycle::Running(token.clone());
                    token
                }
                Lifecycle::Running(_) | Lifecycle::StoppedBeforeStart => {
                    return Err(StreamsError::AlreadyStarted { processor: self.id });
                }
            }
        };

        let mut tasks = JoinSet::new();
        for (tenant, scoped) in &self.tenants {
            let tenant = *tenant;
            let scoped = scoped.clone();
            let token = token.clone();
            tasks.spawn(async move { (tenant, scoped.run(token).await) });
        }

        info!(processor = %self.id, tenants = self.tenants.len(), "stream processor starting");
        tokio::spawn(supervise(self.id, tasks, token, self.completion.clone()));
        Ok(())
    }

    /// 请求停止；`completed()` 在全部租户循环退出后返回
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match &*lifecycle {
            Lifecycle::Running(token) => token.cancel(),
            Lifecycle::Created => {
                *lifecycle = Lifecycle::StoppedBeforeStart;
                for scoped in self.tenants.values() {
                    scoped.close_reposition();
                }
                self.completion.send_replace(Some(Completion::Stopped));
            }
            Lifecycle::StoppedBeforeStart => {}
        }
    }

    /// 等待处理器结束；任一租户失败时返回 `ProcessorFailed`
    pub async fn completed(&self) -> StreamsResult<()> {
        let mut receiver = self.completion.subscribe();
        let completion = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| StreamsError::Cancelled)?
            .clone();
        match completion {
            Some(Completion::Failed { tenant, reason }) => {
                Err(StreamsError::ProcessorFailed { tenant, reason })
            }
            _ => Ok(()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion.borrow().is_some()
    }

    /// 启动前提交的重定位会排队到租户循环开始；启动前停止则以 `Cancelled` 结束
    pub async fn reprocess_from(
        &self,
        tenant: &TenantId,
        position: ProcessingPosition,
    ) -> StreamsResult<ProcessingPosition> {
        self.scoped(tenant)?.reprocess_from(position).await
    }

    pub async fn perform_action_and_reprocess_from<F, Fut>(
        &self,
        tenant: &TenantId,
        position: ProcessingPosition,
        action: F,
    ) -> StreamsResult<ProcessingPosition>
    where
        F: FnOnce(TenantId) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.scoped(tenant)?
            .perform_action_and_reprocess_from(position, action)
            .await
    }

    /// 所有租户并发回到起点
    pub async fn reprocess_all_from_start(
        &self,
    ) -> BTreeMap<TenantId, StreamsResult<ProcessingPosition>> {
        let results = join_all(self.tenants.iter().map(|(tenant, scoped)| async move {
            (*tenant, scoped.reprocess_from(ProcessingPosition::START).await)
        }))
        .await;
        results.into_iter().collect()
    }

    pub fn current_state(&self, tenant: &TenantId) -> Option<ProcessorState> {
        self.tenants.get(tenant).map(|s| s.current_state())
    }

    pub fn states(&self) -> BTreeMap<TenantId, ProcessorState> {
        self.tenants
            .iter()
            .map(|(tenant, scoped)| (*tenant, scoped.current_state()))
            .collect()
    }

    pub fn status(&self, tenant: &TenantId) -> Option<ProcessorStatus> {
        self.tenants.get(tenant).map(|s| s.status())
    }

    fn scoped(&self, tenant: &TenantId) -> StreamsResult<&Arc<ScopedStreamProcessor>> {
        self.tenants
            .get(tenant)
            .ok_or(StreamsError::TenantNotRunning {
                processor: self.id,
                tenant: *tenant,
            })
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        if let Lifecycle::Running(token) =
            &*self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
        {
            token.cancel();
        }
    }
}

async fn supervise(
    id: ProcessorId,
    mut tasks: JoinSet<(TenantId, StreamsResult<()>)>,
    token: CancellationToken,
    completion: watch::Sender<Option<Completion>>,
) {
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let failed = match joined {
            Ok((_, Ok(()))) => None,
            Ok((tenant, Err(err))) => Some((tenant, err.to_string())),
            Err(join_err) => Some((TenantId::default(), join_err.to_string())),
        };
        if let Some((tenant, reason)) = failed {
            error!(processor = %id, tenant = %tenant, reason = %reason, "stream processor failed, stopping remaining tenants");
            token.cancel();
            failure.get_or_insert(Completion::Failed { tenant, reason });
        }
    }
    info!(processor = %id, "stream processor completed");
    completion.send_replace(Some(failure.unwrap_or(Completion::Stopped)));
}
