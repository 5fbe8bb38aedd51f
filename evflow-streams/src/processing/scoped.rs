//! 单租户流处理器（ScopedStreamProcessor）
//!
//! 每个 (ProcessorId, 租户) 一个长驻任务，循环执行：
//! 1. 处理挂起的重定位请求；
//! 2. 追赶已到期的失败（重试/补处理被跳过的分区事件）；
//! 3. 拉取下一批事件并逐个交给处理器，每个事件处理后持久化一次状态；
//! 4. 没有事件时在 `EventWaiter` 上等待，最长不超过下一次计划重试或 `max_wait`。
//!
//! 每个挂起点都同时监听生命周期取消与重定位唤醒信号。
//!
use super::dependencies::StreamProcessorDependencies;
use super::outcome::{OutcomeKind, ProcessingOutcome};
use super::processor::{ProcessingResult, Processor};
use super::strategy::{FailureTarget, PositionStrategy, RecordedFailure};
use crate::clock::duration_until;
use crate::error::{StreamsError, StreamsResult};
use crate::event::StreamEvent;
use crate::execution_context::ExecutionContext;
use crate::ids::{ProcessorId, TenantId};
use crate::position::ProcessingPosition;
use crate::state::ProcessorState;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 引擎当前所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorStatus {
    NotStarted,
    Fetching,
    Processing,
    CatchingUpFailures,
    Repositioning,
    Stopped,
}

/// 重定位前执行的前置动作（例如通知客户端清理读模型）
pub type RepositionAction =
    Box<dyn FnOnce(TenantId) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct PendingReposition {
    target: ProcessingPosition,
    action: RepositionAction,
    reply: oneshot::Sender<StreamsResult<ProcessingPosition>>,
}

enum RepositionSlot {
    Idle,
    Pending(PendingReposition),
    InProgress,
    Closed,
}

enum Wake {
    Elapsed,
    Restart,
    Cancelled,
}

pub struct ScopedStreamProcessor {
    id: ProcessorId,
    tenant: TenantId,
    processor: Arc<dyn Processor>,
    strategy: Arc<dyn PositionStrategy>,
    execution_context: ExecutionContext,
    deps: StreamProcessorDependencies,
    state: RwLock<ProcessorState>,
    status: Mutex<ProcessorStatus>,
    reposition: Mutex<RepositionSlot>,
    restart: Notify,
}

impl ScopedStreamProcessor {
    pub fn new(
        id: ProcessorId,
        tenant: TenantId,
        initial_state: ProcessorState,
        processor: Arc<dyn Processor>,
        strategy: Arc<dyn PositionStrategy>,
        execution_context: &ExecutionContext,
        deps: StreamProcessorDependencies,
    ) -> Self {
        Self {
            id,
            tenant,
            processor,
            strategy,
            execution_context: execution_context.for_tenant(tenant),
            deps,
            state: RwLock::new(initial_state),
            status: Mutex::new(ProcessorStatus::NotStarted),
            reposition: Mutex::new(RepositionSlot::Idle),
            restart: Notify::new(),
        }
    }

    pub fn id(&self) -> &ProcessorId {
        &self.id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// 最近一次持久化的状态
    pub fn current_state(&self) -> ProcessorState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> ProcessorStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 执行前置动作后把处理器重定位到 `position`（只能回退或原地），返回新位点
    pub async fn perform_action_and_reprocess_from<F, Fut>(
        &self,
        position: ProcessingPosition,
        action: F,
    ) -> StreamsResult<ProcessingPosition>
    where
        F: FnOnce(TenantId) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (reply, completion) = oneshot::channel();
        {
            let mut slot = self.reposition.lock().unwrap_or_else(PoisonError::into_inner);
            match *slot {
                RepositionSlot::Idle => {
                    *slot = RepositionSlot::Pending(PendingReposition {
                        target: position,
                        action: Box::new(move |tenant| Box::pin(action(tenant))),
                        reply,
                    });
                }
                RepositionSlot::Pending(_) | RepositionSlot::InProgress => {
                    return Err(StreamsError::AlreadyRepositioning {
                        processor: self.id,
                        tenant: self.tenant,
                    });
                }
                RepositionSlot::Closed => {
                    return Err(StreamsError::TenantNotRunning {
                        processor: self.id,
                        tenant: self.tenant,
                    });
                }
            }
        }
        self.restart.notify_one();
        completion.await.unwrap_or(Err(StreamsError::Cancelled))
    }

    pub async fn reprocess_from(
        &self,
        position: ProcessingPosition,
    ) -> StreamsResult<ProcessingPosition> {
        self.perform_action_and_reprocess_from(position, |_| async { Ok(()) })
            .await
    }

    /// 运行处理循环直到 `lifetime` 被取消；只有非预期错误才会返回 `Err`
    pub async fn run(self: Arc<Self>, lifetime: CancellationToken) -> StreamsResult<()> {
        let mut state = self.current_state();
        info!(
            processor = %self.id,
            tenant = %self.tenant,
            position = %state.position(),
            strategy = self.strategy.name(),
            kind = self.processor.kind(),
            "stream processor started"
        );

        let result = self.run_loop(&mut state, &lifetime).await;
        self.close_reposition();
        self.set_status(ProcessorStatus::Stopped);

        match result {
            Ok(()) | Err(StreamsError::Cancelled) => {
                info!(processor = %self.id, tenant = %self.tenant, "stream processor stopped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_loop(
        &self,
        state: &mut ProcessorState,
        lifetime: &CancellationToken,
    ) -> StreamsResult<()> {
        loop {
            if lifetime.is_cancelled() {
                return Ok(());
            }
            self.apply_pending_reposition(state, lifetime).await?;

            let now = self.deps.clock.now();
            if let Some(target) = self.strategy.due_failure(state, now) {
                self.set_status(ProcessorStatus::CatchingUpFailures);
                self.catch_up(state, target, lifetime).await?;
                continue;
            }

            if self.strategy.blocks_progress(state) {
                self.set_status(ProcessorStatus::CatchingUpFailures);
                let wait = self.wait_budget(state);
                if let Wake::Cancelled = self.pause(wait, lifetime).await {
                    return Ok(());
                }
                continue;
            }

            self.set_status(ProcessorStatus::Fetching);
            let batch = match self
                .deps
                .fetcher
                .fetch_next(
                    &self.tenant,
                    &self.id.source(),
                    state.position(),
                    self.deps.config.batch_size,
                )
                .await
            {
                Ok(batch) => batch,
                Err(err) if err.is_infrastructure() => {
                    warn!(processor = %self.id, tenant = %self.tenant, error = %err, "fetching events failed");
                    if let Wake::Cancelled = self
                        .pause(self.deps.config.infrastructure_retry_delay, lifetime)
                        .await
                    {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            if batch.is_empty() {
                let wait = self.wait_budget(state);
                if let Wake::Cancelled = self.wait_for_events(state, wait, lifetime).await {
                    return Ok(());
                }
                continue;
            }

            self.set_status(ProcessorStatus::Processing);
            self.process_batch(state, batch, lifetime).await?;
        }
    }

    async fn process_batch(
        &self,
        state: &mut ProcessorState,
        batch: Vec<StreamEvent>,
        lifetime: &CancellationToken,
    ) -> StreamsResult<()> {
        for event in batch {
            if lifetime.is_cancelled() || self.has_pending_reposition() {
                return Ok(());
            }
            if event.position() < state.position() {
                continue;
            }

            if !self.strategy.should_dispatch(state, &event) {
                let next = self.strategy.on_skipped(state, &event);
                self.commit(state, next, lifetime).await?;
                self.publish(event.position(), OutcomeKind::Skipped);
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = lifetime.cancelled() => return Ok(()),
                result = self.processor.process(&event, &self.execution_context) => result,
            };
            if lifetime.is_cancelled() {
                return Ok(());
            }

            let now = self.deps.clock.now();
            match result {
                ProcessingResult::Success => {
                    let next = self.strategy.on_processed(state, &event, now);
                    self.commit(state, next, lifetime).await?;
                    self.publish(event.position(), OutcomeKind::Processed);
                }
                ProcessingResult::Retry {
                    reason,
                    retry_timeout,
                } => {
                    let failure = self.retry_failure(reason, 1, retry_timeout);
                    let step = self.strategy.on_failed(state, &event, failure.clone());
                    self.commit(state, step.state, lifetime).await?;
                    self.publish_failure(event.position(), &failure);
                    if !step.continue_batch {
                        return Ok(());
                    }
                }
                ProcessingResult::Fail { reason } => {
                    let failure = self.terminal_failure(reason, 1);
                    let step = self.strategy.on_failed(state, &event, failure.clone());
                    self.commit(state, step.state, lifetime).await?;
                    self.publish_failure(event.position(), &failure);
                    if !step.continue_batch {
                        return Ok(());
                    }
                }
                ProcessingResult::Disconnected { reason } => {
                    self.on_disconnected(event.position(), reason, lifetime).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn catch_up(
        &self,
        state: &mut ProcessorState,
        target: FailureTarget,
        lifetime: &CancellationToken,
    ) -> StreamsResult<()> {
        let source = self.id.source();
        let event = match self
            .strategy
            .fetch_failing_event(
                self.deps.fetcher.as_ref(),
                &self.tenant,
                &source,
                state,
                &target,
            )
            .await
        {
            Ok(event) => event,
            Err(err) if err.is_infrastructure() => {
                warn!(processor = %self.id, tenant = %self.tenant, error = %err, "fetching failing event failed");
                self.pause(self.deps.config.infrastructure_retry_delay, lifetime)
                    .await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let Some(event) = event else {
            match self.strategy.on_failure_vanished(state, &target) {
                Some(next) => self.commit(state, next, lifetime).await?,
                None => {
                    let wait = self.deps.config.max_wait;
                    self.wait_for_events(state, wait, lifetime).await;
                }
            }
            return Ok(());
        };

        debug!(
            processor = %self.id,
            tenant = %self.tenant,
            position = %event.position(),
            retry_attempts = target.retry_attempts,
            "catching up failing event"
        );
        let call = async {
            if target.retry_attempts == 0 {
                self.processor.process(&event, &self.execution_context).await
            } else {
                self.processor
                    .reprocess(
                        &event,
                        &target.reason,
                        target.retry_attempts,
                        &self.execution_context,
                    )
                    .await
            }
        };
        let result = tokio::select! {
            biased;
            _ = lifetime.cancelled() => return Ok(()),
            result = call => result,
        };
        if lifetime.is_cancelled() {
            return Ok(());
        }

        let now = self.deps.clock.now();
        let attempts = target.retry_attempts.saturating_add(1);
        match result {
            ProcessingResult::Success => {
                let next = self
                    .strategy
                    .on_failure_resolved(state, &target, &event, now);
                self.commit(state, next, lifetime).await?;
                self.publish(event.position(), OutcomeKind::Processed);
            }
            ProcessingResult::Retry {
                reason,
                retry_timeout,
            } => {
                let failure = self.retry_failure(reason, attempts, retry_timeout);
                let next = self
                    .strategy
                    .on_failure_repeated(state, &target, &event, failure.clone());
                self.commit(state, next, lifetime).await?;
                self.publish_failure(event.position(), &failure);
            }
            ProcessingResult::Fail { reason } => {
                let failure = self.terminal_failure(reason, attempts);
                let next = self
                    .strategy
                    .on_failure_repeated(state, &target, &event, failure.clone());
                self.commit(state, next, lifetime).await?;
                self.publish_failure(event.position(), &failure);
            }
            ProcessingResult::Disconnected { reason } => {
                self.on_disconnected(event.position(), reason, lifetime).await;
            }
        }
        Ok(())
    }

    async fn apply_pending_reposition(
        &self,
        state: &mut ProcessorState,
        lifetime: &CancellationToken,
    ) -> StreamsResult<()> {
        let Some(request) = self.take_pending_reposition() else {
            return Ok(());
        };
        self.set_status(ProcessorStatus::Repositioning);

        let current = state.position();
        let PendingReposition {
            target,
            action,
            reply,
        } = request;

        if target > current {
            self.finish_reposition(
                reply,
                Err(StreamsError::CannotRepositionForward {
                    requested: target,
                    current,
                }),
            );
            return Ok(());
        }

        let outcome = tokio::select! {
            biased;
            _ = lifetime.cancelled() => {
                self.finish_reposition(reply, Err(StreamsError::Cancelled));
                return Err(StreamsError::Cancelled);
            }
            outcome = action(self.tenant) => outcome,
        };
        if let Err(err) = outcome {
            warn!(processor = %self.id, tenant = %self.tenant, error = %err, "reposition action failed");
            self.finish_reposition(
                reply,
                Err(StreamsError::RepositionAction {
                    reason: format!("{err:#}"),
                }),
            );
            return Ok(());
        }

        if let Err(err) = self
            .commit(state, ProcessorState::at(target), lifetime)
            .await
        {
            self.finish_reposition(reply, Err(StreamsError::Cancelled));
            return Err(err);
        }
        info!(
            processor = %self.id,
            tenant = %self.tenant,
            from = %current,
            to = %target,
            "stream processor repositioned"
        );
        self.publish(target, OutcomeKind::Repositioned { from: current });
        self.finish_reposition(reply, Ok(target));
        Ok(())
    }

    fn take_pending_reposition(&self) -> Option<PendingReposition> {
        let mut slot = self.reposition.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, RepositionSlot::InProgress) {
            RepositionSlot::Pending(request) => Some(request),
            other => {
                *slot = other;
                None
            }
        }
    }

    fn finish_reposition(
        &self,
        reply: oneshot::Sender<StreamsResult<ProcessingPosition>>,
        result: StreamsResult<ProcessingPosition>,
    ) {
        {
            let mut slot = self.reposition.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*slot, RepositionSlot::InProgress) {
                *slot = RepositionSlot::Idle;
            }
        }
        let _ = reply.send(result);
    }

    fn has_pending_reposition(&self) -> bool {
        matches!(
            *self.reposition.lock().unwrap_or_else(PoisonError::into_inner),
            RepositionSlot::Pending(_)
        )
    }

    /// 循环退出后拒绝新的重定位请求，并以 `Cancelled` 完成挂起的请求
    /// 关闭重定位入口，排队中的请求以 `Cancelled` 结束
    pub(crate) fn close_reposition(&self) {
        let previous = {
            let mut slot = self.reposition.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, RepositionSlot::Closed)
        };
        if let RepositionSlot::Pending(request) = previous {
            let _ = request.reply.send(Err(StreamsError::Cancelled));
        }
    }

    /// 持久化新状态（基础设施错误无限重试）后才更新内存状态
    async fn commit(
        &self,
        state: &mut ProcessorState,
        next: ProcessorState,
        lifetime: &CancellationToken,
    ) -> StreamsResult<()> {
        loop {
            match self.deps.states.persist(&self.id, &self.tenant, &next).await {
                Ok(()) => break,
                Err(err) if err.is_infrastructure() => {
                    warn!(processor = %self.id, tenant = %self.tenant, error = %err, "persisting state failed");
                    tokio::select! {
                        biased;
                        _ = lifetime.cancelled() => return Err(StreamsError::Cancelled),
                        _ = tokio::time::sleep(self.deps.config.infrastructure_retry_delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        *state = next;
        Ok(())
    }

    async fn on_disconnected(
        &self,
        position: ProcessingPosition,
        reason: String,
        lifetime: &CancellationToken,
    ) {
        warn!(
            processor = %self.id,
            tenant = %self.tenant,
            position = %position,
            reason = %reason,
            "processor disconnected"
        );
        self.publish(position, OutcomeKind::Disconnected { reason });
        self.pause(self.deps.config.infrastructure_retry_delay, lifetime)
            .await;
    }

    fn retry_failure(
        &self,
        reason: String,
        retry_attempts: u32,
        retry_timeout: Option<Duration>,
    ) -> RecordedFailure {
        let now = self.deps.clock.now();
        let delay =
            retry_timeout.unwrap_or_else(|| self.deps.config.retry_backoff(retry_attempts));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RecordedFailure {
            reason,
            retry_attempts,
            retry_after: Some(now.checked_add_signed(delay).unwrap_or(now)),
            failed_at: now,
        }
    }

    fn terminal_failure(&self, reason: String, retry_attempts: u32) -> RecordedFailure {
        RecordedFailure {
            reason,
            retry_attempts,
            retry_after: None,
            failed_at: self.deps.clock.now(),
        }
    }

    /// min(下一次计划重试, max_wait)
    fn wait_budget(&self, state: &ProcessorState) -> Duration {
        let max_wait = self.deps.config.max_wait;
        match state.next_retry_at() {
            Some(at) => duration_until(self.deps.clock.now(), at).min(max_wait),
            None => max_wait,
        }
    }

    async fn pause(&self, duration: Duration, lifetime: &CancellationToken) -> Wake {
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => Wake::Cancelled,
            _ = self.restart.notified() => Wake::Restart,
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
        }
    }

    async fn wait_for_events(
        &self,
        state: &ProcessorState,
        timeout: Duration,
        lifetime: &CancellationToken,
    ) -> Wake {
        let source = self.id.source();
        let after = state.position().stream_position();
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => Wake::Cancelled,
            _ = self.restart.notified() => Wake::Restart,
            _ = self.deps.waiter.wait_for_event(&self.tenant, &source, after, timeout) => Wake::Elapsed,
        }
    }

    fn set_status(&self, status: ProcessorStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn publish(&self, position: ProcessingPosition, kind: OutcomeKind) {
        self.deps.publish(ProcessingOutcome {
            processor: self.id,
            tenant: self.tenant,
            position,
            kind,
        });
    }

    fn publish_failure(&self, position: ProcessingPosition, failure: &RecordedFailure) {
        warn!(
            processor = %self.id,
            tenant = %self.tenant,
            position = %position,
            retry_attempts = failure.retry_attempts,
            reason = %failure.reason,
            "processing failed"
        );
        let kind = match failure.retry_after {
            Some(retry_after) => OutcomeKind::Retrying {
                reason: failure.reason.clone(),
                retry_attempts: failure.retry_attempts,
                retry_after,
            },
            None => OutcomeKind::Failed {
                reason: failure.reason.clone(),
                retry_attempts: failure.retry_attempts,
            },
        };
        self.publish(position, kind);
    }
}
