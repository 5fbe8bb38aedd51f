//! 位点策略（PositionStrategy）
//!
//! 同一个引擎循环服务两种流：
//! - `Unpartitioned`：任一事件失败即停住整条流，直到该事件成功或被重定位；
//! - `Partitioned`：失败只隔离所在分区，其余分区继续前进，失败分区的后续事件被跳过，
//!   在追赶（catch-up）阶段按分区顺序补处理。
//!
//! 策略只做纯状态变换与失败事件查找，不持久化、不发布结果。
//!
use crate::error::StreamsResult as Result;
use crate::event::StreamEvent;
use crate::ids::{PartitionId, StreamKey, TenantId};
use crate::position::ProcessingPosition;
use crate::source::EventFetcher;
use crate::state::{FailingPartition, ProcessorState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 一次失败的记录（由引擎根据处理结果与退避计算得出）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFailure {
    pub reason: String,
    pub retry_attempts: u32,
    /// `None`：不再自动重试
    pub retry_after: Option<DateTime<Utc>>,
    pub failed_at: DateTime<Utc>,
}

/// 到期待补处理的失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureTarget {
    /// 分区策略下的失败分区；非分区为 `None`
    pub partition: Option<PartitionId>,
    pub position: ProcessingPosition,
    pub reason: String,
    pub retry_attempts: u32,
}

/// 事件失败后的状态变换
#[derive(Debug, Clone, PartialEq)]
pub struct FailureStep {
    pub state: ProcessorState,
    /// 是否继续处理当前批次中的后续事件
    pub continue_batch: bool,
}

#[async_trait]
pub trait PositionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 当前状态是否阻止拉取新事件
    fn blocks_progress(&self, state: &ProcessorState) -> bool;

    /// 事件是否应交给处理器；否则跳过
    fn should_dispatch(&self, state: &ProcessorState, event: &StreamEvent) -> bool;

    fn on_skipped(&self, state: &ProcessorState, event: &StreamEvent) -> ProcessorState {
        state.skipped_to(event.next_position())
    }

    fn on_processed(
        &self,
        state: &ProcessorState,
        event: &StreamEvent,
        now: DateTime<Utc>,
    ) -> ProcessorState {
        state.succeeded_at(event.next_position(), now)
    }

    fn on_failed(
        &self,
        state: &ProcessorState,
        event: &StreamEvent,
        failure: RecordedFailure,
    ) -> FailureStep;

    /// `now` 时刻已到期的最早失败
    fn due_failure(&self, state: &ProcessorState, now: DateTime<Utc>) -> Option<FailureTarget>;

    /// 查找需要补处理的事件；`None` 表示该失败对应的事件已不存在
    async fn fetch_failing_event(
        &self,
        fetcher: &dyn EventFetcher,
        tenant: &TenantId,
        stream: &StreamKey,
        state: &ProcessorState,
        target: &FailureTarget,
    ) -> Result<Option<StreamEvent>>;

    fn on_failure_resolved(
        &self,
        state: &ProcessorState,
        target: &FailureTarget,
        event: &StreamEvent,
        now: DateTime<Utc>,
    ) -> ProcessorState;

    fn on_failure_repeated(
        &self,
        state: &ProcessorState,
        target: &FailureTarget,
        event: &StreamEvent,
        failure: RecordedFailure,
    ) -> ProcessorState;

    /// 失败事件已不存在时的状态；`None` 表示保持原状并等待
    fn on_failure_vanished(
        &self,
        state: &ProcessorState,
        target: &FailureTarget,
    ) -> Option<ProcessorState>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Unpartitioned;

#[async_trait]
impl PositionStrategy for Unpartitioned {
    fn name(&self) -> &'static str {
        "unpartitioned"
    }

    fn blocks_progress(&self, state: &ProcessorState) -> bool {
        state.is_failing()
    }

    fn should_dispatch(&self, _state: &ProcessorState, _event: &StreamEvent) -> bool {
        true
    }

    fn on_failed(
        &self,
        state: &ProcessorState,
        _event: &StreamEvent,
        failure: RecordedFailure,
    ) -> FailureStep {
        FailureStep {
            state: state.failed(failure.reason, failure.retry_attempts, failure.retry_after),
            continue_batch: false,
        }
    }

    fn due_failure(&self, state: &ProcessorState, now: DateTime<Utc>) -> Option<FailureTarget> {
        if !state.is_failing() {
            return None;
        }
        let retry_after = state.retry_after()?;
        (retry_after <= now).then(|| FailureTarget {
            partition: None,
            position: state.position(),
            reason: state.failure_reason().to_owned(),
            retry_attempts: state.retry_attempts(),
        })
    }

    async fn fetch_failing_event(
        &self,
        fetcher: &dyn EventFetcher,
        tenant: &TenantId,
        stream: &StreamKey,
        _state: &ProcessorState,
        target: &FailureTarget,
    ) -> Result<Option<StreamEvent>> {
        let events = fetcher.fetch_next(tenant, stream, target.position, 1).await?;
        Ok(events.into_iter().next())
    }

    fn on_failure_resolved(
        &self,
        state: &ProcessorState,
        _target: &FailureTarget,
        event: &StreamEvent,
        now: DateTime<Utc>,
    ) -> ProcessorState {
        state.succeeded_at(event.next_position(), now)
    }

    fn on_failure_repeated(
        &self,
        state: &ProcessorState,
        _target: &FailureTarget,
        _event: &StreamEvent,
        failure: RecordedFailure,
    ) -> ProcessorState {
        state.failed(failure.reason, failure.retry_attempts, failure.retry_after)
    }

    fn on_failure_vanished(
        &self,
        _state: &ProcessorState,
        _target: &FailureTarget,
    ) -> Option<ProcessorState> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Partitioned;

#[async_trait]
impl PositionStrategy for Partitioned {
    fn name(&self) -> &'static str {
        "partitioned"
    }

    fn blocks_progress(&self, _state: &ProcessorState) -> bool {
        false
    }

    fn should_dispatch(&self, state: &ProcessorState, event: &StreamEvent) -> bool {
        !state.is_partition_failing(event.partition())
    }

    fn on_failed(
        &self,
        state: &ProcessorState,
        event: &StreamEvent,
        failure: RecordedFailure,
    ) -> FailureStep {
        let failing = FailingPartition {
            position: event.position(),
            reason: failure.reason,
            retry_attempts: failure.retry_attempts,
            retry_after: failure.retry_after,
            last_failed_at: failure.failed_at,
        };
        FailureStep {
            state: state
                .with_failing_partition(event.partition().clone(), failing)
                .skipped_to(event.next_position()),
            continue_batch: true,
        }
    }

    fn due_failure(&self, state: &ProcessorState, now: DateTime<Utc>) -> Option<FailureTarget> {
        state
            .failing_partitions()
            .iter()
            .filter_map(|(partition, failing)| {
                let retry_after = failing.retry_after?;
                (retry_after <= now).then_some((retry_after, partition, failing))
            })
            .min_by_key(|(retry_after, _, failing)| (*retry_after, failing.position))
            .map(|(_, partition, failing)| FailureTarget {
                partition: Some(partition.clone()),
                position: failing.position,
                reason: failing.reason.clone(),
                retry_attempts: failing.retry_attempts,
            })
    }

    async fn fetch_failing_event(
        &self,
        fetcher: &dyn EventFetcher,
        tenant: &TenantId,
        stream: &StreamKey,
        state: &ProcessorState,
        target: &FailureTarget,
    ) -> Result<Option<StreamEvent>> {
        let Some(partition) = &target.partition else {
            return Ok(None);
        };
        // 只补处理主位点之前被跳过的事件，之后的由正常拉取负责
        let event = fetcher
            .fetch_in_partition(tenant, stream, partition, target.position)
            .await?;
        Ok(event.filter(|e| e.stream_position() < state.position().stream_position()))
    }

    fn on_failure_resolved(
        &self,
        state: &ProcessorState,
        target: &FailureTarget,
        event: &StreamEvent,
        now: DateTime<Utc>,
    ) -> ProcessorState {
        let Some(partition) = &target.partition else {
            return state.clone();
        };
        // 分区内仍可能有被跳过的事件：标记为立即到期、零次失败，由下一轮追赶按 process 处理
        let pending = FailingPartition {
            position: event.next_position(),
            reason: String::new(),
            retry_attempts: 0,
            retry_after: Some(now),
            last_failed_at: now,
        };
        state
            .with_failing_partition(partition.clone(), pending)
            .succeeded_at(state.position(), now)
    }

    fn on_failure_repeated(
        &self,
        state: &ProcessorState,
        target: &FailureTarget,
        event: &StreamEvent,
        failure: RecordedFailure,
    ) -> ProcessorState {
        let Some(partition) = &target.partition else {
            return state.clone();
        };
        state.with_failing_partition(
            partition.clone(),
            FailingPartition {
                position: event.position(),
                reason: failure.reason,
                retry_attempts: failure.retry_attempts,
                retry_after: failure.retry_after,
                last_failed_at: failure.failed_at,
            },
        )
    }

    fn on_failure_vanished(
        &self,
        state: &ProcessorState,
        target: &FailureTarget,
    ) -> Option<ProcessorState> {
        let partition = target.partition.as_ref()?;
        Some(state.without_failing_partition(partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CommittedEvent;
    use crate::ids::{EventTypeId, PartitionId};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn event(position: u64, partition: &str) -> StreamEvent {
        let committed = CommittedEvent::builder()
            .log_position(position)
            .event_source(partition.to_string())
            .event_type(EventTypeId::new(Uuid::nil()))
            .build();
        StreamEvent::new(committed, position, PartitionId::new(partition.into()), true)
    }

    fn failure(attempts: u32, retry_after: Option<DateTime<Utc>>) -> RecordedFailure {
        RecordedFailure {
            reason: "boom".into(),
            retry_attempts: attempts,
            retry_after,
            failed_at: ts(0),
        }
    }

    #[test]
    fn unpartitioned_failure_halts_batch_and_keeps_position() {
        let state = ProcessorState::at(ProcessingPosition::new(3, 3));
        let step = Unpartitioned.on_failed(&state, &event(3, ""), failure(1, Some(ts(5))));

        assert!(!step.continue_batch);
        assert!(step.state.is_failing());
        assert_eq!(step.state.position(), ProcessingPosition::new(3, 3));
        assert!(Unpartitioned.blocks_progress(&step.state));
        assert_eq!(Unpartitioned.due_failure(&step.state, ts(4)), None);

        let due = Unpartitioned
            .due_failure(&step.state, ts(5))
            .expect("failure is due");
        assert_eq!(due.position, ProcessingPosition::new(3, 3));
        assert_eq!(due.retry_attempts, 1);
    }

    #[test]
    fn unpartitioned_terminal_failure_is_never_due() {
        let state = ProcessorState::initial().failed("terminal", 1, None);
        assert_eq!(Unpartitioned.due_failure(&state, ts(i64::from(u32::MAX))), None);
        assert!(Unpartitioned.blocks_progress(&state));
    }

    #[test]
    fn partitioned_failure_isolates_partition_and_advances() {
        let state = ProcessorState::initial();
        let step = Partitioned.on_failed(&state, &event(0, "a"), failure(1, Some(ts(10))));

        assert!(step.continue_batch);
        assert_eq!(step.state.position(), ProcessingPosition::new(1, 1));
        assert!(!Partitioned.blocks_progress(&step.state));
        assert!(!Partitioned.should_dispatch(&step.state, &event(1, "a")));
        assert!(Partitioned.should_dispatch(&step.state, &event(1, "b")));
    }

    #[test]
    fn partitioned_resolution_schedules_remaining_skipped_events_immediately() {
        let state = Partitioned
            .on_failed(&ProcessorState::initial(), &event(0, "a"), failure(2, Some(ts(1))))
            .state
            .skipped_to(ProcessingPosition::new(5, 5));
        let target = Partitioned.due_failure(&state, ts(1)).expect("due");

        let resolved = Partitioned.on_failure_resolved(&state, &target, &event(0, "a"), ts(2));
        let pending = &resolved.failing_partitions()[&PartitionId::new("a".into())];
        assert_eq!(pending.retry_attempts, 0);
        assert_eq!(pending.position, ProcessingPosition::new(1, 1));
        assert_eq!(resolved.position(), ProcessingPosition::new(5, 5));
        assert_eq!(resolved.last_success_at(), Some(ts(2)));

        let next = Partitioned.due_failure(&resolved, ts(2)).expect("due");
        let cleared = Partitioned
            .on_failure_vanished(&resolved, &next)
            .expect("partition cleared");
        assert!(cleared.failing_partitions().is_empty());
    }

    #[test]
    fn partitioned_due_failure_picks_earliest() {
        let state = ProcessorState::initial()
            .with_failing_partition(
                PartitionId::new("late".into()),
                FailingPartition {
                    position: ProcessingPosition::new(0, 0),
                    reason: "x".into(),
                    retry_attempts: 1,
                    retry_after: Some(ts(9)),
                    last_failed_at: ts(0),
                },
            )
            .with_failing_partition(
                PartitionId::new("early".into()),
                FailingPartition {
                    position: ProcessingPosition::new(1, 1),
                    reason: "y".into(),
                    retry_attempts: 1,
                    retry_after: Some(ts(3)),
                    last_failed_at: ts(0),
                },
            );

        let due = Partitioned.due_failure(&state, ts(10)).expect("due");
        assert_eq!(due.partition, Some(PartitionId::new("early".into())));
        assert_eq!(Partitioned.due_failure(&state, ts(2)), None);
    }
}
