//! 流处理器状态（ProcessorState）
//!
//! 每个 (ProcessorId, 租户) 持久化一份：
//! - `position`：下一个要读取的位点；
//! - `is_failing` 及其失败信息：仅在非分区处理器失败时填充；
//! - `failing_partitions`：仅分区处理器使用，每个失败分区独立重试。
//!
//! 不变式：`is_failing == false` 时 `retry_attempts == 0`、`failure_reason` 为空、
//! `retry_after` 为 `None`。`retry_after == None` 且处于失败状态表示永不自动重试。
//!
use crate::ids::PartitionId;
use crate::position::ProcessingPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorState {
    position: ProcessingPosition,
    is_failing: bool,
    failure_reason: String,
    retry_attempts: u32,
    retry_after: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    failing_partitions: BTreeMap<PartitionId, FailingPartition>,
}

/// 分区处理器中单个失败分区的状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingPartition {
    pub position: ProcessingPosition,
    pub reason: String,
    pub retry_attempts: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_failed_at: DateTime<Utc>,
}

impl ProcessorState {
    /// 从未注册过的处理器：从流的起点开始
    pub fn initial() -> Self {
        Self::default()
    }

    /// 位于给定位点、无失败记录的状态（重定位后使用）
    pub fn at(position: ProcessingPosition) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn position(&self) -> ProcessingPosition {
        self.position
    }

    pub fn is_failing(&self) -> bool {
        self.is_failing
    }

    pub fn failure_reason(&self) -> &str {
        &self.failure_reason
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.retry_after
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn failing_partitions(&self) -> &BTreeMap<PartitionId, FailingPartition> {
        &self.failing_partitions
    }

    pub fn is_partition_failing(&self, partition: &PartitionId) -> bool {
        self.failing_partitions.contains_key(partition)
    }

    /// 成功处理后推进到 `next`，清除非分区失败信息
    pub fn succeeded_at(&self, next: ProcessingPosition, now: DateTime<Utc>) -> Self {
        Self {
            position: next,
            is_failing: false,
            failure_reason: String::new(),
            retry_attempts: 0,
            retry_after: None,
            last_success_at: Some(now),
            failing_partitions: self.failing_partitions.clone(),
        }
    }

    /// 跳过一个事件（分区失败时），不更新 `last_success_at`
    pub fn skipped_to(&self, next: ProcessingPosition) -> Self {
        Self {
            position: next,
            ..self.clone()
        }
    }

    /// 标记非分区处理器失败，位点保持在失败事件上
    pub fn failed(
        &self,
        reason: impl Into<String>,
        retry_attempts: u32,
        retry_after: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            is_failing: true,
            failure_reason: reason.into(),
            retry_attempts,
            retry_after,
            ..self.clone()
        }
    }

    pub fn with_failing_partition(&self, partition: PartitionId, failing: FailingPartition) -> Self {
        let mut next = self.clone();
        next.failing_partitions.insert(partition, failing);
        next
    }

    pub fn without_failing_partition(&self, partition: &PartitionId) -> Self {
        let mut next = self.clone();
        next.failing_partitions.remove(partition);
        next
    }

    /// 最早的计划重试时间（非分区失败或任一失败分区）
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let unpartitioned = self.retry_after.filter(|_| self.is_failing);
        let partitions = self
            .failing_partitions
            .values()
            .filter_map(|p| p.retry_after)
            .min();
        match (unpartitioned, partitions) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
