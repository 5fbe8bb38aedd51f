//! 处理结果通知（ProcessingOutcome）
//!
//! 每处理一个事件发布一条离散的结果，供日志/指标订阅方通过 broadcast 通道消费。
//!
use crate::ids::{ProcessorId, TenantId};
use crate::position::ProcessingPosition;
use chrono::{DateTime, Utc};

/// 默认的结果通道容量；慢订阅者会收到 `Lagged` 而不会阻塞引擎
pub const DEFAULT_OUTCOME_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOutcome {
    pub processor: ProcessorId,
    pub tenant: TenantId,
    pub position: ProcessingPosition,
    pub kind: OutcomeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Processed,
    /// 所在分区失败，事件被跳过，待该分区恢复后补处理
    Skipped,
    Retrying {
        reason: String,
        retry_attempts: u32,
        retry_after: DateTime<Utc>,
    },
    Failed {
        reason: String,
        retry_attempts: u32,
    },
    Disconnected {
        reason: String,
    },
    Repositioned {
        from: ProcessingPosition,
    },
}
