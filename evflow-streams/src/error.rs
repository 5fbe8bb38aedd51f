//! 流处理统一错误定义
//!
//! 覆盖注册表、重定位协议、基础设施（拉取/持久化/写入）与过滤器校验，
//! 便于上层（handlers）通过 `#[from]` 统一转换。
//!
use crate::ids::{ProcessorId, TenantId};
use crate::position::ProcessingPosition;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StreamsError {
    // --- 注册表 ---
    #[error("stream processor already registered: {processor}")]
    AlreadyRegistered { processor: ProcessorId },
    #[error("stream processor not registered: {processor}")]
    NotRegistered { processor: ProcessorId },
    #[error("stream processor already started: {processor}")]
    AlreadyStarted { processor: ProcessorId },
    #[error("stream processor {processor} is not running for tenant {tenant}")]
    TenantNotRunning {
        processor: ProcessorId,
        tenant: TenantId,
    },

    // --- 重定位 ---
    #[error("stream processor {processor} for tenant {tenant} is already repositioning")]
    AlreadyRepositioning {
        processor: ProcessorId,
        tenant: TenantId,
    },
    #[error("cannot reposition forward: requested={requested}, current={current}")]
    CannotRepositionForward {
        requested: ProcessingPosition,
        current: ProcessingPosition,
    },
    #[error("reposition precondition failed: {reason}")]
    RepositionAction { reason: String },

    // --- 基础设施 ---
    #[error("fetch error: {reason}")]
    Fetch { reason: String },
    #[error("persistence error: {reason}")]
    Persistence { reason: String },
    #[error("stream write error: {reason}")]
    Write { reason: String },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 过滤器 ---
    #[error("filter validation failed: {reason}")]
    FilterValidation { reason: String },

    // --- 运行期 ---
    #[error("stream processor failed for tenant {tenant}: {reason}")]
    ProcessorFailed { tenant: TenantId, reason: String },
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl StreamsError {
    pub fn fetch(reason: impl Into<String>) -> Self {
        Self::Fetch {
            reason: reason.into(),
        }
    }

    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence {
            reason: reason.into(),
        }
    }

    pub fn write(reason: impl Into<String>) -> Self {
        Self::Write {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// 基础设施错误在使用点无限重试，其余错误直接上抛
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. } | Self::Persistence { .. } | Self::Write { .. }
        )
    }
}

/// 统一 Result 类型别名
pub type StreamsResult<T> = Result<T, StreamsError>;
