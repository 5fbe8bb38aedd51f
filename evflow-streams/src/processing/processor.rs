//! 处理器协议（Processor）
//!
//! 引擎把事件交给处理器，并根据返回的 `ProcessingResult` 决定推进、重试还是停住。
//! 处理器自身从不重试，重试调度完全由引擎负责。
//!
use crate::event::StreamEvent;
use crate::execution_context::ExecutionContext;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    Success,
    /// 远端要求稍后重试；`retry_timeout` 缺省时由引擎按退避策略排期
    Retry {
        reason: String,
        retry_timeout: Option<Duration>,
    },
    /// 远端拒绝重试，处理器停在该事件上直到运维重定位
    Fail { reason: String },
    /// 连接层失败：不是远端的处理结论，不记录失败状态
    Disconnected { reason: String },
}

impl ProcessingResult {
    pub fn retry(reason: impl Into<String>, retry_timeout: Option<Duration>) -> Self {
        Self::Retry {
            reason: reason.into(),
            retry_timeout,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    /// 处理器类别（用于日志）
    fn kind(&self) -> &'static str;

    async fn process(
        &self,
        event: &StreamEvent,
        execution_context: &ExecutionContext,
    ) -> ProcessingResult;

    /// 重新处理先前失败的事件；`retry_attempts` 为此前已失败的次数
    async fn reprocess(
        &self,
        event: &StreamEvent,
        failure_reason: &str,
        retry_attempts: u32,
        execution_context: &ExecutionContext,
    ) -> ProcessingResult {
        let _ = (failure_reason, retry_attempts);
        self.process(event, execution_context).await
    }
}
