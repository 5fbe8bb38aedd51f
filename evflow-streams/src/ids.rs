//! 标识符
//!
//! 租户、作用域、流、处理器、事件类型等均为 UUID 包装类型；
//! 分区与事件源为字符串包装类型。
//!
use evflow_macros::identifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[identifier]
#[derive(Copy)]
pub struct TenantId(Uuid);

#[identifier]
#[derive(Copy)]
pub struct MicroserviceId(Uuid);

/// 作用域：事件日志与派生流所在的命名空间
#[identifier]
#[derive(Copy)]
pub struct ScopeId(Uuid);

impl ScopeId {
    pub const fn default_scope() -> Self {
        Self::new(Uuid::nil())
    }
}

#[identifier]
#[derive(Copy)]
pub struct StreamId(Uuid);

impl StreamId {
    /// 事件日志本身也是一条流，约定使用 nil UUID
    pub const fn event_log() -> Self {
        Self::new(Uuid::nil())
    }

    pub fn is_event_log(&self) -> bool {
        self.value().is_nil()
    }
}

/// 事件处理器（event handler / filter）的标识
#[identifier]
#[derive(Copy)]
pub struct EventProcessorId(Uuid);

impl From<EventProcessorId> for StreamId {
    /// 事件处理器的派生流与处理器同名
    fn from(value: EventProcessorId) -> Self {
        StreamId::new(*value.value())
    }
}

#[identifier]
#[derive(Copy)]
pub struct EventTypeId(Uuid);

#[identifier]
pub struct EventSourceId(String);

#[identifier]
pub struct PartitionId(String);

impl PartitionId {
    /// 非分区流中所有事件的分区
    pub fn unspecified() -> Self {
        Self::new(String::new())
    }
}

/// 流的定位键：(scope, stream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub scope: ScopeId,
    pub stream: StreamId,
}

impl StreamKey {
    pub fn new(scope: ScopeId, stream: StreamId) -> Self {
        Self { scope, stream }
    }

    pub fn event_log(scope: ScopeId) -> Self {
        Self::new(scope, StreamId::event_log())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.stream)
    }
}

/// 已注册流处理器的全局唯一键：(scope, event_processor, source_stream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId {
    pub scope: ScopeId,
    pub event_processor: EventProcessorId,
    pub source_stream: StreamId,
}

impl ProcessorId {
    pub fn new(scope: ScopeId, event_processor: EventProcessorId, source_stream: StreamId) -> Self {
        Self {
            scope,
            event_processor,
            source_stream,
        }
    }

    /// 该处理器读取的源流
    pub fn source(&self) -> StreamKey {
        StreamKey::new(self.scope, self.source_stream)
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}<-{}",
            self.scope, self.event_processor, self.source_stream
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_processor_stream_shares_the_processor_uuid() {
        let raw = Uuid::new_v4();
        let stream: StreamId = EventProcessorId::new(raw).into();
        assert_eq!(*stream.value(), raw);
        assert!(!stream.is_event_log());
        assert!(StreamId::event_log().is_event_log());
    }

    #[test]
    fn processor_id_display_names_scope_processor_and_source() {
        let id = ProcessorId::new(
            ScopeId::default_scope(),
            EventProcessorId::new(Uuid::from_u128(1)),
            StreamId::event_log(),
        );
        assert_eq!(
            id.to_string(),
            format!(
                "{}/{}<-{}",
                Uuid::nil(),
                Uuid::from_u128(1),
                Uuid::nil()
            )
        );
        assert_eq!(id.source(), StreamKey::event_log(ScopeId::default_scope()));
    }
}
