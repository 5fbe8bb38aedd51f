//! 事件模型
//!
//! - `CommittedEvent`：事件日志中已提交的事件（只读消费，不归本系统所有）；
//! - `StreamEvent`：事件在某条流中的投影，附带流内位点与分区。
//!
use crate::ids::{EventSourceId, EventTypeId, PartitionId};
use crate::position::ProcessingPosition;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct CommittedEvent {
    /// 事件日志位点
    log_position: u64,
    /// 事件源（聚合 ID 等）
    #[builder(into)]
    event_source: EventSourceId,
    event_type: EventTypeId,
    /// 事件负载
    #[builder(default)]
    payload: Value,
    #[builder(default = Utc::now())]
    occurred: DateTime<Utc>,
}

impl CommittedEvent {
    pub fn log_position(&self) -> u64 {
        self.log_position
    }

    pub fn event_source(&self) -> &EventSourceId {
        &self.event_source
    }

    pub fn event_type(&self) -> EventTypeId {
        self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn occurred(&self) -> DateTime<Utc> {
        self.occurred
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    event: CommittedEvent,
    stream_position: u64,
    partition: PartitionId,
    partitioned: bool,
}

impl StreamEvent {
    pub fn new(
        event: CommittedEvent,
        stream_position: u64,
        partition: PartitionId,
        partitioned: bool,
    ) -> Self {
        Self {
            event,
            stream_position,
            partition,
            partitioned,
        }
    }

    /// 事件日志中的事件：流内位点即日志位点，不分区
    pub fn from_event_log(event: CommittedEvent) -> Self {
        let position = event.log_position();
        Self::new(event, position, PartitionId::unspecified(), false)
    }

    pub fn event(&self) -> &CommittedEvent {
        &self.event
    }

    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn partitioned(&self) -> bool {
        self.partitioned
    }

    /// 事件所在的处理位点
    pub fn position(&self) -> ProcessingPosition {
        ProcessingPosition::new(self.stream_position, self.event.log_position())
    }

    /// 处理完该事件后的下一个位点
    pub fn next_position(&self) -> ProcessingPosition {
        self.position().next()
    }
}
