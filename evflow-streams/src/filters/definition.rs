use crate::event::CommittedEvent;
use crate::ids::{EventTypeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 类型过滤器定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDefinition {
    event_types: BTreeSet<EventTypeId>,
    partitioned: bool,
}

impl FilterDefinition {
    pub fn new(event_types: impl IntoIterator<Item = EventTypeId>, partitioned: bool) -> Self {
        Self {
            event_types: event_types.into_iter().collect(),
            partitioned,
        }
    }

    pub fn event_types(&self) -> &BTreeSet<EventTypeId> {
        &self.event_types
    }

    pub fn partitioned(&self) -> bool {
        self.partitioned
    }

    /// 命中时返回事件在派生流中的分区：分区流按事件源分区，否则为未指定分区
    pub fn partition_for(&self, event: &CommittedEvent) -> Option<PartitionId> {
        if !self.event_types.contains(&event.event_type()) {
            return None;
        }
        Some(if self.partitioned {
            PartitionId::new(event.event_source().value().clone())
        } else {
            PartitionId::unspecified()
        })
    }
}
