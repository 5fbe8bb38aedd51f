use super::definition::FilterDefinition;
use crate::event::StreamEvent;
use crate::execution_context::ExecutionContext;
use crate::ids::StreamKey;
use crate::processing::{ProcessingResult, Processor};
use crate::source::StreamWriter;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// 把命中定义的事件写入派生流 `target`
pub struct FilterProcessor {
    definition: FilterDefinition,
    target: StreamKey,
    writer: Arc<dyn StreamWriter>,
}

impl FilterProcessor {
    pub fn new(definition: FilterDefinition, target: StreamKey, writer: Arc<dyn StreamWriter>) -> Self {
        Self {
            definition,
            target,
            writer,
        }
    }

    pub fn definition(&self) -> &FilterDefinition {
        &self.definition
    }

    pub fn target(&self) -> &StreamKey {
        &self.target
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    fn kind(&self) -> &'static str {
        "filter"
    }

    async fn process(
        &self,
        event: &StreamEvent,
        execution_context: &ExecutionContext,
    ) -> ProcessingResult {
        let Some(partition) = self.definition.partition_for(event.event()) else {
            return ProcessingResult::Success;
        };
        let tenant = execution_context.tenant();
        match self
            .writer
            .write(
                &tenant,
                &self.target,
                event.event(),
                &partition,
                self.definition.partitioned(),
            )
            .await
        {
            Ok(()) => ProcessingResult::Success,
            Err(err) => {
                warn!(stream = %self.target, tenant = %tenant, error = %err, "writing filtered event failed");
                ProcessingResult::retry(err.to_string(), None)
            }
        }
    }
}
