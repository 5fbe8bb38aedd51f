//! 远程事件处理器
//!
//! 把一条已接受的反向调用连接适配为引擎的 `Processor`：每个事件一次请求/响应，
//! 不做任何内部重试，重试节奏完全交给引擎。
//!
use crate::protocol::{
    EventHandlerProtocol, EventHandlerResponse, HandleEventRequest, ProcessorFailure,
    RetryProcessingState,
};
use async_trait::async_trait;
use evflow_reverse_calls::ReverseCallDispatcher;
use evflow_streams::event::StreamEvent;
use evflow_streams::execution_context::ExecutionContext;
use evflow_streams::ids::EventProcessorId;
use evflow_streams::processing::{ProcessingResult, Processor};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct EventHandlerProcessor {
    handler: EventProcessorId,
    dispatcher: Arc<ReverseCallDispatcher<EventHandlerProtocol>>,
}

impl EventHandlerProcessor {
    pub fn new(
        handler: EventProcessorId,
        dispatcher: Arc<ReverseCallDispatcher<EventHandlerProtocol>>,
    ) -> Self {
        Self {
            handler,
            dispatcher,
        }
    }

    async fn handle(
        &self,
        request: HandleEventRequest,
        execution_context: &ExecutionContext,
    ) -> ProcessingResult {
        let log_position = request.event.event().log_position();
        match self.dispatcher.call(request, execution_context).await {
            Ok(response) => interpret(response),
            Err(err) => {
                warn!(
                    handler = %self.handler,
                    log_position,
                    error = %err,
                    "event handler call failed"
                );
                ProcessingResult::disconnected(err.to_string())
            }
        }
    }
}

fn interpret(response: EventHandlerResponse) -> ProcessingResult {
    match response.failure {
        None => ProcessingResult::Success,
        Some(ProcessorFailure {
            reason,
            retry: true,
            retry_timeout,
        }) => ProcessingResult::retry(reason, retry_timeout),
        Some(ProcessorFailure { reason, .. }) => ProcessingResult::fail(reason),
    }
}

#[async_trait]
impl Processor for EventHandlerProcessor {
    fn kind(&self) -> &'static str {
        "event handler"
    }

    async fn process(
        &self,
        event: &StreamEvent,
        execution_context: &ExecutionContext,
    ) -> ProcessingResult {
        self.handle(
            HandleEventRequest {
                event: event.clone(),
                retry_processing_state: None,
            },
            execution_context,
        )
        .await
    }

    async fn reprocess(
        &self,
        event: &StreamEvent,
        failure_reason: &str,
        retry_attempts: u32,
        execution_context: &ExecutionContext,
    ) -> ProcessingResult {
        debug!(
            handler = %self.handler,
            log_position = event.event().log_position(),
            retry_attempts,
            "reprocessing event"
        );
        self.handle(
            HandleEventRequest {
                event: event.clone(),
                retry_processing_state: Some(RetryProcessingState {
                    failure_reason: failure_reason.to_string(),
                    retry_count: retry_attempts,
                }),
            },
            execution_context,
        )
        .await
    }
}
