//! 事件处理器注册（EventHandlers）
//!
//! 一条客户端连接对应一个事件处理器，注册流程：
//! 1. 读取连接参数并校验；
//! 2. 对每个租户校验过滤器定义；
//! 3. 注册过滤器流处理器（事件日志 → 处理器派生流）与事件处理器流处理器
//!    （派生流 → 远程处理器）；
//! 4. 接受连接并启动两者，直到连接关闭、任一处理器失败或生命周期结束；
//! 5. 无论以何种方式结束，都注销两者。
//!
//! 任一步失败都会以对应的 `FailureId` 拒绝连接，并撤销已经完成的注册。
//!
use crate::config::EventHandlersConfig;
use crate::error::{HandlerError, HandlerResult};
use crate::processor::EventHandlerProcessor;
use crate::protocol::{
    EventHandlerProtocol, EventHandlerRegistrationArguments, EventHandlerRegistrationResponse,
    FailureId,
};
use bon::bon;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use evflow_reverse_calls::{
    ClientMessage, CloseReason, ConnectArguments, MessageWriter, ReverseCallDispatcher,
    ReverseCallResult, RuntimeMessage,
};
use evflow_streams::clock::Clock;
use evflow_streams::error::{StreamsError, StreamsResult};
use evflow_streams::execution_context::ExecutionContext;
use evflow_streams::filters::{FilterDefinition, FilterProcessor, FilterValidator};
use evflow_streams::ids::{EventProcessorId, ProcessorId, StreamId, StreamKey, TenantId};
use evflow_streams::persist::{FilterDefinitions, StreamProcessorStates};
use evflow_streams::position::ProcessingPosition;
use evflow_streams::processing::{
    Partitioned, PositionStrategy, ProcessingOutcome, Processor, StreamProcessor,
    StreamProcessorDependencies, StreamProcessorRegistry, Unpartitioned,
};
use evflow_streams::source::{EventFetcher, EventWaiter, StreamWriter};
use evflow_streams::state::ProcessorState;
use evflow_streams::tenancy::Tenants;
use futures_core::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

/// 一个已注册事件处理器占用的两个流处理器
#[derive(Debug, Clone, Copy)]
struct ActiveHandler {
    filter: ProcessorId,
    handler: ProcessorId,
}

/// 注册被拒绝的原因，回写给客户端
struct Rejection {
    id: FailureId,
    reason: String,
}

impl Rejection {
    fn new(id: FailureId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

pub struct EventHandlers {
    registry: StreamProcessorRegistry,
    deps: StreamProcessorDependencies,
    writer: Arc<dyn StreamWriter>,
    validator: FilterValidator,
    tenants: Arc<dyn Tenants>,
    config: EventHandlersConfig,
    active: DashMap<EventProcessorId, ActiveHandler>,
}

#[bon]
impl EventHandlers {
    #[builder]
    pub fn new(
        states: Arc<dyn StreamProcessorStates>,
        fetcher: Arc<dyn EventFetcher>,
        waiter: Arc<dyn EventWaiter>,
        writer: Arc<dyn StreamWriter>,
        filter_definitions: Arc<dyn FilterDefinitions>,
        tenants: Arc<dyn Tenants>,
        clock: Option<Arc<dyn Clock>>,
        #[builder(default)] config: EventHandlersConfig,
    ) -> Self {
        let deps = StreamProcessorDependencies::builder()
            .states(states)
            .fetcher(fetcher.clone())
            .waiter(waiter)
            .maybe_clock(clock)
            .config(config.stream_processor)
            .build();
        Self {
            registry: StreamProcessorRegistry::new(),
            deps,
            writer,
            validator: FilterValidator::new(fetcher, filter_definitions),
            tenants,
            config,
            active: DashMap::new(),
        }
    }
}

impl EventHandlers {
    /// 服务一条客户端连接，直到连接关闭或 `lifetime` 取消
    ///
    /// 返回连接关闭的原因；注册被拒绝时返回 `HandlerError::Rejected`，
    /// 处理器失败时返回对应的流处理错误。
    #[instrument(skip_all, fields(handler = tracing::field::Empty))]
    pub async fn register(
        &self,
        inbound: BoxStream<'static, ReverseCallResult<ClientMessage<EventHandlerProtocol>>>,
        outbound: Box<dyn MessageWriter<RuntimeMessage<EventHandlerProtocol>>>,
        lifetime: &CancellationToken,
    ) -> HandlerResult<CloseReason> {
        let dispatcher = Arc::new(ReverseCallDispatcher::new(
            inbound,
            outbound,
            self.config.reverse_call,
            lifetime,
        ));
        let ConnectArguments {
            execution_context,
            arguments,
            ..
        }: ConnectArguments<EventHandlerRegistrationArguments> = dispatcher.receive_arguments().await?;
        Span::current().record("handler", tracing::field::display(arguments.event_handler));

        let active = match self
            .register_processors(&arguments, &execution_context, &dispatcher)
            .await
        {
            Ok(active) => active,
            Err(Rejection { id, reason }) => {
                warn!(reason = %reason, "event handler registration rejected");
                let response = EventHandlerRegistrationResponse::rejected(id, reason.clone());
                if let Err(err) = dispatcher.reject(response).await {
                    debug!(error = %err, "failed to deliver registration rejection");
                }
                return Err(HandlerError::Rejected { id, reason });
            }
        };

        let connection = lifetime.child_token();
        let outcome = self.run(&dispatcher, active, &connection).await;

        connection.cancel();
        dispatcher.cancel();
        self.release(&arguments.event_handler, active).await;
        match &outcome {
            Ok(reason) => info!(reason = %reason, "event handler disconnected"),
            Err(err) => warn!(error = %err, "event handler stopped"),
        }
        outcome
    }

    /// 接受连接并启动两个流处理器，等待其中任一方结束
    async fn run(
        &self,
        dispatcher: &ReverseCallDispatcher<EventHandlerProtocol>,
        active: ActiveHandler,
        connection: &CancellationToken,
    ) -> HandlerResult<CloseReason> {
        let (Some(filter), Some(handler)) = (
            self.registry.get(&active.filter),
            self.registry.get(&active.handler),
        ) else {
            dispatcher.cancel();
            return Err(StreamsError::NotRegistered {
                processor: active.handler,
            }
            .into());
        };

        dispatcher
            .accept(EventHandlerRegistrationResponse::accepted())
            .await?;
        filter.start(connection)?;
        handler.start(connection)?;
        info!("event handler registered");

        tokio::select! {
            reason = dispatcher.closed() => Ok(reason),
            completed = filter.completed() => {
                completed?;
                dispatcher.cancel();
                Ok(dispatcher.closed().await)
            }
            completed = handler.completed() => {
                completed?;
                dispatcher.cancel();
                Ok(dispatcher.closed().await)
            }
        }
    }

    async fn register_processors(
        &self,
        arguments: &EventHandlerRegistrationArguments,
        execution_context: &ExecutionContext,
        dispatcher: &Arc<ReverseCallDispatcher<EventHandlerProtocol>>,
    ) -> Result<ActiveHandler, Rejection> {
        validate_arguments(arguments)?;

        let handler_id = arguments.event_handler;
        let scope = arguments.scope;
        let active = ActiveHandler {
            filter: ProcessorId::new(scope, handler_id, StreamId::event_log()),
            handler: ProcessorId::new(scope, handler_id, handler_id.into()),
        };
        match self.active.entry(handler_id) {
            Entry::Occupied(_) => {
                return Err(Rejection::new(
                    FailureId::ALREADY_REGISTERED,
                    format!("event handler {handler_id} is already registered"),
                ));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(active);
            }
        }

        let registered = self
            .try_register_processors(arguments, execution_context, dispatcher, active)
            .await;
        if registered.is_err() {
            self.release(&handler_id, active).await;
        }
        registered.map(|()| active)
    }

    async fn try_register_processors(
        &self,
        arguments: &EventHandlerRegistrationArguments,
        execution_context: &ExecutionContext,
        dispatcher: &Arc<ReverseCallDispatcher<EventHandlerProtocol>>,
        active: ActiveHandler,
    ) -> Result<(), Rejection> {
        let tenants = self.tenants.all();
        let target = StreamKey::new(arguments.scope, arguments.event_handler.into());
        let definition =
            FilterDefinition::new(arguments.event_types.iter().copied(), arguments.partitioned);

        self.validate_filter(active.filter, &tenants, &target, &definition)
            .await
            .map_err(|err| Rejection::new(FailureId::FILTER_VALIDATION_FAILED, err.to_string()))?;

        let filter: Arc<dyn Processor> =
            Arc::new(FilterProcessor::new(definition, target, self.writer.clone()));
        self.register_processor(
            active.filter,
            &tenants,
            Arc::new(Unpartitioned),
            filter,
            execution_context,
        )
        .await?;

        let handler: Arc<dyn Processor> = Arc::new(EventHandlerProcessor::new(
            arguments.event_handler,
            dispatcher.clone(),
        ));
        let strategy: Arc<dyn PositionStrategy> = if arguments.partitioned {
            Arc::new(Partitioned)
        } else {
            Arc::new(Unpartitioned)
        };
        self.register_processor(
            active.handler,
            &tenants,
            strategy,
            handler,
            execution_context,
        )
        .await
    }

    async fn register_processor(
        &self,
        id: ProcessorId,
        tenants: &[TenantId],
        strategy: Arc<dyn PositionStrategy>,
        processor: Arc<dyn Processor>,
        execution_context: &ExecutionContext,
    ) -> Result<(), Rejection> {
        self.registry
            .try_register(id, || {
                StreamProcessor::create(
                    id,
                    tenants.to_vec(),
                    strategy,
                    move |_: &TenantId| processor.clone(),
                    execution_context,
                    self.deps.clone(),
                )
            })
            .await
            .map(|_| ())
            .map_err(|err| match err {
                StreamsError::AlreadyRegistered { .. } => {
                    Rejection::new(FailureId::ALREADY_REGISTERED, err.to_string())
                }
                other => Rejection::new(FailureId::REGISTRATION_FAILED, other.to_string()),
            })
    }

    /// 以过滤器在各租户上已处理到的位点校验定义
    async fn validate_filter(
        &self,
        filter: ProcessorId,
        tenants: &[TenantId],
        target: &StreamKey,
        definition: &FilterDefinition,
    ) -> StreamsResult<()> {
        for tenant in tenants {
            let filtered_up_to = self
                .deps
                .states()
                .try_get(&filter, tenant)
                .await?
                .map_or(ProcessingPosition::START, |state| state.position());
            self.validator
                .validate(tenant, target, definition, filtered_up_to)
                .await?;
        }
        Ok(())
    }

    async fn release(&self, handler: &EventProcessorId, active: ActiveHandler) {
        for id in [active.handler, active.filter] {
            if let Some(processor) = self.registry.unregister(&id).await {
                processor.stop();
                if let Err(err) = processor.completed().await {
                    debug!(processor = %id, error = %err, "stream processor ended with failure");
                }
            }
        }
        self.active.remove(handler);
    }

    /// 把事件处理器在 `tenant` 上重定位到派生流中的 `stream_position`
    ///
    /// 对应的事件日志位点从派生流中解析；该位置尚无事件时沿用当前日志位点。
    #[instrument(skip(self))]
    pub async fn reprocess_from(
        &self,
        handler: &EventProcessorId,
        tenant: &TenantId,
        stream_position: u64,
    ) -> HandlerResult<ProcessingPosition> {
        let processor = self.handler_processor(handler)?;
        let current = processor
            .current_state(tenant)
            .ok_or(StreamsError::TenantNotRunning {
                processor: *processor.id(),
                tenant: *tenant,
            })?;
        let requested = ProcessingPosition::new(stream_position, current.position().log_position());
        let target = self
            .deps
            .fetcher()
            .fetch_next(tenant, &processor.id().source(), requested, 1)
            .await?
            .into_iter()
            .next()
            .filter(|event| event.stream_position() == stream_position)
            .map_or(requested, |event| event.position());

        let position = processor.reprocess_from(tenant, target).await?;
        info!(position = %position, "event handler repositioned");
        Ok(position)
    }

    /// 所有租户回到起点；按租户返回各自的结果
    #[instrument(skip(self))]
    pub async fn reprocess_all_from_start(
        &self,
        handler: &EventProcessorId,
    ) -> HandlerResult<BTreeMap<TenantId, StreamsResult<ProcessingPosition>>> {
        let processor = self.handler_processor(handler)?;
        Ok(processor.reprocess_all_from_start().await)
    }

    pub fn states(
        &self,
        handler: &EventProcessorId,
    ) -> HandlerResult<BTreeMap<TenantId, ProcessorState>> {
        Ok(self.handler_processor(handler)?.states())
    }

    pub fn handlers(&self) -> Vec<EventProcessorId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_registered(&self, handler: &EventProcessorId) -> bool {
        self.active.contains_key(handler)
    }

    /// 所有处理器的处理结局
    pub fn outcomes(&self) -> BoxStream<'static, ProcessingOutcome> {
        self.deps.outcome_stream()
    }

    fn handler_processor(&self, handler: &EventProcessorId) -> HandlerResult<Arc<StreamProcessor>> {
        let id = self
            .active
            .get(handler)
            .map(|active| active.handler)
            .ok_or(HandlerError::NotRegistered(*handler))?;
        self.registry
            .get(&id)
            .ok_or(HandlerError::NotRegistered(*handler))
    }
}

fn validate_arguments(arguments: &EventHandlerRegistrationArguments) -> Result<(), Rejection> {
    if arguments.event_types.is_empty() {
        return Err(Rejection::new(
            FailureId::INVALID_ARGUMENTS,
            "an event handler must handle at least one event type",
        ));
    }
    if arguments.concurrency == 0 {
        return Err(Rejection::new(
            FailureId::INVALID_ARGUMENTS,
            "concurrency must be at least 1",
        ));
    }
    Ok(())
}
