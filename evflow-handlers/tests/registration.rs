use evflow_handlers::{
    EventHandlerProtocol, EventHandlerRegistrationArguments, EventHandlerRegistrationResponse,
    EventHandlerResponse, EventHandlers, FailureId, HandleEventRequest, HandlerError,
};
use evflow_reverse_calls::{
    ClientEnd, ClientMessage, ClientToRuntimeMessage, CloseReason, ConnectContext, ResponseContext,
    RuntimeToClientMessage, in_process,
};
use evflow_streams::clock::TokioClock;
use evflow_streams::execution_context::ExecutionContext;
use evflow_streams::ids::{
    EventProcessorId, EventTypeId, MicroserviceId, PartitionId, ScopeId, TenantId,
};
use evflow_streams::inmemory::{
    InMemoryEventStore, InMemoryFilterDefinitions, InMemoryStreamProcessorStates,
};
use evflow_streams::position::ProcessingPosition;
use evflow_streams::tenancy::StaticTenants;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Client = ClientEnd<EventHandlerProtocol>;
type Registration = JoinHandle<Result<CloseReason, HandlerError>>;

/// 客户端看到的请求：(日志位点, 重试次数)
type Seen = Arc<Mutex<Vec<(u64, Option<u32>)>>>;

fn tenant() -> TenantId {
    TenantId::new(Uuid::from_u128(7))
}

fn handler() -> EventProcessorId {
    EventProcessorId::new(Uuid::from_u128(100))
}

fn handled_type() -> EventTypeId {
    EventTypeId::new(Uuid::from_u128(1))
}

fn other_type() -> EventTypeId {
    EventTypeId::new(Uuid::from_u128(2))
}

fn context() -> ExecutionContext {
    ExecutionContext::builder()
        .microservice(MicroserviceId::new(Uuid::from_u128(3)))
        .tenant(tenant())
        .build()
}

fn arguments(partitioned: bool) -> EventHandlerRegistrationArguments {
    EventHandlerRegistrationArguments::builder()
        .event_handler(handler())
        .partitioned(partitioned)
        .event_types(vec![handled_type()])
        .alias("projection")
        .build()
}

struct Runtime {
    store: Arc<InMemoryEventStore>,
    handlers: Arc<EventHandlers>,
    lifetime: CancellationToken,
}

impl Runtime {
    fn new() -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let handlers = EventHandlers::builder()
            .states(Arc::new(InMemoryStreamProcessorStates::new()))
            .fetcher(store.clone())
            .waiter(store.clone())
            .writer(store.clone())
            .filter_definitions(Arc::new(InMemoryFilterDefinitions::new()))
            .tenants(Arc::new(StaticTenants::new([tenant()])))
            .clock(Arc::new(TokioClock::new()))
            .build();
        Self {
            store,
            handlers: Arc::new(handlers),
            lifetime: CancellationToken::new(),
        }
    }

    fn commit(&self, source: &str, event_type: EventTypeId) {
        self.store.commit(
            tenant(),
            ScopeId::default_scope(),
            source.to_string(),
            event_type,
            json!({ "source": source }),
        );
    }

    /// 建立连接并发送连接参数，返回注册任务、客户端端点与连接响应
    async fn connect(
        &self,
        arguments: EventHandlerRegistrationArguments,
    ) -> (Registration, Client, EventHandlerRegistrationResponse) {
        let (runtime, mut client) = in_process::<EventHandlerProtocol>(64);
        let registration = tokio::spawn({
            let handlers = self.handlers.clone();
            let lifetime = self.lifetime.clone();
            async move {
                handlers
                    .register(runtime.inbound, runtime.outbound, &lifetime)
                    .await
            }
        });

        client
            .sender
            .send(ClientToRuntimeMessage::Connect {
                context: ConnectContext {
                    execution_context: context(),
                    ping_interval: Duration::from_secs(1),
                },
                arguments,
            })
            .await
            .unwrap();
        let response = loop {
            match client.receiver.recv().await {
                Some(RuntimeToClientMessage::ConnectResponse(response)) => break response,
                Some(RuntimeToClientMessage::Ping) => continue,
                other => panic!("expected connect response, got {other:?}"),
            }
        };
        (registration, client, response)
    }
}

/// 在后台应答请求与 ping；返回可发送断开消息的发送端与请求记录
fn serve<F>(client: Client, behavior: F) -> (mpsc::Sender<ClientMessage<EventHandlerProtocol>>, Seen)
where
    F: Fn(&HandleEventRequest) -> EventHandlerResponse + Send + 'static,
{
    let ClientEnd {
        sender,
        mut receiver,
    } = client;
    let seen = Seen::default();
    tokio::spawn({
        let sender = sender.clone();
        let seen = seen.clone();
        async move {
            while let Some(message) = receiver.recv().await {
                let reply = match message {
                    RuntimeToClientMessage::Ping => ClientToRuntimeMessage::Pong,
                    RuntimeToClientMessage::Request { context, request } => {
                        seen.lock().unwrap().push((
                            request.event.event().log_position(),
                            request
                                .retry_processing_state
                                .as_ref()
                                .map(|retry| retry.retry_count),
                        ));
                        ClientToRuntimeMessage::Response {
                            context: ResponseContext {
                                call_id: context.call_id,
                            },
                            response: behavior(&request),
                        }
                    }
                    RuntimeToClientMessage::ConnectResponse(_) => continue,
                };
                if sender.send(reply).await.is_err() {
                    break;
                }
            }
        }
    });
    (sender, seen)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(120), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

fn position(runtime: &Runtime) -> Option<ProcessingPosition> {
    runtime
        .handlers
        .states(&handler())
        .ok()
        .and_then(|states| states.get(&tenant()).map(|state| state.position()))
}

#[tokio::test(start_paused = true)]
async fn registered_handler_receives_filtered_events_and_retries() {
    let runtime = Runtime::new();
    runtime.commit("a", handled_type());
    runtime.commit("b", handled_type());
    runtime.commit("c", other_type());
    runtime.commit("a", handled_type());

    let (registration, client, response) = runtime.connect(arguments(false)).await;
    assert_eq!(response, EventHandlerRegistrationResponse::accepted());
    assert!(runtime.handlers.is_registered(&handler()));

    let retried = AtomicBool::new(false);
    let (sender, seen) = serve(client, move |request| {
        if request.event.event().log_position() == 1 && !retried.swap(true, Ordering::SeqCst) {
            EventHandlerResponse::retry("projection busy", Some(Duration::from_secs(1)))
        } else {
            EventHandlerResponse::success()
        }
    });

    // 派生流：日志位点 0、1、3
    eventually(|| position(&runtime) == Some(ProcessingPosition::new(3, 4))).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(0, None), (1, None), (1, Some(1)), (3, None)]
    );

    sender
        .send(ClientToRuntimeMessage::InitiateDisconnect)
        .await
        .unwrap();
    assert_eq!(
        registration.await.unwrap().unwrap(),
        CloseReason::PeerDisconnected
    );
    assert!(runtime.handlers.handlers().is_empty());
    assert!(matches!(
        runtime.handlers.states(&handler()),
        Err(HandlerError::NotRegistered(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn second_connection_for_an_active_handler_is_rejected() {
    let runtime = Runtime::new();
    let (_first, client, response) = runtime.connect(arguments(false)).await;
    assert!(response.failure.is_none());
    let _served = serve(client, |_| EventHandlerResponse::success());

    let (second, _client, response) = runtime.connect(arguments(false)).await;
    let failure = response.failure.expect("rejected");
    assert_eq!(failure.id, FailureId::ALREADY_REGISTERED);
    assert!(matches!(
        second.await.unwrap(),
        Err(HandlerError::Rejected { id, .. }) if id == FailureId::ALREADY_REGISTERED
    ));
    assert_eq!(runtime.handlers.handlers(), vec![handler()]);
}

#[tokio::test(start_paused = true)]
async fn handler_without_event_types_is_rejected() {
    let runtime = Runtime::new();
    let mut invalid = arguments(false);
    invalid.event_types.clear();

    let (registration, _client, response) = runtime.connect(invalid).await;
    assert_eq!(
        response.failure.map(|failure| failure.id),
        Some(FailureId::INVALID_ARGUMENTS)
    );
    assert!(registration.await.unwrap().is_err());
    assert!(!runtime.handlers.is_registered(&handler()));
}

#[tokio::test(start_paused = true)]
async fn changing_partitioning_of_a_known_handler_fails_filter_validation() {
    let runtime = Runtime::new();
    runtime.commit("a", handled_type());

    let (registration, client, _) = runtime.connect(arguments(false)).await;
    let (sender, _seen) = serve(client, |_| EventHandlerResponse::success());
    eventually(|| position(&runtime) == Some(ProcessingPosition::new(1, 1))).await;
    sender
        .send(ClientToRuntimeMessage::InitiateDisconnect)
        .await
        .unwrap();
    registration.await.unwrap().unwrap();

    let (registration, _client, response) = runtime.connect(arguments(true)).await;
    assert_eq!(
        response.failure.map(|failure| failure.id),
        Some(FailureId::FILTER_VALIDATION_FAILED)
    );
    assert!(registration.await.unwrap().is_err());

    // 定义不变时可以重新注册，并从已持久化的位点继续
    let (_registration, client, response) = runtime.connect(arguments(false)).await;
    assert!(response.failure.is_none());
    let (_sender, seen) = serve(client, |_| EventHandlerResponse::success());
    eventually(|| position(&runtime) == Some(ProcessingPosition::new(1, 1))).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_partition_recovers_after_admin_reposition() {
    let runtime = Runtime::new();
    for source in ["a", "b", "a", "b"] {
        runtime.commit(source, handled_type());
    }

    let (_registration, client, _) = runtime.connect(arguments(true)).await;
    let failed = AtomicBool::new(false);
    let (_sender, seen) = serve(client, move |request| {
        if request.event.event().log_position() == 0 && !failed.swap(true, Ordering::SeqCst) {
            EventHandlerResponse::fail("cannot project")
        } else {
            EventHandlerResponse::success()
        }
    });

    let partition_a = PartitionId::new("a".to_string());
    let failing = |runtime: &Runtime| {
        runtime
            .handlers
            .states(&handler())
            .ok()
            .and_then(|states| states.get(&tenant()).cloned())
            .is_some_and(|state| state.is_partition_failing(&partition_a))
    };
    eventually(|| {
        position(&runtime) == Some(ProcessingPosition::new(4, 4)) && failing(&runtime)
    })
    .await;
    assert_eq!(*seen.lock().unwrap(), vec![(0, None), (1, None), (3, None)]);

    let repositioned = runtime
        .handlers
        .reprocess_from(&handler(), &tenant(), 0)
        .await
        .unwrap();
    assert_eq!(repositioned, ProcessingPosition::START);

    eventually(|| seen.lock().unwrap().len() == 7 && !failing(&runtime)).await;
    eventually(|| position(&runtime) == Some(ProcessingPosition::new(4, 4))).await;
    assert_eq!(
        seen.lock().unwrap()[3..],
        [(0, None), (1, None), (2, None), (3, None)]
    );
}

#[tokio::test(start_paused = true)]
async fn admin_operations_require_a_registered_handler() {
    let runtime = Runtime::new();
    assert!(matches!(
        runtime.handlers.reprocess_from(&handler(), &tenant(), 0).await,
        Err(HandlerError::NotRegistered(_))
    ));
    assert!(matches!(
        runtime.handlers.reprocess_all_from_start(&handler()).await,
        Err(HandlerError::NotRegistered(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn lifetime_cancellation_unregisters_the_handler() {
    let runtime = Runtime::new();
    runtime.commit("a", handled_type());
    let (registration, client, _) = runtime.connect(arguments(false)).await;
    let _served = serve(client, |_| EventHandlerResponse::success());
    eventually(|| position(&runtime) == Some(ProcessingPosition::new(1, 1))).await;

    let restarted = runtime
        .handlers
        .reprocess_all_from_start(&handler())
        .await
        .unwrap();
    assert_eq!(
        restarted.get(&tenant()).map(|result| *result.as_ref().unwrap()),
        Some(ProcessingPosition::START)
    );

    runtime.lifetime.cancel();
    assert_eq!(
        registration.await.unwrap().unwrap(),
        CloseReason::CallerCancelled
    );
    assert!(!runtime.handlers.is_registered(&handler()));
}
