use evflow_handlers::{
    EventHandlerProtocol, EventHandlerRegistrationArguments, EventHandlerResponse, EventHandlers,
    HandleEventRequest,
};
use evflow_reverse_calls::{
    ClientEnd, ClientToRuntimeMessage, ConnectContext, ResponseContext, RuntimeToClientMessage,
    in_process,
};
use evflow_streams::execution_context::ExecutionContext;
use evflow_streams::ids::{EventProcessorId, EventTypeId, MicroserviceId, ScopeId, TenantId};
use evflow_streams::inmemory::{
    InMemoryEventStore, InMemoryFilterDefinitions, InMemoryStreamProcessorStates,
};
use evflow_streams::position::ProcessingPosition;
use evflow_streams::processing::OutcomeKind;
use evflow_streams::tenancy::StaticTenants;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const ACCOUNT_OPENED: EventTypeId = EventTypeId::new(Uuid::from_u128(1));
const ACCOUNT_DEPOSITED: EventTypeId = EventTypeId::new(Uuid::from_u128(2));
const ACCOUNT_AUDITED: EventTypeId = EventTypeId::new(Uuid::from_u128(3));

const TENANT_A: TenantId = TenantId::new(Uuid::from_u128(0xa));
const TENANT_B: TenantId = TenantId::new(Uuid::from_u128(0xb));

const BALANCES: EventProcessorId = EventProcessorId::new(Uuid::from_u128(0xba1a));

fn context(tenant: TenantId) -> ExecutionContext {
    ExecutionContext::builder()
        .microservice(MicroserviceId::new(Uuid::from_u128(0xd3)))
        .tenant(tenant)
        .build()
}

/// 客户端：第一次见到每个开户事件时要求重试，其余事件直接成功
async fn run_client(client: ClientEnd<EventHandlerProtocol>) {
    let ClientEnd {
        sender,
        mut receiver,
    } = client;
    let retried = Mutex::new(HashSet::new());
    let handle = |request: &HandleEventRequest| {
        let event = request.event.event();
        let first_time = retried
            .lock()
            .map(|mut seen| seen.insert((event.event_source().clone(), event.log_position())))
            .unwrap_or(false);
        if event.event_type() == ACCOUNT_OPENED && first_time {
            EventHandlerResponse::retry("read model warming up", Some(Duration::from_millis(500)))
        } else {
            println!(
                "  handled {} from {} (retry: {:?})",
                event.log_position(),
                event.event_source(),
                request.retry_processing_state.as_ref().map(|r| r.retry_count)
            );
            EventHandlerResponse::success()
        }
    };

    while let Some(message) = receiver.recv().await {
        let reply = match message {
            RuntimeToClientMessage::ConnectResponse(response) => {
                match response.failure {
                    Some(failure) => warn!(reason = %failure.reason, "registration rejected"),
                    None => info!("registration accepted"),
                }
                continue;
            }
            RuntimeToClientMessage::Ping => ClientToRuntimeMessage::Pong,
            RuntimeToClientMessage::Request { context, request } => {
                ClientToRuntimeMessage::Response {
                    context: ResponseContext {
                        call_id: context.call_id,
                    },
                    response: handle(&request),
                }
            }
        };
        if sender.send(reply).await.is_err() {
            break;
        }
    }
}

async fn wait_for(handlers: &EventHandlers, tenant: TenantId, position: ProcessingPosition) {
    loop {
        let reached = handlers
            .states(&BALANCES)
            .ok()
            .and_then(|states| states.get(&tenant).map(|state| state.position()))
            .is_some_and(|current| current >= position);
        if reached {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let store = Arc::new(InMemoryEventStore::new());
    let scope = ScopeId::default_scope();
    for (tenant, events) in [
        (
            TENANT_A,
            vec![
                ("alice", ACCOUNT_OPENED),
                ("alice", ACCOUNT_DEPOSITED),
                ("alice", ACCOUNT_AUDITED),
            ],
        ),
        (
            TENANT_B,
            vec![("bob", ACCOUNT_OPENED), ("carol", ACCOUNT_OPENED)],
        ),
    ] {
        for (source, event_type) in events {
            store.commit(tenant, scope, source.to_string(), event_type, json!({ "amount": 10 }));
        }
    }

    let handlers = Arc::new(
        EventHandlers::builder()
            .states(Arc::new(InMemoryStreamProcessorStates::new()))
            .fetcher(store.clone())
            .waiter(store.clone())
            .writer(store.clone())
            .filter_definitions(Arc::new(InMemoryFilterDefinitions::new()))
            .tenants(Arc::new(StaticTenants::new([TENANT_A, TENANT_B])))
            .build(),
    );

    let mut outcomes = handlers.outcomes();
    tokio::spawn(async move {
        while let Some(outcome) = outcomes.next().await {
            if let OutcomeKind::Retrying { reason, .. } = &outcome.kind {
                info!(tenant = %outcome.tenant, position = %outcome.position, reason = %reason, "retry scheduled");
            }
        }
    });

    let lifetime = CancellationToken::new();
    let (runtime, client) = in_process::<EventHandlerProtocol>(64);
    client
        .sender
        .send(ClientToRuntimeMessage::Connect {
            context: ConnectContext {
                execution_context: context(TENANT_A),
                ping_interval: Duration::from_secs(1),
            },
            arguments: EventHandlerRegistrationArguments::builder()
                .event_handler(BALANCES)
                .partitioned(true)
                .event_types(vec![ACCOUNT_OPENED, ACCOUNT_DEPOSITED])
                .alias("balances")
                .build(),
        })
        .await?;
    tokio::spawn(run_client(client));

    let registration = tokio::spawn({
        let handlers = handlers.clone();
        let lifetime = lifetime.clone();
        async move {
            handlers
                .register(runtime.inbound, runtime.outbound, &lifetime)
                .await
        }
    });

    println!("catching up both tenants");
    wait_for(&handlers, TENANT_A, ProcessingPosition::new(2, 2)).await;
    wait_for(&handlers, TENANT_B, ProcessingPosition::new(2, 2)).await;

    println!("repositioning every tenant to the start");
    for (tenant, result) in handlers.reprocess_all_from_start(&BALANCES).await? {
        println!("  {tenant}: {result:?}");
    }
    wait_for(&handlers, TENANT_A, ProcessingPosition::new(2, 2)).await;
    wait_for(&handlers, TENANT_B, ProcessingPosition::new(2, 2)).await;

    for (tenant, state) in handlers.states(&BALANCES)? {
        println!("  {tenant}: position {}", state.position());
    }

    lifetime.cancel();
    let reason = registration.await??;
    println!("connection closed: {reason}");
    Ok(())
}
