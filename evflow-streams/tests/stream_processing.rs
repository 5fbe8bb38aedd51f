use async_trait::async_trait;
use evflow_streams::clock::TokioClock;
use evflow_streams::error::{StreamsError, StreamsResult};
use evflow_streams::event::StreamEvent;
use evflow_streams::execution_context::ExecutionContext;
use evflow_streams::ids::{
    EventProcessorId, EventTypeId, MicroserviceId, PartitionId, ProcessorId, ScopeId, StreamId,
    StreamKey, TenantId,
};
use evflow_streams::inmemory::{InMemoryEventStore, InMemoryStreamProcessorStates};
use evflow_streams::position::ProcessingPosition;
use evflow_streams::processing::{
    OutcomeKind, Partitioned, PositionStrategy, ProcessingResult, Processor, ProcessorStatus,
    StreamProcessor, StreamProcessorConfig, StreamProcessorDependencies, StreamProcessorRegistry,
    Unpartitioned,
};
use evflow_streams::source::EventFetcher;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Process(u64),
    Reprocess(u64, u32),
}

/// 按日志位点预设结果的处理器，未预设时成功
#[derive(Default)]
struct ScriptedProcessor {
    scripts: Mutex<HashMap<u64, VecDeque<ProcessingResult>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedProcessor {
    fn script(&self, log_position: u64, results: impl IntoIterator<Item = ProcessingResult>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(log_position)
            .or_default()
            .extend(results);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next_result(&self, event: &StreamEvent) -> ProcessingResult {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&event.event().log_position())
            .and_then(VecDeque::pop_front)
            .unwrap_or(ProcessingResult::Success)
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn process(&self, event: &StreamEvent, _: &ExecutionContext) -> ProcessingResult {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Process(event.event().log_position()));
        self.next_result(event)
    }

    async fn reprocess(
        &self,
        event: &StreamEvent,
        _failure_reason: &str,
        retry_attempts: u32,
        _: &ExecutionContext,
    ) -> ProcessingResult {
        self.calls.lock().unwrap().push(Call::Reprocess(
            event.event().log_position(),
            retry_attempts,
        ));
        self.next_result(event)
    }
}

struct Harness {
    store: Arc<InMemoryEventStore>,
    states: Arc<InMemoryStreamProcessorStates>,
    deps: StreamProcessorDependencies,
    lifetime: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self::with_fetcher(None)
    }

    fn with_fetcher(fetcher: Option<Arc<dyn EventFetcher>>) -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let states = Arc::new(InMemoryStreamProcessorStates::new());
        let fetcher: Arc<dyn EventFetcher> = match fetcher {
            Some(fetcher) => fetcher,
            None => store.clone(),
        };
        let deps = StreamProcessorDependencies::builder()
            .states(states.clone())
            .fetcher(fetcher)
            .waiter(store.clone())
            .clock(Arc::new(TokioClock::new()))
            .config(StreamProcessorConfig {
                batch_size: 10,
                ..StreamProcessorConfig::default()
            })
            .build();
        Self {
            store,
            states,
            deps,
            lifetime: CancellationToken::new(),
        }
    }

    fn commit(&self, tenant: TenantId, source: &str) -> u64 {
        self.store
            .commit(
                tenant,
                ScopeId::default_scope(),
                source.to_string(),
                event_type(),
                json!({ "source": source }),
            )
            .log_position()
    }

    async fn start(
        &self,
        id: ProcessorId,
        tenants: Vec<TenantId>,
        strategy: Arc<dyn PositionStrategy>,
        processor: Arc<ScriptedProcessor>,
    ) -> Arc<StreamProcessor> {
        let stream_processor = self.create(id, tenants, strategy, processor).await;
        stream_processor.start(&self.lifetime).unwrap();
        stream_processor
    }

    async fn create(
        &self,
        id: ProcessorId,
        tenants: Vec<TenantId>,
        strategy: Arc<dyn PositionStrategy>,
        processor: Arc<ScriptedProcessor>,
    ) -> Arc<StreamProcessor> {
        let context = ExecutionContext::builder()
            .microservice(MicroserviceId::new(Uuid::from_u128(7)))
            .tenant(tenants[0])
            .build();
        let stream_processor = StreamProcessor::create(
            id,
            tenants,
            strategy,
            move |_: &TenantId| -> Arc<dyn Processor> { processor.clone() },
            &context,
            self.deps.clone(),
        )
        .await
        .unwrap();
        Arc::new(stream_processor)
    }

    fn persisted_positions(&self) -> Vec<ProcessingPosition> {
        self.states
            .history()
            .into_iter()
            .map(|(_, _, state)| state.position())
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

fn tenant(n: u128) -> TenantId {
    TenantId::new(Uuid::from_u128(n))
}

fn event_type() -> EventTypeId {
    EventTypeId::new(Uuid::from_u128(100))
}

fn event_log_processor() -> ProcessorId {
    ProcessorId::new(
        ScopeId::default_scope(),
        EventProcessorId::new(Uuid::from_u128(200)),
        StreamId::event_log(),
    )
}

fn pos(n: u64) -> ProcessingPosition {
    ProcessingPosition::new(n, n)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn successes_advance_position_with_one_persist_per_event() {
    let harness = Harness::new();
    for source in ["a", "b", "c"] {
        harness.commit(tenant(1), source);
    }
    let processor = Arc::new(ScriptedProcessor::default());
    let sp = harness
        .start(event_log_processor(), vec![tenant(1)], Arc::new(Unpartitioned), processor.clone())
        .await;

    eventually(|| sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(3))).await;

    assert_eq!(harness.persisted_positions(), vec![pos(1), pos(2), pos(3)]);
    assert_eq!(
        processor.calls(),
        vec![Call::Process(0), Call::Process(1), Call::Process(2)]
    );
    let state = sp.current_state(&tenant(1)).unwrap();
    assert!(!state.is_failing());
    assert!(state.last_success_at().is_some());
}

#[tokio::test(start_paused = true)]
async fn retry_keeps_failing_position_until_reprocessing_succeeds() {
    let harness = Harness::new();
    harness.commit(tenant(1), "a");
    harness.commit(tenant(1), "b");
    let processor = Arc::new(ScriptedProcessor::default());
    processor.script(
        0,
        [
            ProcessingResult::retry("not yet", None),
            ProcessingResult::retry("still not", Some(Duration::from_secs(5))),
        ],
    );
    let sp = harness
        .start(event_log_processor(), vec![tenant(1)], Arc::new(Unpartitioned), processor.clone())
        .await;

    eventually(|| sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(2))).await;

    assert_eq!(
        processor.calls(),
        vec![
            Call::Process(0),
            Call::Reprocess(0, 1),
            Call::Reprocess(0, 2),
            Call::Process(1),
        ]
    );
    let history = harness.states.history();
    let failing: Vec<_> = history
        .iter()
        .map(|(_, _, s)| s)
        .filter(|s| s.is_failing())
        .collect();
    assert_eq!(failing.len(), 2);
    assert!(failing.iter().all(|s| s.position() == pos(0)));
    assert_eq!(failing[0].retry_attempts(), 1);
    assert_eq!(failing[1].retry_attempts(), 2);
    assert_eq!(failing[1].failure_reason(), "still not");
}

#[tokio::test(start_paused = true)]
async fn fail_halts_processing_until_repositioned() {
    let harness = Harness::new();
    for source in ["a", "b", "c"] {
        harness.commit(tenant(1), source);
    }
    let processor = Arc::new(ScriptedProcessor::default());
    processor.script(0, [ProcessingResult::fail("poison")]);
    let sp = harness
        .start(event_log_processor(), vec![tenant(1)], Arc::new(Unpartitioned), processor.clone())
        .await;

    eventually(|| sp.current_state(&tenant(1)).is_some_and(|s| s.is_failing())).await;
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(processor.calls(), vec![Call::Process(0)]);
    let state = sp.current_state(&tenant(1)).unwrap();
    assert_eq!(state.position(), pos(0));
    assert_eq!(state.retry_after(), None);
    assert_eq!(sp.status(&tenant(1)), Some(ProcessorStatus::CatchingUpFailures));

    let repositioned = sp
        .reprocess_from(&tenant(1), ProcessingPosition::START)
        .await
        .unwrap();
    assert_eq!(repositioned, ProcessingPosition::START);

    eventually(|| sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(3))).await;
    assert_eq!(
        processor.calls(),
        vec![
            Call::Process(0),
            Call::Process(0),
            Call::Process(1),
            Call::Process(2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn reposition_forward_is_rejected_and_backward_restarts_fetching() {
    let harness = Harness::new();
    harness.commit(tenant(1), "a");
    harness.commit(tenant(1), "b");
    let processor = Arc::new(ScriptedProcessor::default());
    let sp = harness
        .start(event_log_processor(), vec![tenant(1)], Arc::new(Unpartitioned), processor.clone())
        .await;
    eventually(|| sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(2))).await;
    let persists_before = harness.states.persist_count();

    let forward = sp.reprocess_from(&tenant(1), pos(5)).await;
    assert!(matches!(
        forward,
        Err(StreamsError::CannotRepositionForward { requested, current })
            if requested == pos(5) && current == pos(2)
    ));
    assert_eq!(harness.states.persist_count(), persists_before);

    assert_eq!(sp.reprocess_from(&tenant(1), pos(1)).await.unwrap(), pos(1));
    eventually(|| processor.calls().len() == 3).await;
    assert_eq!(processor.calls()[2], Call::Process(1));
}

#[tokio::test(start_paused = true)]
async fn second_reposition_while_one_is_pending_fails_immediately() {
    let harness = Harness::new();
    harness.commit(tenant(1), "a");
    let sp = harness
        .start(
            event_log_processor(),
            vec![tenant(1)],
            Arc::new(Unpartitioned),
            Arc::new(ScriptedProcessor::default()),
        )
        .await;
    eventually(|| sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(1))).await;

    let gate = Arc::new(Notify::new());
    let first = {
        let sp = sp.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            sp.perform_action_and_reprocess_from(&tenant(1), ProcessingPosition::START, move |_| {
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })
            .await
        })
    };
    eventually(|| sp.status(&tenant(1)) == Some(ProcessorStatus::Repositioning)).await;

    let second = sp.reprocess_from(&tenant(1), ProcessingPosition::START).await;
    assert!(matches!(second, Err(StreamsError::AlreadyRepositioning { .. })));

    gate.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), ProcessingPosition::START);
}

#[tokio::test(start_paused = true)]
async fn reposition_queued_before_start_ends_when_processor_is_stopped() {
    let harness = Harness::new();
    let processor = harness
        .create(
            event_log_processor(),
            vec![tenant(1)],
            Arc::new(Unpartitioned),
            Arc::new(ScriptedProcessor::default()),
        )
        .await;

    let queued = tokio::spawn({
        let processor = processor.clone();
        async move { processor.reprocess_from(&tenant(1), pos(0)).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    processor.stop();

    let queued = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .expect("queued reposition ends on stop")
        .unwrap();
    assert!(matches!(queued, Err(StreamsError::Cancelled)));

    let rejected = tokio::time::timeout(
        Duration::from_secs(5),
        processor.reprocess_from(&tenant(1), pos(0)),
    )
    .await
    .expect("reposition after stop returns immediately");
    assert!(matches!(rejected, Err(StreamsError::TenantNotRunning { .. })));
    processor.completed().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_reposition_action_leaves_state_untouched() {
    let harness = Harness::new();
    harness.commit(tenant(1), "a");
    let sp = harness
        .start(
            event_log_processor(),
            vec![tenant(1)],
            Arc::new(Unpartitioned),
            Arc::new(ScriptedProcessor::default()),
        )
        .await;
    eventually(|| sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(1))).await;

    let result = sp
        .perform_action_and_reprocess_from(&tenant(1), ProcessingPosition::START, |_| async {
            Err(anyhow::anyhow!("client refused"))
        })
        .await;
    assert!(matches!(result, Err(StreamsError::RepositionAction { reason }) if reason.contains("client refused")));
    assert_eq!(sp.current_state(&tenant(1)).unwrap().position(), pos(1));
}

#[tokio::test(start_paused = true)]
async fn empty_stream_waits_without_persisting() {
    let harness = Harness::new();
    let processor = Arc::new(ScriptedProcessor::default());
    let sp = harness
        .start(event_log_processor(), vec![tenant(1)], Arc::new(Unpartitioned), processor.clone())
        .await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(harness.states.persist_count(), 0);
    assert_eq!(sp.status(&tenant(1)), Some(ProcessorStatus::Fetching));

    harness.commit(tenant(1), "late");
    eventually(|| processor.calls() == vec![Call::Process(0)]).await;
}

#[tokio::test(start_paused = true)]
async fn failing_partition_does_not_block_other_partitions() {
    let harness = Harness::new();
    let scope = ScopeId::default_scope();
    let derived = StreamKey::new(scope, StreamId::new(Uuid::from_u128(300)));
    for source in ["a", "b", "a", "b"] {
        let position = harness.commit(tenant(1), source);
        let committed = harness.store.events(&tenant(1), &StreamKey::event_log(scope))
            [position as usize]
            .event()
            .clone();
        evflow_streams::source::StreamWriter::write(
            harness.store.as_ref(),
            &tenant(1),
            &derived,
            &committed,
            &PartitionId::new(source.into()),
            true,
        )
        .await
        .unwrap();
    }

    let id = ProcessorId::new(scope, EventProcessorId::new(Uuid::from_u128(300)), derived.stream);
    let processor = Arc::new(ScriptedProcessor::default());
    processor.script(0, [ProcessingResult::retry("partition a down", None)]);
    let sp = harness
        .start(id, vec![tenant(1)], Arc::new(Partitioned), processor.clone())
        .await;

    eventually(|| {
        sp.current_state(&tenant(1))
            .is_some_and(|s| s.position() == pos(4) && s.failing_partitions().is_empty())
    })
    .await;

    assert_eq!(
        processor.calls(),
        vec![
            Call::Process(0),
            Call::Process(1),
            Call::Process(3),
            Call::Reprocess(0, 1),
            Call::Process(2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn infrastructure_errors_are_retried_until_they_clear() {
    let harness = Harness::new();
    harness.commit(tenant(1), "a");
    harness.commit(tenant(1), "b");
    harness.store.fail_next_fetches(3);
    harness.states.fail_next_persists(2);

    let processor = Arc::new(ScriptedProcessor::default());
    let sp = harness
        .start(event_log_processor(), vec![tenant(1)], Arc::new(Unpartitioned), processor.clone())
        .await;

    eventually(|| sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(2))).await;
    assert_eq!(harness.persisted_positions(), vec![pos(1), pos(2)]);
    assert_eq!(processor.calls(), vec![Call::Process(0), Call::Process(1)]);
}

#[tokio::test(start_paused = true)]
async fn outcomes_are_broadcast_per_event() {
    let harness = Harness::new();
    let mut outcomes = harness.deps.subscribe_outcomes();
    harness.commit(tenant(1), "a");
    harness.commit(tenant(1), "b");
    let processor = Arc::new(ScriptedProcessor::default());
    processor.script(1, [ProcessingResult::retry("later", None)]);
    let _sp = harness
        .start(event_log_processor(), vec![tenant(1)], Arc::new(Unpartitioned), processor)
        .await;

    let first = outcomes.recv().await.unwrap();
    assert_eq!(first.position, pos(0));
    assert_eq!(first.kind, OutcomeKind::Processed);

    let second = outcomes.recv().await.unwrap();
    assert_eq!(second.position, pos(1));
    assert!(matches!(second.kind, OutcomeKind::Retrying { retry_attempts: 1, .. }));

    let third = outcomes.recv().await.unwrap();
    assert_eq!(third.position, pos(1));
    assert_eq!(third.kind, OutcomeKind::Processed);
}

#[tokio::test(start_paused = true)]
async fn tenants_progress_independently_and_state_survives_restart() {
    let harness = Harness::new();
    harness.commit(tenant(1), "a");
    harness.commit(tenant(2), "x");
    harness.commit(tenant(2), "y");
    let processor = Arc::new(ScriptedProcessor::default());
    let sp = harness
        .start(
            event_log_processor(),
            vec![tenant(1), tenant(2)],
            Arc::new(Unpartitioned),
            processor,
        )
        .await;
    eventually(|| {
        sp.current_state(&tenant(1)).map(|s| s.position()) == Some(pos(1))
            && sp.current_state(&tenant(2)).map(|s| s.position()) == Some(pos(2))
    })
    .await;

    sp.stop();
    sp.completed().await.unwrap();
    assert_eq!(sp.status(&tenant(1)), Some(ProcessorStatus::Stopped));

    let restarted = harness
        .start(
            event_log_processor(),
            vec![tenant(1), tenant(2)],
            Arc::new(Unpartitioned),
            Arc::new(ScriptedProcessor::default()),
        )
        .await;
    assert_eq!(restarted.current_state(&tenant(2)), sp.current_state(&tenant(2)));
}

/// 对指定租户返回非基础设施错误的拉取器
struct BrokenForTenant {
    inner: Arc<InMemoryEventStore>,
    broken: TenantId,
}

#[async_trait]
impl EventFetcher for BrokenForTenant {
    async fn fetch_next(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        from: ProcessingPosition,
        limit: usize,
    ) -> StreamsResult<Vec<StreamEvent>> {
        if *tenant == self.broken {
            return Err(StreamsError::invalid_state("corrupted stream"));
        }
        self.inner.fetch_next(tenant, stream, from, limit).await
    }

    async fn fetch_in_partition(
        &self,
        tenant: &TenantId,
        stream: &StreamKey,
        partition: &PartitionId,
        from: ProcessingPosition,
    ) -> StreamsResult<Option<StreamEvent>> {
        self.inner
            .fetch_in_partition(tenant, stream, partition, from)
            .await
    }
}

#[tokio::test(start_paused = true)]
async fn unexpected_tenant_failure_stops_siblings_and_fails_the_processor() {
    let store = Arc::new(InMemoryEventStore::new());
    let mut harness = Harness::with_fetcher(Some(Arc::new(BrokenForTenant {
        inner: store.clone(),
        broken: tenant(2),
    })));
    harness.store = store;
    let sp = harness
        .start(
            event_log_processor(),
            vec![tenant(1), tenant(2)],
            Arc::new(Unpartitioned),
            Arc::new(ScriptedProcessor::default()),
        )
        .await;

    let completed = sp.completed().await;
    assert!(matches!(
        completed,
        Err(StreamsError::ProcessorFailed { tenant, .. }) if tenant == self::tenant(2)
    ));
    assert_eq!(sp.status(&tenant(1)), Some(ProcessorStatus::Stopped));
    assert!(!harness.lifetime.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn registry_reserves_ids_and_invokes_factory_once() {
    let harness = Harness::new();
    let registry = StreamProcessorRegistry::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let context = ExecutionContext::builder()
        .microservice(MicroserviceId::new(Uuid::from_u128(7)))
        .tenant(tenant(1))
        .build();

    let factory = || {
        let invocations = invocations.clone();
        let deps = harness.deps.clone();
        let context = context.clone();
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            StreamProcessor::create(
                event_log_processor(),
                vec![tenant(1)],
                Arc::new(Unpartitioned),
                |_: &TenantId| -> Arc<dyn Processor> { Arc::new(ScriptedProcessor::default()) },
                &context,
                deps,
            )
            .await
        }
    };

    let first = registry.try_register(event_log_processor(), factory).await;
    assert!(first.is_ok());
    let second = registry.try_register(event_log_processor(), factory).await;
    assert!(matches!(second, Err(StreamsError::AlreadyRegistered { .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let failed = registry
        .try_register(
            ProcessorId::new(
                ScopeId::default_scope(),
                EventProcessorId::new(Uuid::from_u128(999)),
                StreamId::event_log(),
            ),
            || async { Err(StreamsError::persistence("store offline")) },
        )
        .await;
    assert!(failed.is_err());
    assert_eq!(registry.ids(), vec![event_log_processor()]);

    assert!(registry.unregister(&event_log_processor()).await.is_some());
    assert!(registry.get(&event_log_processor()).is_none());
    assert!(registry.unregister(&event_log_processor()).await.is_none());
}
