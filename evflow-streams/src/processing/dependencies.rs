use super::config::StreamProcessorConfig;
use super::outcome::ProcessingOutcome;
use crate::clock::{Clock, SystemClock};
use crate::persist::StreamProcessorStates;
use crate::source::{EventFetcher, EventWaiter};
use bon::bon;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// 流处理器共享的外部协作方
#[derive(Clone)]
pub struct StreamProcessorDependencies {
    pub(crate) states: Arc<dyn StreamProcessorStates>,
    pub(crate) fetcher: Arc<dyn EventFetcher>,
    pub(crate) waiter: Arc<dyn EventWaiter>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: StreamProcessorConfig,
    pub(crate) outcomes: broadcast::Sender<ProcessingOutcome>,
}

#[bon]
impl StreamProcessorDependencies {
    #[builder]
    pub fn new(
        states: Arc<dyn StreamProcessorStates>,
        fetcher: Arc<dyn EventFetcher>,
        waiter: Arc<dyn EventWaiter>,
        clock: Option<Arc<dyn Clock>>,
        #[builder(default)] config: StreamProcessorConfig,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(config.outcome_capacity.max(1));
        Self {
            states,
            fetcher,
            waiter,
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config,
            outcomes,
        }
    }

    pub fn config(&self) -> &StreamProcessorConfig {
        &self.config
    }

    pub fn states(&self) -> &Arc<dyn StreamProcessorStates> {
        &self.states
    }

    pub fn fetcher(&self) -> &Arc<dyn EventFetcher> {
        &self.fetcher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 订阅所有处理器的处理结果
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<ProcessingOutcome> {
        self.outcomes.subscribe()
    }

    /// 以流的形式订阅处理结果；落后过多的订阅者会丢弃被覆盖的结果
    pub fn outcome_stream(&self) -> BoxStream<'static, ProcessingOutcome> {
        let stream = BroadcastStream::new(self.outcomes.subscribe())
            .filter_map(|outcome| async move { outcome.ok() });
        Box::pin(stream)
    }

    pub(crate) fn publish(&self, outcome: ProcessingOutcome) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.outcomes.send(outcome);
    }
}
