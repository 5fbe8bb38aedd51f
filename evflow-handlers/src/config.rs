use evflow_reverse_calls::ReverseCallConfig;
use evflow_streams::processing::StreamProcessorConfig;
use serde::{Deserialize, Serialize};

/// 事件处理器服务配置
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHandlersConfig {
    pub stream_processor: StreamProcessorConfig,
    pub reverse_call: ReverseCallConfig,
}
