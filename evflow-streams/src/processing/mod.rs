//! 流处理（processing）
//!
//! - `ScopedStreamProcessor`：单租户处理循环（拉取、分发、失败追赶、重定位）；
//! - `StreamProcessor`：把一个处理器扇出到全部租户；
//! - `StreamProcessorRegistry`：按 `ProcessorId` 的注册表；
//! - `PositionStrategy`：非分区/分区两种位点推进策略；
//! - `ProcessingOutcome`：每个事件的处理结果广播。
//!
mod config;
mod dependencies;
mod outcome;
mod processor;
mod registry;
mod scoped;
mod strategy;
mod stream_processor;

pub use config::StreamProcessorConfig;
pub use dependencies::StreamProcessorDependencies;
pub use outcome::{DEFAULT_OUTCOME_CAPACITY, OutcomeKind, ProcessingOutcome};
pub use processor::{ProcessingResult, Processor};
pub use registry::StreamProcessorRegistry;
pub use scoped::{ProcessorStatus, RepositionAction, ScopedStreamProcessor};
pub use strategy::{
    FailureStep, FailureTarget, Partitioned, PositionStrategy, RecordedFailure, Unpartitioned,
};
pub use stream_processor::StreamProcessor;
