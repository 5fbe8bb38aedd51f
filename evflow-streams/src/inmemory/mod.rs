//! 内存实现（inmemory）
//!
//! 满足 `source` 与 `persist` 协议的轻量实现，典型用途：测试、示例与本地开发。
//! 支持注入基础设施故障，以便验证引擎的无限重试行为。
//!
mod event_store;
mod filter_definitions;
mod states;

pub use event_store::InMemoryEventStore;
pub use filter_definitions::InMemoryFilterDefinitions;
pub use states::InMemoryStreamProcessorStates;
