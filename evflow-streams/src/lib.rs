//! 事件流处理核心（evflow-streams）
//!
//! 多租户事件溯源运行时中“把事件流可靠地交给处理器”的部分：
//! - 数据模型：标识符（`ids`）、位点（`position`）、事件（`event`）、处理器状态（`state`）；
//! - 外部协作方协议：事件拉取/等待/写入（`source`）、状态与过滤器定义持久化（`persist`）；
//! - 处理引擎（`processing`）：单租户处理循环、位点策略、多租户扇出与注册表；
//! - 过滤器（`filters`）：把事件日志过滤为派生流的内置处理器及其注册校验；
//! - 内存实现（`inmemory`）：用于测试与本地开发。
//!
//! 投递语义为至少一次：处理器在状态持久化之前崩溃时，事件会被再次投递。
//!
//! 典型用法：
//! 1. 实现（或选用）`EventFetcher`/`EventWaiter`/`StreamProcessorStates`；
//! 2. 用 `StreamProcessorDependencies::builder()` 组装协作方；
//! 3. 通过 `StreamProcessorRegistry::try_register` 创建 `StreamProcessor` 并 `start`；
//! 4. 订阅 `ProcessingOutcome` 观察处理进度，必要时 `reprocess_from` 重定位。
//!
pub mod clock;
pub mod error;
pub mod event;
pub mod execution_context;
pub mod filters;
pub mod ids;
#[cfg(feature = "inmemory")]
pub mod inmemory;
pub mod persist;
pub mod position;
pub mod processing;
pub mod source;
pub mod state;
pub mod tenancy;
