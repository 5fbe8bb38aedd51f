//! 过滤器（filters）
//!
//! 过滤器是一种内置处理器：读取事件日志，把命中的事件写入以事件处理器命名的派生流。
//! - `FilterDefinition`：按事件类型过滤，可选按事件源分区；
//! - `FilterProcessor`：实现 `Processor`，写入失败时交由引擎重试；
//! - `FilterValidator`：注册时比较新旧定义，定义变化且会产生不同派生流时拒绝注册。
//!
mod definition;
mod processor;
mod validator;

pub use definition::FilterDefinition;
pub use processor::FilterProcessor;
pub use validator::FilterValidator;
