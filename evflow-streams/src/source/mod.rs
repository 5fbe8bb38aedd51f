//! 事件来源（source）
//!
//! 引擎消费的外部协作方协议，仅定义接口，不绑定具体存储：
//! - `EventFetcher`：按位点批量拉取流中的事件；
//! - `EventWaiter`：在没有新事件时带超时地等待，避免忙轮询；
//! - `StreamWriter`：过滤器把命中的事件写入派生流。
//!
mod fetcher;
mod waiter;
mod writer;

pub use fetcher::EventFetcher;
pub use waiter::EventWaiter;
pub use writer::StreamWriter;
