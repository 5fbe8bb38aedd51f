//! 反向调用协议（evflow-reverse-calls）
//!
//! 客户端主动建立双工消息流，运行时反过来向客户端发起请求并等待响应：
//! - 握手：首条消息必须是携带参数与心跳间隔的连接消息，运行时以接受/拒绝作答；
//! - 关联：每个请求生成 `ReverseCallId`，响应按 ID 匹配，允许乱序；
//! - 心跳：运行时按间隔发送 ping，任何入站消息都会刷新存活期限，超时即断开；
//! - 写入串行化：单一写锁，ping 在写锁被占用时直接跳过。
//!
//! 协议对具体负载泛型化（`ReverseCallProtocol`），事件处理器只是其中一种实例。
//!
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod transport;
pub mod wire;

pub use config::ReverseCallConfig;
pub use dispatcher::{ConnectArguments, ReverseCallDispatcher};
pub use error::{CloseReason, ReverseCallError, ReverseCallResult};
pub use transport::{ChannelWriter, ClientEnd, MessageWriter, RuntimeEnd, in_process};
pub use wire::{
    ClientMessage, ClientToRuntimeMessage, ConnectContext, RequestContext, ResponseContext,
    ReverseCallId, ReverseCallProtocol, RuntimeMessage, RuntimeToClientMessage,
};
