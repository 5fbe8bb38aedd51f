//! evflow 事件处理器层（handlers）
//!
//! 把客户端通过反向调用连接注册的事件处理器接入流处理引擎：
//! - `protocol`：事件处理器的连接参数、请求与响应；
//! - `processor`：`EventHandlerProcessor`，把一次事件处理变成一次远程调用；
//! - `registration`：`EventHandlers`，负责注册、运行、注销以及运维重定位；
//! - `config` / `error`：服务配置与统一错误。
//!
pub mod config;
pub mod error;
pub mod processor;
pub mod protocol;
pub mod registration;

pub use config::EventHandlersConfig;
pub use error::{HandlerError, HandlerResult};
pub use processor::EventHandlerProcessor;
pub use protocol::{
    EventHandlerProtocol, EventHandlerRegistrationArguments, EventHandlerRegistrationResponse,
    EventHandlerResponse, Failure, FailureId, HandleEventRequest, ProcessorFailure,
    RetryProcessingState,
};
pub use registration::EventHandlers;
