//! 线上消息（wire）
//!
//! 客户端 → 运行时：`Connect`、`Pong`、`Response`、`InitiateDisconnect`；
//! 运行时 → 客户端：`ConnectResponse`、`Ping`、`Request`。
//!
use evflow_macros::identifier;
use evflow_streams::execution_context::ExecutionContext;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// 每个在途请求的关联 ID
#[identifier]
#[derive(Copy)]
pub struct ReverseCallId(Uuid);

impl ReverseCallId {
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// 一种反向调用协议实例的负载类型
pub trait ReverseCallProtocol: Send + Sync + 'static {
    type Arguments: Send + 'static;
    type ConnectResponse: Send + 'static;
    type Request: Send + 'static;
    type Response: Send + 'static;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectContext {
    pub execution_context: ExecutionContext,
    pub ping_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContext {
    pub call_id: ReverseCallId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub call_id: ReverseCallId,
    pub execution_context: ExecutionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientToRuntimeMessage<A, R> {
    Connect {
        context: ConnectContext,
        arguments: A,
    },
    Pong,
    Response {
        context: ResponseContext,
        response: R,
    },
    InitiateDisconnect,
}

impl<A, R> ClientToRuntimeMessage<A, R> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Pong => "pong",
            Self::Response { .. } => "response",
            Self::InitiateDisconnect => "initiate_disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeToClientMessage<C, Q> {
    ConnectResponse(C),
    Ping,
    Request {
        context: RequestContext,
        request: Q,
    },
}

pub type ClientMessage<P> = ClientToRuntimeMessage<
    <P as ReverseCallProtocol>::Arguments,
    <P as ReverseCallProtocol>::Response,
>;

pub type RuntimeMessage<P> = RuntimeToClientMessage<
    <P as ReverseCallProtocol>::ConnectResponse,
    <P as ReverseCallProtocol>::Request,
>;
