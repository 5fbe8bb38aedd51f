//! 事件处理器的反向调用协议实例
//!
//! 连接参数描述要注册的事件处理器；每个请求携带一个事件（重试时附带上次失败信息），
//! 响应中缺少 `failure` 即表示处理成功。
//!
use bon::Builder;
use evflow_macros::identifier;
use evflow_reverse_calls::ReverseCallProtocol;
use evflow_streams::event::StreamEvent;
use evflow_streams::ids::{EventProcessorId, EventTypeId, ScopeId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub struct EventHandlerProtocol;

impl ReverseCallProtocol for EventHandlerProtocol {
    type Arguments = EventHandlerRegistrationArguments;
    type ConnectResponse = EventHandlerRegistrationResponse;
    type Request = HandleEventRequest;
    type Response = EventHandlerResponse;
}

#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandlerRegistrationArguments {
    pub event_handler: EventProcessorId,
    #[builder(default = ScopeId::default_scope())]
    pub scope: ScopeId,
    #[builder(default)]
    pub partitioned: bool,
    /// 客户端声明的并发度；同一租户内仍按位点顺序处理
    #[builder(default = 1)]
    pub concurrency: u32,
    pub event_types: Vec<EventTypeId>,
    #[builder(into)]
    pub alias: Option<String>,
}

/// 注册失败的类别
#[identifier]
#[derive(Copy)]
pub struct FailureId(Uuid);

impl FailureId {
    pub const INVALID_ARGUMENTS: Self = Self::new(Uuid::from_u128(0x4ed2_a3b1_0c55_4d1e_8f3f_2f0e_17a6_0001));
    pub const ALREADY_REGISTERED: Self = Self::new(Uuid::from_u128(0x4ed2_a3b1_0c55_4d1e_8f3f_2f0e_17a6_0002));
    pub const FILTER_VALIDATION_FAILED: Self = Self::new(Uuid::from_u128(0x4ed2_a3b1_0c55_4d1e_8f3f_2f0e_17a6_0003));
    pub const REGISTRATION_FAILED: Self = Self::new(Uuid::from_u128(0x4ed2_a3b1_0c55_4d1e_8f3f_2f0e_17a6_0004));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub id: FailureId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandlerRegistrationResponse {
    pub failure: Option<Failure>,
}

impl EventHandlerRegistrationResponse {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn rejected(id: FailureId, reason: impl Into<String>) -> Self {
        Self {
            failure: Some(Failure {
                id,
                reason: reason.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryProcessingState {
    pub failure_reason: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleEventRequest {
    pub event: StreamEvent,
    pub retry_processing_state: Option<RetryProcessingState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorFailure {
    pub reason: String,
    pub retry: bool,
    pub retry_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandlerResponse {
    pub failure: Option<ProcessorFailure>,
}

impl EventHandlerResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn retry(reason: impl Into<String>, retry_timeout: Option<Duration>) -> Self {
        Self {
            failure: Some(ProcessorFailure {
                reason: reason.into(),
                retry: true,
                retry_timeout,
            }),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(ProcessorFailure {
                reason: reason.into(),
                retry: false,
                retry_timeout: None,
            }),
        }
    }
}
