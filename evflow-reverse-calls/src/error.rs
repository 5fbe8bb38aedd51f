//! 反向调用错误与连接关闭原因
//!
use std::fmt;
use thiserror::Error;

/// 连接被拆除的原因；拆除流程对所有原因一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 调用方取消（生命周期令牌或显式 cancel）
    CallerCancelled,
    /// 客户端关闭了消息流
    PeerClosed,
    /// 客户端发送了断开请求
    PeerDisconnected,
    KeepaliveTimedOut,
    ProtocolViolation(String),
    Transport(String),
}

impl CloseReason {
    /// 需要告警的异常关闭
    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            Self::KeepaliveTimedOut | Self::ProtocolViolation(_) | Self::Transport(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallerCancelled => f.write_str("cancelled by caller"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::PeerDisconnected => f.write_str("peer initiated disconnect"),
            Self::KeepaliveTimedOut => f.write_str("keepalive timed out"),
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReverseCallError {
    #[error("connect handshake missing: {reason}")]
    HandshakeMissing { reason: String },
    #[error("ping interval must be greater than zero")]
    InvalidPingInterval,
    #[error("connect arguments already received")]
    AlreadyConnected,
    #[error("connection has not been accepted")]
    NotAccepted,
    #[error("connect response already sent")]
    AlreadyResponded,
    #[error("client did not respond to pings in time")]
    PingTimedOut,
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: CloseReason },
    #[error("transport error: {reason}")]
    Transport { reason: String },
}

impl ReverseCallError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn handshake_missing(reason: impl Into<String>) -> Self {
        Self::HandshakeMissing {
            reason: reason.into(),
        }
    }
}

impl From<CloseReason> for ReverseCallError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::KeepaliveTimedOut => Self::PingTimedOut,
            reason => Self::ConnectionClosed { reason },
        }
    }
}

pub type ReverseCallResult<T> = Result<T, ReverseCallError>;
