//! 反向调用分发器（ReverseCallDispatcher）
//!
//! 把一条双工消息流变成带存活检测的请求/响应 RPC：
//! - `receive_arguments`：读取首条连接消息，随后启动读取任务与心跳任务；
//! - `accept` / `reject`：回复连接响应，只能回复一次；
//! - `call`：发送请求并等待同 ID 的响应；
//! - `closed`：等待连接拆除并返回原因。
//!
//! 连接令牌是调用方生命周期令牌的子令牌；任何原因导致的拆除都会以失败完成全部在途调用。
//!
use crate::config::ReverseCallConfig;
use crate::error::{CloseReason, ReverseCallError, ReverseCallResult};
use crate::transport::MessageWriter;
use crate::wire::{
    ClientMessage, ClientToRuntimeMessage, ConnectContext, RequestContext, ReverseCallId,
    ReverseCallProtocol, RuntimeMessage, RuntimeToClientMessage,
};
use dashmap::DashMap;
use evflow_streams::execution_context::ExecutionContext;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// 客户端在连接消息中携带的内容
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectArguments<A> {
    pub execution_context: ExecutionContext,
    pub ping_interval: Duration,
    pub arguments: A,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    AwaitingArguments,
    AwaitingResponse,
    Accepted,
    Rejected,
}

type Inbound<P> = BoxStream<'static, ReverseCallResult<ClientMessage<P>>>;
type PendingCalls<P> =
    DashMap<ReverseCallId, oneshot::Sender<ReverseCallResult<<P as ReverseCallProtocol>::Response>>>;

struct Shared<P: ReverseCallProtocol> {
    writer: tokio::sync::Mutex<Box<dyn MessageWriter<RuntimeMessage<P>>>>,
    pending: PendingCalls<P>,
    connection: CancellationToken,
    close_reason: watch::Sender<Option<CloseReason>>,
    last_received: Mutex<Instant>,
}

pub struct ReverseCallDispatcher<P: ReverseCallProtocol> {
    shared: Arc<Shared<P>>,
    inbound: Mutex<Option<Inbound<P>>>,
    handshake: Mutex<Handshake>,
    config: ReverseCallConfig,
}

impl<P: ReverseCallProtocol> ReverseCallDispatcher<P> {
    pub fn new(
        inbound: Inbound<P>,
        outbound: Box<dyn MessageWriter<RuntimeMessage<P>>>,
        config: ReverseCallConfig,
        lifetime: &CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(outbound),
                pending: DashMap::new(),
                connection: lifetime.child_token(),
                close_reason: watch::channel(None).0,
                last_received: Mutex::new(Instant::now()),
            }),
            inbound: Mutex::new(Some(inbound)),
            handshake: Mutex::new(Handshake::AwaitingArguments),
            config,
        }
    }

    /// 读取首条消息作为连接参数；成功后启动读取与心跳任务
    pub async fn receive_arguments(&self) -> ReverseCallResult<ConnectArguments<P::Arguments>> {
        let mut inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ReverseCallError::AlreadyConnected)?;

        let first = tokio::select! {
            biased;
            _ = self.shared.connection.cancelled() => {
                self.shared.close(CloseReason::CallerCancelled);
                return Err(CloseReason::CallerCancelled.into());
            }
            first = tokio::time::timeout(self.config.connect_timeout, inbound.next()) => first,
        };

        let (context, arguments) = match first {
            Err(_) => {
                return Err(self.fail_handshake(ReverseCallError::handshake_missing(
                    "no connect message received before the connect timeout",
                )));
            }
            Ok(None) => {
                return Err(self.fail_handshake(ReverseCallError::handshake_missing(
                    "stream ended before the connect message",
                )));
            }
            Ok(Some(Err(err))) => return Err(self.fail_handshake(err)),
            Ok(Some(Ok(ClientToRuntimeMessage::Connect { context, arguments }))) => {
                (context, arguments)
            }
            Ok(Some(Ok(other))) => {
                return Err(self.fail_handshake(ReverseCallError::handshake_missing(format!(
                    "expected connect message, received {}",
                    other.kind()
                ))));
            }
        };

        let ConnectContext {
            execution_context,
            ping_interval,
        } = context;
        if ping_interval.is_zero() {
            return Err(self.fail_handshake(ReverseCallError::InvalidPingInterval));
        }

        *self.handshake.lock().unwrap_or_else(PoisonError::into_inner) =
            Handshake::AwaitingResponse;
        self.shared.touch();
        tokio::spawn(read_loop(self.shared.clone(), inbound));
        tokio::spawn(keepalive_loop(
            self.shared.clone(),
            ping_interval,
            self.config.keepalive_timeout(ping_interval),
        ));
        debug!(ping_interval = ?ping_interval, "reverse call connection established");

        Ok(ConnectArguments {
            execution_context,
            ping_interval,
            arguments,
        })
    }

    pub async fn accept(&self, response: P::ConnectResponse) -> ReverseCallResult<()> {
        self.respond(Handshake::Accepted)?;
        self.shared
            .write(RuntimeToClientMessage::ConnectResponse(response))
            .await
    }

    /// 回复拒绝后拆除连接
    pub async fn reject(&self, response: P::ConnectResponse) -> ReverseCallResult<()> {
        self.respond(Handshake::Rejected)?;
        let written = self
            .shared
            .write(RuntimeToClientMessage::ConnectResponse(response))
            .await;
        self.shared.close(CloseReason::CallerCancelled);
        written
    }

    /// 发送请求并等待对应响应；丢弃该 future 会移除在途记录
    pub async fn call(
        &self,
        request: P::Request,
        execution_context: &ExecutionContext,
    ) -> ReverseCallResult<P::Response> {
        if *self.handshake.lock().unwrap_or_else(PoisonError::into_inner) != Handshake::Accepted {
            return Err(ReverseCallError::NotAccepted);
        }

        let call_id = ReverseCallId::generate();
        let (reply, response) = oneshot::channel();
        self.shared.pending.insert(call_id, reply);
        let _pending = PendingCall {
            shared: &self.shared,
            call_id,
        };
        if let Some(reason) = self.shared.close_reason() {
            return Err(reason.into());
        }

        trace!(call_id = %call_id, "sending reverse call request");
        self.shared
            .write(RuntimeToClientMessage::Request {
                context: RequestContext {
                    call_id,
                    execution_context: execution_context.clone(),
                },
                request,
            })
            .await?;

        match response.await {
            Ok(result) => result,
            Err(_) => Err(self
                .shared
                .close_reason()
                .unwrap_or(CloseReason::CallerCancelled)
                .into()),
        }
    }

    /// 以调用方取消为原因拆除连接
    pub fn cancel(&self) {
        self.shared.close(CloseReason::CallerCancelled);
    }

    /// 等待连接拆除并返回原因
    pub async fn closed(&self) -> CloseReason {
        let mut receiver = self.shared.close_reason.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::CallerCancelled),
            Err(_) => CloseReason::CallerCancelled,
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close_reason().is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    fn respond(&self, outcome: Handshake) -> ReverseCallResult<()> {
        let mut handshake = self.handshake.lock().unwrap_or_else(PoisonError::into_inner);
        match *handshake {
            Handshake::AwaitingResponse => {
                *handshake = outcome;
                Ok(())
            }
            Handshake::Accepted | Handshake::Rejected => Err(ReverseCallError::AlreadyResponded),
            Handshake::AwaitingArguments => Err(ReverseCallError::handshake_missing(
                "connect arguments have not been received",
            )),
        }
    }

    fn fail_handshake(&self, err: ReverseCallError) -> ReverseCallError {
        warn!(error = %err, "reverse call handshake failed");
        self.shared
            .close(CloseReason::ProtocolViolation(err.to_string()));
        err
    }
}

impl<P: ReverseCallProtocol> Drop for ReverseCallDispatcher<P> {
    fn drop(&mut self) {
        self.shared.close(CloseReason::CallerCancelled);
    }
}

impl<P: ReverseCallProtocol> Shared<P> {
    fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.borrow().clone()
    }

    fn touch(&self) {
        *self
            .last_received
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_received(&self) -> Instant {
        *self
            .last_received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 首个关闭原因生效：取消连接令牌并以失败完成全部在途调用
    fn close(&self, reason: CloseReason) {
        let first = self.close_reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if !first {
            return;
        }

        if reason.is_anomaly() {
            warn!(reason = %reason, in_flight = self.pending.len(), "reverse call connection closed");
        } else {
            debug!(reason = %reason, "reverse call connection closed");
        }
        self.connection.cancel();

        let call_ids: Vec<ReverseCallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for call_id in call_ids {
            if let Some((_, reply)) = self.pending.remove(&call_id) {
                let _ = reply.send(Err(reason.clone().into()));
            }
        }
    }

    async fn write(&self, message: RuntimeMessage<P>) -> ReverseCallResult<()> {
        let mut writer = tokio::select! {
            biased;
            _ = self.connection.cancelled() => {
                return Err(self.close_reason().unwrap_or(CloseReason::CallerCancelled).into());
            }
            writer = self.writer.lock() => writer,
        };
        // 对端停止读取时写入可能一直阻塞，连接拆除必须能打断它
        let written = tokio::select! {
            biased;
            _ = self.connection.cancelled() => {
                return Err(self.close_reason().unwrap_or(CloseReason::CallerCancelled).into());
            }
            written = writer.write(message) => written,
        };
        if let Err(err) = written {
            drop(writer);
            self.close(CloseReason::Transport(err.to_string()));
            return Err(err);
        }
        Ok(())
    }

    fn complete(&self, call_id: ReverseCallId, response: P::Response) {
        match self.pending.remove(&call_id) {
            Some((_, reply)) => {
                let _ = reply.send(Ok(response));
            }
            None => warn!(call_id = %call_id, "discarding response for unknown or completed call"),
        }
    }
}

/// 在途调用的登记，随调用 future 一起释放
struct PendingCall<'a, P: ReverseCallProtocol> {
    shared: &'a Shared<P>,
    call_id: ReverseCallId,
}

impl<P: ReverseCallProtocol> Drop for PendingCall<'_, P> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.call_id);
    }
}

async fn read_loop<P: ReverseCallProtocol>(shared: Arc<Shared<P>>, mut inbound: Inbound<P>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.connection.cancelled() => {
                shared.close(CloseReason::CallerCancelled);
                return;
            }
            next = inbound.next() => next,
        };

        let message = match next {
            None => {
                shared.close(CloseReason::PeerClosed);
                return;
            }
            Some(Err(err)) => {
                shared.close(CloseReason::Transport(err.to_string()));
                return;
            }
            Some(Ok(message)) => message,
        };

        shared.touch();
        match message {
            ClientToRuntimeMessage::Pong => trace!("pong received"),
            ClientToRuntimeMessage::Response { context, response } => {
                shared.complete(context.call_id, response);
            }
            ClientToRuntimeMessage::InitiateDisconnect => {
                shared.close(CloseReason::PeerDisconnected);
                return;
            }
            ClientToRuntimeMessage::Connect { .. } => {
                shared.close(CloseReason::ProtocolViolation(
                    "connect message received on an established connection".into(),
                ));
                return;
            }
        }
    }
}

async fn keepalive_loop<P: ReverseCallProtocol>(
    shared: Arc<Shared<P>>,
    ping_interval: Duration,
    keepalive_timeout: Duration,
) {
    let mut next_ping = Instant::now() + ping_interval;
    loop {
        let deadline = shared.last_received() + keepalive_timeout;
        tokio::select! {
            biased;
            _ = shared.connection.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                if shared.last_received() + keepalive_timeout <= Instant::now() {
                    shared.close(CloseReason::KeepaliveTimedOut);
                    return;
                }
            }
            _ = tokio::time::sleep_until(next_ping) => {
                next_ping += ping_interval;
                // 写锁被应用写入占用时跳过本次 ping
                let Ok(mut writer) = shared.writer.try_lock() else {
                    trace!("writer busy, skipping ping");
                    continue;
                };
                // 写入阻塞时仍要按期检查存活截止时间
                let written = tokio::select! {
                    biased;
                    _ = shared.connection.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => None,
                    written = writer.write(RuntimeToClientMessage::Ping) => Some(written),
                };
                drop(writer);
                match written {
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        shared.close(CloseReason::Transport(err.to_string()));
                        return;
                    }
                    None => trace!("ping write stalled past the keepalive deadline"),
                }
            }
        }
    }
}
