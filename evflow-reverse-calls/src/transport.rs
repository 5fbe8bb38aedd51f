//! 传输抽象
//!
//! 入站为消息流（传输错误以 `Err` 项出现），出站为 `MessageWriter`。
//! `in_process` 基于 mpsc 构造一对进程内端点，用于测试与示例。
//!
use crate::error::{ReverseCallError, ReverseCallResult};
use crate::wire::{ClientMessage, ReverseCallProtocol, RuntimeMessage};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[async_trait]
pub trait MessageWriter<M>: Send {
    async fn write(&mut self, message: M) -> ReverseCallResult<()>;
}

/// 基于有界 mpsc 的写入端
pub struct ChannelWriter<M> {
    sender: mpsc::Sender<M>,
}

impl<M> ChannelWriter<M> {
    pub fn new(sender: mpsc::Sender<M>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<M: Send + 'static> MessageWriter<M> for ChannelWriter<M> {
    async fn write(&mut self, message: M) -> ReverseCallResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ReverseCallError::transport("client stream receiver dropped"))
    }
}

/// 运行时一侧：读取客户端消息、写入运行时消息
pub struct RuntimeEnd<P: ReverseCallProtocol> {
    pub inbound: BoxStream<'static, ReverseCallResult<ClientMessage<P>>>,
    pub outbound: Box<dyn MessageWriter<RuntimeMessage<P>>>,
}

/// 客户端一侧
pub struct ClientEnd<P: ReverseCallProtocol> {
    pub sender: mpsc::Sender<ClientMessage<P>>,
    pub receiver: mpsc::Receiver<RuntimeMessage<P>>,
}

pub fn in_process<P: ReverseCallProtocol>(capacity: usize) -> (RuntimeEnd<P>, ClientEnd<P>) {
    let (client_tx, client_rx) = mpsc::channel(capacity.max(1));
    let (runtime_tx, runtime_rx) = mpsc::channel(capacity.max(1));
    let runtime = RuntimeEnd {
        inbound: Box::pin(ReceiverStream::new(client_rx).map(Ok)),
        outbound: Box::new(ChannelWriter::new(runtime_tx)),
    };
    let client = ClientEnd {
        sender: client_tx,
        receiver: runtime_rx,
    };
    (runtime, client)
}
