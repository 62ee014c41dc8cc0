/// WebSocket 连接
///
/// 一条 WebSocket 消息即一帧，不再做长度前缀分帧。握手后的流被
/// 拆成读写两半：读半归调用方驱动的 `read_msg`，写半归独立写任务。
/// 入站消息的尺寸上限在握手时通过 `WebSocketConfig` 设定。
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{Conn, Outbound};
use crate::error::NetError;

/// 握手后承载 WebSocket 的底层流（明文或 TLS）
pub(crate) trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

pub(crate) type WsStream = WebSocketStream<Box<dyn StreamIo>>;

pub struct WsConn {
    reader: tokio::sync::Mutex<SplitStream<WsStream>>,
    write_tx: mpsc::Sender<Outbound>,
    closed: parking_lot::Mutex<bool>,
    shutdown: CancellationToken,
    max_msg_len: u32,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl WsConn {
    pub(crate) fn new(
        stream: WsStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        pending_write_num: usize,
        max_msg_len: u32,
    ) -> Arc<Self> {
        let (sink, reader) = stream.split();
        let (write_tx, write_rx) = mpsc::channel(pending_write_num.max(1));
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::write_loop(sink, write_rx, shutdown.clone()));

        Arc::new(WsConn {
            reader: tokio::sync::Mutex::new(reader),
            write_tx,
            closed: parking_lot::Mutex::new(false),
            shutdown,
            max_msg_len,
            local_addr,
            peer_addr,
        })
    }

    async fn write_loop(
        mut sink: SplitSink<WsStream, Message>,
        mut write_rx: mpsc::Receiver<Outbound>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = write_rx.recv() => match item {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                            tracing::debug!("write message: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        // 优雅关闭时带上标准的 Close 帧
                        let _ = sink.close().await;
                        break;
                    }
                },
            }
        }
        shutdown.cancel();
    }

    fn do_destroy(&self, closed: &mut bool) {
        self.shutdown.cancel();
        *closed = true;
    }
}

#[async_trait]
impl Conn for WsConn {
    async fn read_msg(&self) -> Result<Bytes, NetError> {
        let mut reader = self.reader.lock().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(NetError::ConnClosed),
                msg = reader.next() => match msg {
                    None => return Err(NetError::ConnClosed),
                    Some(Err(e)) => return Err(NetError::Ws(e)),
                    Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                    Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text.into_bytes())),
                    Some(Ok(Message::Close(_))) => return Err(NetError::ConnClosed),
                    // ping / pong 由协议层处理
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn write_msg(&self, parts: &[Bytes]) -> Result<(), NetError> {
        let mut closed = self.closed.lock();
        if *closed {
            return Err(NetError::ConnClosed);
        }

        let msg_len: usize = parts.iter().map(|p| p.len()).sum();
        if msg_len > self.max_msg_len as usize {
            return Err(NetError::MsgTooLong {
                len: msg_len as u32,
                max: self.max_msg_len,
            });
        }
        if msg_len < 1 {
            return Err(NetError::MsgTooShort);
        }

        let frame = if parts.len() == 1 {
            parts[0].clone()
        } else {
            let mut merged = BytesMut::with_capacity(msg_len);
            for p in parts {
                merged.extend_from_slice(p);
            }
            merged.freeze()
        };

        match self.write_tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::debug!("close conn: channel full");
                self.do_destroy(&mut closed);
                Err(NetError::WriteQueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                *closed = true;
                Err(NetError::ConnClosed)
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn close(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        if self.write_tx.try_send(Outbound::Close).is_err() {
            self.do_destroy(&mut closed);
            return;
        }
        *closed = true;
    }

    fn destroy(&self) {
        let mut closed = self.closed.lock();
        self.do_destroy(&mut closed);
    }
}
