/// TCP 连接
///
/// 一条连接两个归属任务：调用方驱动的读路径（互斥保护的读缓冲，
/// 增量分帧）和独立的写任务（排空有界发送队列）。`TcpStream` 以
/// `Arc` 共享，读写分别走 readiness + try_read / try_write，销毁时
/// 可以随时对它设置 SO_LINGER(0) 立即丢弃未发送数据。
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{Conn, FrameCodec, Outbound};
use crate::error::NetError;

const READ_CHUNK: usize = 8 * 1024;

struct ReadState {
    buf: BytesMut,
}

pub struct TcpConn {
    stream: Arc<TcpStream>,
    reader: tokio::sync::Mutex<ReadState>,
    codec: FrameCodec,
    write_tx: mpsc::Sender<Outbound>,
    // 置位后不再接受任何写入；由锁保证关闭动作只发生一次
    closed: parking_lot::Mutex<bool>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpConn {
    pub(crate) fn new(
        stream: TcpStream,
        pending_write_num: usize,
        codec: FrameCodec,
    ) -> Result<Arc<Self>, NetError> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let stream = Arc::new(stream);
        let (write_tx, write_rx) = mpsc::channel(pending_write_num.max(1));
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::write_loop(
            stream.clone(),
            codec,
            write_rx,
            shutdown.clone(),
        ));

        Ok(Arc::new(TcpConn {
            stream,
            reader: tokio::sync::Mutex::new(ReadState {
                buf: BytesMut::with_capacity(READ_CHUNK),
            }),
            codec,
            write_tx,
            closed: parking_lot::Mutex::new(false),
            shutdown,
            local_addr,
            peer_addr,
        }))
    }

    async fn write_loop(
        stream: Arc<TcpStream>,
        codec: FrameCodec,
        mut write_rx: mpsc::Receiver<Outbound>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = write_rx.recv() => match item {
                    Some(Outbound::Frame(frame)) => {
                        let msg = match codec.encode(&frame) {
                            Ok(msg) => msg,
                            Err(e) => {
                                tracing::debug!("encode message: {}", e);
                                break;
                            }
                        };
                        if let Err(e) = write_all(&stream, &msg).await {
                            tracing::debug!("write message: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                },
            }
        }
        // 写循环退出即关闭连接，同时解除读路径的阻塞
        shutdown.cancel();
    }

    fn do_destroy(&self, closed: &mut bool) {
        let _ = self.stream.set_linger(Some(Duration::from_secs(0)));
        self.shutdown.cancel();
        *closed = true;
    }
}

async fn write_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[async_trait]
impl Conn for TcpConn {
    async fn read_msg(&self) -> Result<Bytes, NetError> {
        let mut state = self.reader.lock().await;
        loop {
            if let Some(frame) = self.codec.try_decode(&mut state.buf)? {
                return Ok(frame);
            }
            if state.buf.capacity() - state.buf.len() < 1024 {
                state.buf.reserve(READ_CHUNK);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(NetError::ConnClosed),
                ready = self.stream.readable() => {
                    ready?;
                    match self.stream.try_read_buf(&mut state.buf) {
                        Ok(0) => return Err(NetError::ConnClosed),
                        Ok(_) => {}
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    fn write_msg(&self, parts: &[Bytes]) -> Result<(), NetError> {
        let mut closed = self.closed.lock();
        if *closed {
            return Err(NetError::ConnClosed);
        }

        let msg_len: usize = parts.iter().map(|p| p.len()).sum();
        if msg_len > self.codec.max_msg_len() as usize {
            return Err(NetError::MsgTooLong {
                len: msg_len as u32,
                max: self.codec.max_msg_len(),
            });
        }
        if msg_len < 1 {
            return Err(NetError::MsgTooShort);
        }

        // 单片段不拷贝，多片段先拼成一帧
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
                // 甩掉慢客户端：与其让写方阻塞整条读取-分发链路，
                // 不如强制关掉这条连接
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
