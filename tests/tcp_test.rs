/// TCP 监听服务器端到端测试
///
/// 覆盖：分帧回显、连接数上限（拒绝与恢复）、发送队列饱和时的
/// 强制关闭（甩掉慢客户端）、服务器停机时的连接清理。
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use modnet::network::{Agent, Conn, NewTcpAgent, TcpConn, TcpServer, TcpServerConfig};
use modnet::{NetError, PrefixWidth};

fn test_config() -> TcpServerConfig {
    TcpServerConfig {
        addr: "127.0.0.1:0".to_string(),
        max_conn_num: 16,
        pending_write_num: 16,
        max_msg_len: 4096,
        len_msg_len: PrefixWidth::U16,
        little_endian: false,
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.unwrap();
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

struct EchoAgent {
    conn: Arc<TcpConn>,
}

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&mut self) {
        while let Ok(data) = self.conn.read_msg().await {
            if self.conn.write_msg(&[data]).is_err() {
                break;
            }
        }
    }

    async fn on_close(&mut self) {}
}

fn echo_factory() -> NewTcpAgent {
    Arc::new(|conn| Box::new(EchoAgent { conn }))
}

#[tokio::test]
async fn test_tcp_echo() {
    let mut server = TcpServer::new(test_config(), echo_factory());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, b"hello").await;
    assert_eq!(read_frame(&mut stream).await, b"hello");
    write_frame(&mut stream, b"world").await;
    assert_eq!(read_frame(&mut stream).await, b"world");

    timeout(Duration::from_secs(5), server.close())
        .await
        .expect("close must not hang");
}

#[tokio::test]
async fn test_tcp_conn_limit_rejects_then_recovers() {
    let mut config = test_config();
    config.max_conn_num = 1;
    let mut server = TcpServer::new(config, echo_factory());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut first, b"ping").await;
    assert_eq!(read_frame(&mut first).await, b"ping");

    // 已达上限：第二条连接被立即丢弃
    let mut second = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut second, b"ping").await;
    let mut buf = [0u8; 16];
    let closed = match timeout(Duration::from_secs(5), second.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        _ => false,
    };
    assert!(closed, "over-limit connection must be dropped");

    // 释放名额后重新放行
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut third = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut third, b"back").await;
    assert_eq!(read_frame(&mut third).await, b"back");

    server.close().await;
}

// 收到触发帧后持续灌写、从不让步，既验证饱和路径，
// 也验证饱和之后的写入再也不会成功
struct FloodAgent {
    conn: Arc<TcpConn>,
    outcome: Arc<Mutex<Option<(bool, bool)>>>,
}

#[async_trait]
impl Agent for FloodAgent {
    async fn run(&mut self) {
        let _ = self.conn.read_msg().await;

        let frame = Bytes::from(vec![7u8; 4000]);
        let mut saturated = false;
        for _ in 0..100_000 {
            match self.conn.write_msg(&[frame.clone()]) {
                Ok(()) => {}
                Err(NetError::WriteQueueFull) => {
                    saturated = true;
                    break;
                }
                Err(_) => break,
            }
        }
        let closed_after = matches!(
            self.conn.write_msg(&[frame.clone()]),
            Err(NetError::ConnClosed)
        );
        *self.outcome.lock() = Some((saturated, closed_after));
    }

    async fn on_close(&mut self) {}
}

#[tokio::test]
async fn test_write_queue_saturation_force_closes() {
    let outcome: Arc<Mutex<Option<(bool, bool)>>> = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    let factory: NewTcpAgent = Arc::new(move |conn| {
        Box::new(FloodAgent {
            conn,
            outcome: o.clone(),
        })
    });

    let mut config = test_config();
    config.pending_write_num = 8;
    let mut server = TcpServer::new(config, factory);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // 触发灌写，但从不读取回包
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, b"go").await;

    let saturated = timeout(Duration::from_secs(10), async {
        loop {
            if let Some(result) = *outcome.lock() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("flood must resolve");

    assert!(saturated.0, "write queue must saturate");
    assert!(saturated.1, "writes after saturation must fail closed");

    // 慢客户端被甩掉，服务器本身安然无恙
    let mut fresh = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut fresh, b"go").await;

    server.close().await;
}

#[tokio::test]
async fn test_server_close_tears_down_conns() {
    let mut server = TcpServer::new(test_config(), echo_factory());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, b"up").await;
    assert_eq!(read_frame(&mut stream).await, b"up");

    timeout(Duration::from_secs(5), server.close())
        .await
        .expect("close must not hang");

    // 连接被强制关闭
    let mut buf = [0u8; 16];
    let closed = match timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        _ => false,
    };
    assert!(closed, "tracked connection must be torn down on close");
}
