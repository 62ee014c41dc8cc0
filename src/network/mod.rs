/// 连接 / 监听器框架
///
/// TCP 与 WebSocket 两种连接实现同一个 `Conn` 契约：阻塞式整帧读、
/// 经有界队列的异步写、显式的优雅关闭与强制销毁。监听服务器负责
/// 接入、限流和生命周期，通过注入的 Agent 工厂与应用层解耦。
pub mod frame;
pub mod http_server;
pub mod processor;
pub mod tcp_conn;
pub mod tcp_server;
mod tls;
pub mod ws_conn;
pub mod ws_server;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetError;
use crate::session::UserData;

pub use frame::{FrameCodec, PrefixWidth};
pub use http_server::{HttpServer, HttpServerConfig};
pub use processor::{Processor, RawMessage};
pub use tcp_conn::TcpConn;
pub use tcp_server::{TcpServer, TcpServerConfig};
pub use ws_conn::WsConn;
pub use ws_server::{WsServer, WsServerConfig};

/// 写队列中的一项
pub(crate) enum Outbound {
    Frame(Bytes),
    // 优雅关闭哨兵：写完它之前的帧后关闭连接
    Close,
}

/// 连接契约
///
/// 读路径只允许单一执行上下文使用；写路径并发安全，写入只是入队，
/// 真正的网络写由连接自己的写任务完成。
#[async_trait]
pub trait Conn: Send + Sync {
    /// 阻塞读取一个完整帧；对端断开或协议违例时返回错误
    async fn read_msg(&self) -> Result<Bytes, NetError>;

    /// 把一个或多个片段拼成一帧入队发送
    ///
    /// 队列已满视为该连接的致命条件：连接被强制关闭而不是让写方阻塞。
    fn write_msg(&self, parts: &[Bytes]) -> Result<(), NetError>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// 优雅关闭：已入队的帧发完后断开
    fn close(&self);

    /// 强制销毁：丢弃未发送数据立即断开，可重复调用
    fn destroy(&self);
}

/// 每连接的应用侧代理
///
/// 由注入的工厂创建，这是连接层与应用层之间唯一的扩展点。
#[async_trait]
pub trait Agent: Send {
    /// 连接建立后、读循环开始前调用一次；WebSocket 路径会带上
    /// 由会话 cookie 解析出来的用户数据，TCP 路径总是 `None`
    fn on_init(&mut self, _user_data: Option<UserData>) {}

    /// 读取-分发循环，在连接的整个生命周期内独占一个任务
    async fn run(&mut self);

    /// 读循环退出、连接移除之后调用一次
    async fn on_close(&mut self);
}

/// TCP 连接的 Agent 工厂
pub type NewTcpAgent = Arc<dyn Fn(Arc<TcpConn>) -> Box<dyn Agent> + Send + Sync>;

/// WebSocket 连接的 Agent 工厂
pub type NewWsAgent = Arc<dyn Fn(Arc<WsConn>) -> Box<dyn Agent> + Send + Sync>;
