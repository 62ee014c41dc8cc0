/// modnet - 多模块网络服务的并发骨架
///
/// 三个紧耦合的子系统组成本框架的并发与消息引擎：
/// - ChanRPC：基于有界通道的模块间调用机制（同步 / 异步 / 发后即忘）；
/// - 模块生命周期：注册 / 初始化 / 运行 / 销毁，每个模块独占一个任务，
///   按注册顺序启动、严格逆序拆除；
/// - 连接 / Agent 框架：TCP 与 WebSocket 监听服务器，统一的整帧读写
///   契约和有界发送队列（满则甩掉慢客户端）。
///
/// `Gate` 把三者接在一起：网络事件经 ChanRPC 进入业务模块，
/// 业务回复经 Agent 写回连接。

// 并发与消息引擎
pub mod chanrpc;
pub mod module;
pub mod network;

// 组合层
pub mod gate;
pub mod session;

// 进程配置与错误类型
pub mod config;
pub mod error;

// 重新导出核心类型
pub use chanrpc::{Args, Callback, CallInfo, Client, RetInfo, RpcFn, Value};
pub use config::Config;
pub use error::{NetError, RpcError};
pub use gate::{Gate, GateAgent, CLOSE_AGENT, NEW_AGENT};
pub use module::{App, CloseSignal, Module};
pub use network::{
    Agent, Conn, FrameCodec, HttpServer, HttpServerConfig, NewTcpAgent, NewWsAgent, PrefixWidth,
    Processor, RawMessage, TcpConn, TcpServer, TcpServerConfig, WsConn, WsServer, WsServerConfig,
};
pub use session::{SessionLookup, UserData};

/// RPC 服务器的别名导出，避免与网络层的服务器类型混淆
pub use chanrpc::Server as RpcServer;
