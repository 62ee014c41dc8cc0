/// Gate - 网络接入与业务模块之间的组合层
///
/// 在一份配置下组合 TCP / WebSocket / HTTP 监听服务器，注入统一的
/// Agent 工厂。Gate 从不窥探应用消息内容：原始帧一律交给注入的
/// `Processor`，连接的生死则以 ChanRPC 通知应用方的 RPC 服务器
/// （建立时异步 `NewAgent`，关闭时同步 `CloseAgent`）。
use std::any::Any;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::chanrpc;
use crate::module::{CloseSignal, Module};
use crate::network::{
    Agent, Conn, HttpServer, HttpServerConfig, NewTcpAgent, NewWsAgent, PrefixWidth, Processor,
    TcpConn, TcpServer, TcpServerConfig, WsConn, WsServer, WsServerConfig,
};
use crate::session::{SessionLookup, UserData};

/// 连接建立时发给应用 RPC 服务器的异步通知
pub const NEW_AGENT: &str = "NewAgent";
/// 连接关闭时发给应用 RPC 服务器的同步调用
pub const CLOSE_AGENT: &str = "CloseAgent";

/// 网关模块
///
/// 留空的监听地址表示不启动对应的服务器。作为 `Module` 注册进
/// `App` 后，`run` 负责启动全部监听器并在收到关闭信号时停掉它们。
#[derive(Default)]
pub struct Gate {
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub max_msg_len: u32,
    pub processor: Option<Arc<dyn Processor>>,
    pub agent_rpc: Option<Arc<chanrpc::Server>>,

    // websocket
    pub ws_addr: Option<String>,
    pub http_timeout: Duration,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub session_lookup: Option<Arc<dyn SessionLookup>>,

    // tcp
    pub tcp_addr: Option<String>,
    pub len_msg_len: PrefixWidth,
    pub little_endian: bool,

    // http
    pub http_addr: Option<String>,
    pub router: Option<axum::Router>,
}

impl Gate {
    fn tcp_factory(&self) -> NewTcpAgent {
        let processor = self.processor.clone();
        let agent_rpc = self.agent_rpc.clone();
        Arc::new(move |conn: Arc<TcpConn>| {
            new_gate_agent(conn, processor.clone(), agent_rpc.clone())
        })
    }

    fn ws_factory(&self) -> NewWsAgent {
        let processor = self.processor.clone();
        let agent_rpc = self.agent_rpc.clone();
        Arc::new(move |conn: Arc<WsConn>| {
            new_gate_agent(conn, processor.clone(), agent_rpc.clone())
        })
    }
}

fn new_gate_agent(
    conn: Arc<dyn Conn>,
    processor: Option<Arc<dyn Processor>>,
    agent_rpc: Option<Arc<chanrpc::Server>>,
) -> Box<dyn Agent> {
    let agent = GateAgent::new(conn, processor, agent_rpc.clone());
    if let Some(rpc) = &agent_rpc {
        rpc.go(NEW_AGENT, vec![Box::new(agent.clone())]);
        tracing::debug!("new agent: {}", agent.remote_addr());
    }
    Box::new(agent)
}

#[async_trait]
impl Module for Gate {
    async fn run(&mut self, mut close_sig: CloseSignal) {
        let mut ws_server = match &self.ws_addr {
            Some(addr) => {
                let config = WsServerConfig {
                    addr: addr.clone(),
                    max_conn_num: self.max_conn_num,
                    pending_write_num: self.pending_write_num,
                    max_msg_len: self.max_msg_len,
                    http_timeout: self.http_timeout,
                    cert_file: self.cert_file.clone(),
                    key_file: self.key_file.clone(),
                };
                let mut server = WsServer::new(config, self.ws_factory());
                if let Some(lookup) = &self.session_lookup {
                    server = server.with_session_lookup(lookup.clone());
                }
                Some(server)
            }
            None => None,
        };

        let mut tcp_server = self.tcp_addr.as_ref().map(|addr| {
            let config = TcpServerConfig {
                addr: addr.clone(),
                max_conn_num: self.max_conn_num,
                pending_write_num: self.pending_write_num,
                max_msg_len: self.max_msg_len,
                len_msg_len: self.len_msg_len,
                little_endian: self.little_endian,
            };
            TcpServer::new(config, self.tcp_factory())
        });

        let mut http_server = match (&self.http_addr, &self.router) {
            (Some(addr), Some(router)) => Some(HttpServer::new(
                HttpServerConfig { addr: addr.clone() },
                router.clone(),
            )),
            _ => None,
        };

        let up = async {
            if let Some(server) = &mut ws_server {
                server.start().await?;
            }
            if let Some(server) = &mut tcp_server {
                server.start().await?;
            }
            if let Some(server) = &mut http_server {
                server.start().await?;
            }
            Ok::<_, crate::error::NetError>(())
        }
        .await;

        // 任何一个监听器起不来都整体停掉，已启动的也一并收回
        match up {
            Ok(()) => close_sig.recv().await,
            Err(e) => tracing::error!("start gate listener: {}", e),
        }

        if let Some(server) = &mut ws_server {
            server.close().await;
        }
        if let Some(server) = &mut tcp_server {
            server.close().await;
        }
        if let Some(server) = &mut http_server {
            server.close().await;
        }
    }
}

struct GateAgentInner {
    conn: Arc<dyn Conn>,
    processor: Option<Arc<dyn Processor>>,
    agent_rpc: Option<Arc<chanrpc::Server>>,
    user_data: RwLock<Option<UserData>>,
}

/// 每连接的网关代理，可以被业务模块廉价克隆、长期持有
///
/// `NewAgent` / `CloseAgent` 通知携带的就是它（以 `Value` 形式，
/// 业务方向下转型回 `GateAgent`）。
#[derive(Clone)]
pub struct GateAgent {
    inner: Arc<GateAgentInner>,
}

impl GateAgent {
    fn new(
        conn: Arc<dyn Conn>,
        processor: Option<Arc<dyn Processor>>,
        agent_rpc: Option<Arc<chanrpc::Server>>,
    ) -> Self {
        GateAgent {
            inner: Arc::new(GateAgentInner {
                conn,
                processor,
                agent_rpc,
                user_data: RwLock::new(None),
            }),
        }
    }

    /// 经处理器编码后发送一条应用消息，失败只记日志
    pub fn write_msg(&self, msg: &(dyn Any + Send)) {
        let Some(processor) = &self.inner.processor else {
            return;
        };
        match processor.marshal(msg) {
            Ok(frames) => {
                if let Err(e) = self.inner.conn.write_msg(&frames) {
                    tracing::error!("write message error: {}", e);
                }
            }
            Err(e) => tracing::error!("marshal message error: {}", e),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.conn.remote_addr()
    }

    pub fn close(&self) {
        self.inner.conn.close();
    }

    pub fn destroy(&self) {
        self.inner.conn.destroy();
    }

    /// 取用户数据；过期即视为不存在
    pub fn user_data(&self) -> Option<UserData> {
        let user_data = self.inner.user_data.read().clone()?;
        if user_data.is_expired() {
            tracing::info!("user data of user {} is expired", user_data.user_id);
            return None;
        }
        Some(user_data)
    }

    pub fn set_user_data(&self, data: UserData) {
        *self.inner.user_data.write() = Some(data);
    }
}

#[async_trait]
impl Agent for GateAgent {
    fn on_init(&mut self, user_data: Option<UserData>) {
        if let Some(user_data) = user_data {
            tracing::debug!("user data set: user {}", user_data.user_id);
            self.set_user_data(user_data);
        }
    }

    async fn run(&mut self) {
        loop {
            let data = match self.inner.conn.read_msg().await {
                Ok(data) => data,
                Err(e) => {
                    tracing::debug!("read message: {}", e);
                    break;
                }
            };

            let Some(processor) = &self.inner.processor else {
                continue;
            };
            let msg = match processor.unmarshal(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("unmarshal message error: {}", e);
                    break;
                }
            };
            if let Err(e) = processor.route(msg, Box::new(self.clone())) {
                tracing::debug!("route message error: {}", e);
                break;
            }
        }
    }

    async fn on_close(&mut self) {
        if let Some(rpc) = &self.inner.agent_rpc {
            if let Err(e) = rpc.call0(CLOSE_AGENT, vec![Box::new(self.clone())]).await {
                tracing::error!("chanrpc error: {}", e);
            }
        }
    }
}
