/// WebSocket 监听服务器
///
/// 接入一条连接要过三道门：可选的 TLS 握手、WebSocket 升级握手
/// （两者合计受握手超时约束）、连接数上限。升级请求里携带的
/// `token` cookie 会经注入的 `SessionLookup` 换成用户数据，在读循环
/// 开始前通过 `Agent::on_init` 下发。
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::tls::load_tls_config;
use super::ws_conn::{StreamIo, WsConn};
use super::{Conn, NewWsAgent};
use crate::error::NetError;
use crate::session::SessionLookup;

#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub addr: String,
    /// 最大并发连接数
    pub max_conn_num: usize,
    /// 每连接发送队列容量
    pub pending_write_num: usize,
    /// 单条消息最大长度
    pub max_msg_len: u32,
    /// TLS + WebSocket 握手超时
    pub http_timeout: Duration,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        WsServerConfig {
            addr: String::new(),
            max_conn_num: 0,
            pending_write_num: 0,
            max_msg_len: 0,
            http_timeout: Duration::from_secs(0),
            cert_file: None,
            key_file: None,
        }
    }
}

impl WsServerConfig {
    pub(crate) fn normalize(&mut self) {
        if self.max_conn_num == 0 {
            self.max_conn_num = 100;
            tracing::warn!("invalid max_conn_num, reset to {}", self.max_conn_num);
        }
        if self.pending_write_num == 0 {
            self.pending_write_num = 100;
            tracing::warn!("invalid pending_write_num, reset to {}", self.pending_write_num);
        }
        if self.max_msg_len == 0 {
            self.max_msg_len = 4096;
            tracing::warn!("invalid max_msg_len, reset to {}", self.max_msg_len);
        }
        if self.http_timeout.is_zero() {
            self.http_timeout = Duration::from_secs(10);
            tracing::warn!("invalid http_timeout, reset to {:?}", self.http_timeout);
        }
    }
}

pub struct WsServer {
    config: WsServerConfig,
    new_agent: NewWsAgent,
    session_lookup: Option<Arc<dyn SessionLookup>>,
    conns: Arc<Mutex<Slab<Arc<WsConn>>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_handle: Option<JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

impl WsServer {
    pub fn new(config: WsServerConfig, new_agent: NewWsAgent) -> Self {
        WsServer {
            config,
            new_agent,
            session_lookup: None,
            conns: Arc::new(Mutex::new(Slab::new())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            accept_handle: None,
            local_addr: None,
        }
    }

    /// 实际绑定的监听地址，`start` 成功之后可用
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// 注入会话令牌查询，用于把握手 cookie 换成用户数据
    pub fn with_session_lookup(mut self, lookup: Arc<dyn SessionLookup>) -> Self {
        self.session_lookup = Some(lookup);
        self
    }

    /// 绑定监听地址并启动接入循环
    pub async fn start(&mut self) -> Result<(), NetError> {
        self.config.normalize();

        let acceptor = match (&self.config.cert_file, &self.config.key_file) {
            (Some(cert), Some(key)) => {
                let tls_config = load_tls_config(cert, key)?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            (None, None) => None,
            _ => {
                return Err(NetError::config(
                    "cert_file/key_file",
                    "certificate and key must be configured together",
                ));
            }
        };

        let listener = TcpListener::bind(&self.config.addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        tracing::info!("✅ ws server listening on {}", listener.local_addr()?);

        self.accept_handle = Some(tokio::spawn(Self::accept_loop(
            listener,
            acceptor,
            self.config.clone(),
            self.new_agent.clone(),
            self.session_lookup.clone(),
            self.conns.clone(),
            self.shutdown.clone(),
            self.tracker.clone(),
        )));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_loop(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        config: WsServerConfig,
        new_agent: NewWsAgent,
        session_lookup: Option<Arc<dyn SessionLookup>>,
        conns: Arc<Mutex<Slab<Arc<WsConn>>>>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("accept error: {}", e);
                            continue;
                        }
                    };
                    tracker.spawn(Self::handle_conn(
                        stream,
                        acceptor.clone(),
                        config.clone(),
                        new_agent.clone(),
                        session_lookup.clone(),
                        conns.clone(),
                        shutdown.clone(),
                    ));
                }
            }
        }
    }

    async fn handle_conn(
        stream: TcpStream,
        acceptor: Option<TlsAcceptor>,
        config: WsServerConfig,
        new_agent: NewWsAgent,
        session_lookup: Option<Arc<dyn SessionLookup>>,
        conns: Arc<Mutex<Slab<Arc<WsConn>>>>,
        shutdown: CancellationToken,
    ) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!("local addr: {}", e);
                return;
            }
        };
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!("peer addr: {}", e);
                return;
            }
        };

        // TLS + WebSocket 握手整体受超时约束
        let handshake = tokio::time::timeout(config.http_timeout, async {
            let stream: Box<dyn StreamIo> = match &acceptor {
                Some(acceptor) => Box::new(acceptor.accept(stream).await?),
                None => Box::new(stream),
            };

            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(config.max_msg_len as usize);

            let mut token_cookie: Option<String> = None;
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                token_cookie = extract_token_cookie(req);
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                callback,
                Some(ws_config),
            )
            .await?;
            Ok::<_, NetError>((ws, token_cookie))
        })
        .await;

        let handshake = match handshake {
            Ok(result) => result,
            Err(_) => Err(NetError::HandshakeTimeout),
        };
        let (ws, token_cookie) = match handshake {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("upgrade error from {}: {}", peer_addr, e);
                return;
            }
        };

        // 握手 cookie 换用户数据；查询失败不拦连接
        let user_data = match (&token_cookie, &session_lookup) {
            (Some(token), Some(lookup)) => match lookup.resolve(token).await {
                Ok(user_data) => user_data,
                Err(e) => {
                    tracing::error!("check cookies error: {}", e);
                    None
                }
            },
            _ => None,
        };

        let (key, conn) = {
            let mut conns = conns.lock();
            // close 先取消再排空连接集，在锁内检查保证不会漏掉新插入的连接
            if shutdown.is_cancelled() {
                return;
            }
            if conns.len() >= config.max_conn_num {
                tracing::debug!("too many connections, drop {}", peer_addr);
                return;
            }
            let conn = WsConn::new(
                ws,
                local_addr,
                peer_addr,
                config.pending_write_num,
                config.max_msg_len,
            );
            let key = conns.insert(conn.clone());
            (key, conn)
        };

        let mut agent = (new_agent)(conn.clone());
        agent.on_init(user_data);
        agent.run().await;

        // cleanup
        conn.close();
        conns.lock().try_remove(key);
        agent.on_close().await;
    }

    /// 停止接入、强制关闭全部连接，并等待所有连接任务收尾完成
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.await;
        }

        let conns: Vec<_> = {
            let mut set = self.conns.lock();
            set.drain().collect()
        };
        for conn in conns {
            conn.destroy();
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("🛑 ws server closed");
    }
}

// 从升级请求的 Cookie 头里取出会话令牌
fn extract_token_cookie(req: &Request) -> Option<String> {
    for header in req.headers().get_all("cookie") {
        let Ok(value) = header.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, token)) = pair.trim().split_once('=') {
                if name.trim() == "token" {
                    return Some(token.trim().to_string());
                }
            }
        }
    }
    None
}
