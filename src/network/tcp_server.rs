/// TCP 监听服务器
///
/// 接入循环在独立任务中运行；每个被接受的连接占用一个跟踪任务，
/// 依次执行 Agent 的读循环与收尾。连接集合是唯一被多任务并发
/// 修改的结构，用互斥锁保护。
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slab::Slab;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{Conn, FrameCodec, NewTcpAgent, PrefixWidth, TcpConn};
use crate::error::NetError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpServerConfig {
    pub addr: String,
    /// 最大并发连接数
    pub max_conn_num: usize,
    /// 每连接发送队列容量
    pub pending_write_num: usize,
    /// 单帧最大长度
    pub max_msg_len: u32,
    /// 长度前缀宽度
    pub len_msg_len: PrefixWidth,
    /// 长度前缀是否小端
    pub little_endian: bool,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        TcpServerConfig {
            addr: String::new(),
            max_conn_num: 0,
            pending_write_num: 0,
            max_msg_len: 0,
            len_msg_len: PrefixWidth::default(),
            little_endian: false,
        }
    }
}

impl TcpServerConfig {
    // 未设置的限额回退到默认值并留下日志
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
    }
}

pub struct TcpServer {
    config: TcpServerConfig,
    new_agent: NewTcpAgent,
    conns: Arc<Mutex<Slab<Arc<TcpConn>>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_handle: Option<JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

impl TcpServer {
    /// Agent 工厂是必填项，它是连接层通往应用层的唯一扩展点
    pub fn new(config: TcpServerConfig, new_agent: NewTcpAgent) -> Self {
        TcpServer {
            config,
            new_agent,
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

    /// 绑定监听地址并启动接入循环
    pub async fn start(&mut self) -> Result<(), NetError> {
        self.config.normalize();
        let listener = TcpListener::bind(&self.config.addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        tracing::info!("✅ tcp server listening on {}", listener.local_addr()?);

        self.accept_handle = Some(tokio::spawn(Self::accept_loop(
            listener,
            self.config.clone(),
            self.new_agent.clone(),
            self.conns.clone(),
            self.shutdown.clone(),
            self.tracker.clone(),
        )));
        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        config: TcpServerConfig,
        new_agent: NewTcpAgent,
        conns: Arc<Mutex<Slab<Arc<TcpConn>>>>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) {
        let codec = FrameCodec::new(config.len_msg_len, config.little_endian, config.max_msg_len);
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

                    let entry = {
                        let mut conns = conns.lock();
                        if conns.len() >= config.max_conn_num {
                            tracing::debug!("too many connections, drop {}", peer_addr);
                            continue;
                        }
                        match TcpConn::new(stream, config.pending_write_num, codec) {
                            Ok(conn) => {
                                let key = conns.insert(conn.clone());
                                (key, conn)
                            }
                            Err(e) => {
                                tracing::debug!("init conn {}: {}", peer_addr, e);
                                continue;
                            }
                        }
                    };

                    let (key, conn) = entry;
                    let mut agent = (new_agent)(conn.clone());
                    let conns = conns.clone();
                    tracker.spawn(async move {
                        agent.on_init(None);
                        agent.run().await;

                        // cleanup
                        conn.close();
                        conns.lock().try_remove(key);
                        agent.on_close().await;
                    });
                }
            }
        }
    }

    /// 停止接入、强制关闭全部连接，并等待所有连接任务收尾完成
    ///
    /// 返回后不再有任何属于本服务器的连接任务存活。
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
        tracing::info!("🛑 tcp server closed");
    }
}
