/// 纯 HTTP 监听服务器
///
/// 核心只负责监听与启停，路由与处理函数由外部注入的 `axum::Router`
/// 承担（静态资源、鉴权中间件等都属于协作方，不在核心范围内）。
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;

#[derive(Debug, Clone, Default)]
pub struct HttpServerConfig {
    pub addr: String,
}

pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, router: Router) -> Self {
        HttpServer {
            config,
            router,
            shutdown: CancellationToken::new(),
            handle: None,
            local_addr: None,
        }
    }

    /// 实际绑定的监听地址，`start` 成功之后可用
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// 绑定监听地址并在后台任务中提供服务
    pub async fn start(&mut self) -> Result<(), NetError> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        tracing::info!("✅ http server listening on {}", listener.local_addr()?);

        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                tracing::error!("http server: {}", e);
            }
        }));
        Ok(())
    }

    /// 优雅停机：停止接受新请求并等待服务任务退出
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        tracing::info!("🛑 http server closed");
    }
}
