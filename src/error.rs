/// 统一错误类型
///
/// ChanRPC 路径和网络路径各自有一套封闭的错误枚举，
/// 调用方错误原样返回给调用方，内部执行错误只会转成错误回复，绝不让进程崩溃。
use thiserror::Error;

/// ChanRPC 调用错误
///
/// 其中 `Callee` 表示被调函数内部 panic 后转换出来的错误回复。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// 调用了未注册的函数
    #[error("function id {0}: function not registered")]
    NotRegistered(String),

    /// 调用形态与注册形态不一致
    #[error("function id {0}: return type mismatch")]
    ArityMismatch(String),

    /// 调用队列已满（非阻塞路径）
    #[error("chanrpc channel full")]
    ChannelFull,

    /// 在途异步调用数量已达客户端容量
    #[error("too many calls")]
    TooManyCalls,

    /// RPC 服务器已关闭
    #[error("chanrpc server closed")]
    ServerClosed,

    /// 被调函数执行失败（panic 转换而来）
    #[error("{0}")]
    Callee(String),
}

/// 连接 / 监听器错误
///
/// 传输层错误只终结所属的那一条连接，对端断开属于正常流量，按低级别日志处理。
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 单帧长度超过配置上限
    #[error("message too long: {len} > {max}")]
    MsgTooLong { len: u32, max: u32 },

    /// 空帧
    #[error("message too short")]
    MsgTooShort,

    /// 连接已关闭（主动关闭或对端断开）
    #[error("connection closed")]
    ConnClosed,

    /// 发送队列已满，连接被强制关闭
    #[error("write queue full")]
    WriteQueueFull,

    /// 握手超时，放弃本次接入
    #[error("handshake timeout")]
    HandshakeTimeout,

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// 配置字段非法
    #[error("invalid config field '{field}': {reason}")]
    Config { field: String, reason: String },
}

impl NetError {
    /// 创建配置错误
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
