/// ChanRPC - 基于通道的模块间调用机制
///
/// 一个 `Server` 由唯一一个执行上下文驱动：该上下文不断从调用队列取出
/// `CallInfo` 并交给 `Server::exec` 执行。其它上下文通过 `Client`（或
/// `Server` 上的便捷方法）发起阻塞调用、非阻塞调用或带回调的异步调用。
///
/// 所有队列都是有界的，背压表现为三种可见形态：
/// - 同步调用在队列满时阻塞（有意为之）；
/// - `go` 在队列满时静默丢弃（尽力投递）；
/// - 异步调用在超出容量时立刻通过回调收到错误（调用方可观察）。
///
/// 典型的模块接收循环：
///
/// ```ignore
/// loop {
///     tokio::select! {
///         _ = close_sig.recv() => break,
///         Some(ci) = server.recv() => server.exec(ci),
///         Some(ri) = client.recv_ret() => client.cb(ri),
///     }
/// }
/// ```
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

/// 调用参数 / 返回值的统一表示
pub type Value = Box<dyn Any + Send>;

/// 位置参数列表
pub type Args = Vec<Value>;

/// 默认的 panic 栈回溯截断长度
const DEFAULT_LEN_STACK_BUF: usize = 4096;

/// 注册函数的封闭形态
///
/// 三种形态在注册时即定型，调用时按形态匹配，形态不符只会得到
/// `RpcError::ArityMismatch`，不存在运行期的"未知形态"。
pub enum RpcFn {
    /// 无返回值
    NoReturn(Box<dyn Fn(Args) + Send + Sync>),
    /// 单个返回值
    SingleReturn(Box<dyn Fn(Args) -> Value + Send + Sync>),
    /// 多个返回值
    MultiReturn(Box<dyn Fn(Args) -> Args + Send + Sync>),
}

impl RpcFn {
    fn kind(&self) -> RetKind {
        match self {
            RpcFn::NoReturn(_) => RetKind::None,
            RpcFn::SingleReturn(_) => RetKind::Single,
            RpcFn::MultiReturn(_) => RetKind::Multi,
        }
    }
}

/// 异步调用回调的封闭形态，和 `RpcFn` 一一对应
pub enum Callback {
    /// 只接收错误
    NoRet(Box<dyn FnOnce(Result<(), RpcError>) + Send>),
    /// 接收单个返回值
    OneRet(Box<dyn FnOnce(Result<Value, RpcError>) + Send>),
    /// 接收多个返回值
    MultiRet(Box<dyn FnOnce(Result<Args, RpcError>) + Send>),
}

impl Callback {
    fn kind(&self) -> RetKind {
        match self {
            Callback::NoRet(_) => RetKind::None,
            Callback::OneRet(_) => RetKind::Single,
            Callback::MultiRet(_) => RetKind::Multi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetKind {
    None,
    Single,
    Multi,
}

/// 一次待执行的调用
pub struct CallInfo {
    f: Arc<RpcFn>,
    args: Args,
    // 同步调用走容量 1 的回复通道，异步调用走客户端的异步回复通道，
    // go 调用为 None
    chan_ret: Option<mpsc::Sender<RetInfo>>,
    cb: Option<Callback>,
}

/// 返回值的三种形态
pub enum Ret {
    None,
    Single(Value),
    Multi(Args),
}

/// 一次已完成的调用结果
pub struct RetInfo {
    ret: Ret,
    err: Option<RpcError>,
    cb: Option<Callback>,
}

/// RPC 服务器
///
/// 注册阶段持有 `&mut Server`，之后包进 `Arc` 供客户端挂接；
/// 借用规则保证了"注册完成之后队列才对调用方开放"。
pub struct Server {
    functions: HashMap<String, Arc<RpcFn>>,
    chan_call_tx: mpsc::Sender<CallInfo>,
    chan_call_rx: tokio::sync::Mutex<mpsc::Receiver<CallInfo>>,
    // 关闭信号：让正阻塞在 recv 里的拥有方尽快让出接收端
    closing: CancellationToken,
    len_stack_buf: usize,
}

impl Server {
    /// 创建调用队列容量为 `l` 的服务器（容量至少为 1）
    pub fn new(l: usize) -> Self {
        let (tx, rx) = mpsc::channel(l.max(1));
        Server {
            functions: HashMap::new(),
            chan_call_tx: tx,
            chan_call_rx: tokio::sync::Mutex::new(rx),
            closing: CancellationToken::new(),
            len_stack_buf: DEFAULT_LEN_STACK_BUF,
        }
    }

    /// 设置 panic 栈回溯的截断长度，0 表示不采集
    pub fn set_len_stack_buf(&mut self, len: usize) {
        self.len_stack_buf = len;
    }

    /// 注册一个函数，必须在任何调用发起之前完成
    ///
    /// 重复注册同一个 id 属于致命的配置错误，直接 panic。
    pub fn register(&mut self, id: impl Into<String>, f: RpcFn) {
        let id = id.into();
        if self.functions.contains_key(&id) {
            panic!("function id {}: already registered", id);
        }
        self.functions.insert(id, Arc::new(f));
    }

    /// 注册无返回值函数
    pub fn register_no_ret(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(Args) + Send + Sync + 'static,
    ) {
        self.register(id, RpcFn::NoReturn(Box::new(f)));
    }

    /// 注册单返回值函数
    pub fn register_one_ret(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(Args) -> Value + Send + Sync + 'static,
    ) {
        self.register(id, RpcFn::SingleReturn(Box::new(f)));
    }

    /// 注册多返回值函数
    pub fn register_multi_ret(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(Args) -> Args + Send + Sync + 'static,
    ) {
        self.register(id, RpcFn::MultiReturn(Box::new(f)));
    }

    fn lookup(&self, id: &str, kind: RetKind) -> Result<Arc<RpcFn>, RpcError> {
        let f = self
            .functions
            .get(id)
            .ok_or_else(|| RpcError::NotRegistered(id.to_string()))?;
        if f.kind() != kind {
            return Err(RpcError::ArityMismatch(id.to_string()));
        }
        Ok(f.clone())
    }

    /// 取出下一个待执行的调用；服务器关闭后返回 `None`
    ///
    /// 只应由拥有该服务器的那个执行上下文调用。收到关闭信号时立即
    /// 让出接收端，队列里剩下的调用交给 `close` 统一排空。
    pub async fn recv(&self) -> Option<CallInfo> {
        let mut rx = self.chan_call_rx.lock().await;
        tokio::select! {
            _ = self.closing.cancelled() => None,
            ci = rx.recv() => ci,
        }
    }

    /// 执行一个调用并把结果写回调用方的回复通道
    ///
    /// 被调函数 panic 会被就地捕获并转换成错误回复，绝不影响接收循环。
    pub fn exec(&self, ci: CallInfo) {
        let CallInfo {
            f,
            args,
            chan_ret,
            cb,
        } = ci;

        let result = catch_unwind(AssertUnwindSafe(|| match &*f {
            RpcFn::NoReturn(f) => {
                f(args);
                Ret::None
            }
            RpcFn::SingleReturn(f) => Ret::Single(f(args)),
            RpcFn::MultiReturn(f) => Ret::Multi(f(args)),
        }));

        let ri = match result {
            Ok(ret) => RetInfo { ret, err: None, cb },
            Err(payload) => {
                let msg = panic_message(&payload);
                log_panic(&msg, self.len_stack_buf);
                RetInfo {
                    ret: Ret::None,
                    err: Some(RpcError::Callee(msg)),
                    cb,
                }
            }
        };
        Self::ret(chan_ret, ri);
    }

    // 调用方可能已经放弃了自己的回复通道，写失败只记日志
    fn ret(chan_ret: Option<mpsc::Sender<RetInfo>>, ri: RetInfo) {
        let Some(tx) = chan_ret else { return };
        if let Err(e) = tx.try_send(ri) {
            tracing::debug!("drop rpc reply: {}", e);
        }
    }

    /// 发后即忘调用：未注册的 id 或已满的队列都静默丢弃，永不阻塞
    pub fn go(&self, id: &str, args: Args) {
        let Some(f) = self.functions.get(id) else {
            return;
        };
        let _ = self.chan_call_tx.try_send(CallInfo {
            f: f.clone(),
            args,
            chan_ret: None,
            cb: None,
        });
    }

    /// 同步调用（无返回值），使用一次性回复通道
    pub async fn call0(&self, id: &str, args: Args) -> Result<(), RpcError> {
        let ri = self.call(id, RetKind::None, args).await?;
        match ri.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 同步调用（单返回值）
    pub async fn call1(&self, id: &str, args: Args) -> Result<Value, RpcError> {
        let ri = self.call(id, RetKind::Single, args).await?;
        ret_single(ri)
    }

    /// 同步调用（多返回值）
    pub async fn calln(&self, id: &str, args: Args) -> Result<Args, RpcError> {
        let ri = self.call(id, RetKind::Multi, args).await?;
        ret_multi(ri)
    }

    async fn call(&self, id: &str, kind: RetKind, args: Args) -> Result<RetInfo, RpcError> {
        let f = self.lookup(id, kind)?;
        let (tx, mut rx) = mpsc::channel(1);
        self.chan_call_tx
            .send(CallInfo {
                f,
                args,
                chan_ret: Some(tx),
                cb: None,
            })
            .await
            .map_err(|_| RpcError::ServerClosed)?;
        rx.recv().await.ok_or(RpcError::ServerClosed)
    }

    /// 挂接一个异步回复通道容量为 `l` 的客户端
    ///
    /// 服务器需要先共享进 `Arc`，调用方克隆一份交给客户端持有。
    pub fn open(self: Arc<Self>, l: usize) -> Client {
        Client::new(self, l)
    }

    /// 关闭调用队列并排空：每个仍在排队的调用都会收到"服务器已关闭"错误，
    /// 不会有调用方被永远阻塞
    pub async fn close(&self) {
        self.closing.cancel();
        let mut rx = self.chan_call_rx.lock().await;
        rx.close();
        while let Some(ci) = rx.recv().await {
            let CallInfo { chan_ret, cb, .. } = ci;
            Self::ret(
                chan_ret,
                RetInfo {
                    ret: Ret::None,
                    err: Some(RpcError::ServerClosed),
                    cb,
                },
            );
        }
    }
}

/// RPC 客户端
///
/// 一个客户端只挂接一个服务器；一个服务器可以被任意多个客户端挂接。
/// 客户端本身不是并发安全的，应当由单一执行上下文持有。
pub struct Client {
    server: Arc<Server>,
    sync_ret_tx: mpsc::Sender<RetInfo>,
    sync_ret_rx: mpsc::Receiver<RetInfo>,
    asyn_ret_tx: mpsc::Sender<RetInfo>,
    asyn_ret_rx: mpsc::Receiver<RetInfo>,
    asyn_cap: usize,
    pending_asyn: usize,
}

impl Client {
    /// 创建并挂接到 `server`，`l` 为异步回复通道容量
    ///
    /// 容量为 0 的客户端只能发同步调用，任何异步调用都会立刻收到
    /// `TooManyCalls`。
    pub fn new(server: Arc<Server>, l: usize) -> Self {
        // 同步回复通道容量固定为 1：发出即阻塞等待，不会有第二个在途回复
        let (sync_tx, sync_rx) = mpsc::channel(1);
        let (asyn_tx, asyn_rx) = mpsc::channel(l.max(1));
        Client {
            server,
            sync_ret_tx: sync_tx,
            sync_ret_rx: sync_rx,
            asyn_ret_tx: asyn_tx,
            asyn_ret_rx: asyn_rx,
            asyn_cap: l,
            pending_asyn: 0,
        }
    }

    /// 同步调用（无返回值）：队列满时阻塞，直到回复产生或服务器关闭
    pub async fn call0(&mut self, id: &str, args: Args) -> Result<(), RpcError> {
        let ri = self.call(id, RetKind::None, args).await?;
        match ri.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 同步调用（单返回值）
    pub async fn call1(&mut self, id: &str, args: Args) -> Result<Value, RpcError> {
        let ri = self.call(id, RetKind::Single, args).await?;
        ret_single(ri)
    }

    /// 同步调用（多返回值）
    pub async fn calln(&mut self, id: &str, args: Args) -> Result<Args, RpcError> {
        let ri = self.call(id, RetKind::Multi, args).await?;
        ret_multi(ri)
    }

    async fn call(&mut self, id: &str, kind: RetKind, args: Args) -> Result<RetInfo, RpcError> {
        let f = self.server.lookup(id, kind)?;
        self.server
            .chan_call_tx
            .send(CallInfo {
                f,
                args,
                chan_ret: Some(self.sync_ret_tx.clone()),
                cb: None,
            })
            .await
            .map_err(|_| RpcError::ServerClosed)?;
        self.sync_ret_rx.recv().await.ok_or(RpcError::ServerClosed)
    }

    /// 异步调用：永不阻塞
    ///
    /// 超出在途容量时立刻以 `TooManyCalls` 调用回调（不计入在途计数）；
    /// 其余失败（未注册、形态不符、队列满）会作为错误结果进入异步回复
    /// 通道，由接收循环经 `cb` 投递。
    pub fn asyn_call(&mut self, id: &str, args: Args, cb: Callback) {
        if self.pending_asyn >= self.asyn_cap {
            exec_cb(
                RetInfo {
                    ret: Ret::None,
                    err: Some(RpcError::TooManyCalls),
                    cb: Some(cb),
                },
                self.server.len_stack_buf,
            );
            return;
        }

        match self.server.lookup(id, cb.kind()) {
            Ok(f) => {
                let ci = CallInfo {
                    f,
                    args,
                    chan_ret: Some(self.asyn_ret_tx.clone()),
                    cb: Some(cb),
                };
                match self.server.chan_call_tx.try_send(ci) {
                    Ok(()) => {}
                    Err(e) => {
                        let (err, ci) = match e {
                            TrySendError::Full(ci) => (RpcError::ChannelFull, ci),
                            TrySendError::Closed(ci) => (RpcError::ServerClosed, ci),
                        };
                        self.push_asyn_err(err, ci.cb);
                    }
                }
            }
            Err(err) => self.push_asyn_err(err, Some(cb)),
        }
        self.pending_asyn += 1;
    }

    // 在途计数恒小于通道容量，错误结果一定放得进去
    fn push_asyn_err(&self, err: RpcError, cb: Option<Callback>) {
        let _ = self.asyn_ret_tx.try_send(RetInfo {
            ret: Ret::None,
            err: Some(err),
            cb,
        });
    }

    /// 取出下一个异步调用结果，交给 `cb` 完成投递
    ///
    /// 结果按完成顺序到达，与发起顺序无关。
    pub async fn recv_ret(&mut self) -> Option<RetInfo> {
        self.asyn_ret_rx.recv().await
    }

    /// 投递一个异步结果：递减在途计数并以 panic 隔离的方式调用回调
    pub fn cb(&mut self, ri: RetInfo) {
        self.pending_asyn = self.pending_asyn.saturating_sub(1);
        exec_cb(ri, self.server.len_stack_buf);
    }

    /// 关闭客户端：把所有在途异步调用的结果投递完
    pub async fn close(&mut self) {
        while self.pending_asyn > 0 {
            if let Some(ri) = self.recv_ret().await {
                self.cb(ri);
            }
        }
    }

    /// 是否没有在途的异步调用
    pub fn idle(&self) -> bool {
        self.pending_asyn == 0
    }
}

fn ret_single(ri: RetInfo) -> Result<Value, RpcError> {
    match (ri.err, ri.ret) {
        (Some(e), _) => Err(e),
        (None, Ret::Single(v)) => Ok(v),
        (None, _) => Err(RpcError::Callee("return value missing".to_string())),
    }
}

fn ret_multi(ri: RetInfo) -> Result<Args, RpcError> {
    match (ri.err, ri.ret) {
        (Some(e), _) => Err(e),
        (None, Ret::Multi(v)) => Ok(v),
        (None, _) => Err(RpcError::Callee("return value missing".to_string())),
    }
}

// 回调由应用提供，panic 同样不允许打穿接收循环
fn exec_cb(ri: RetInfo, len_stack_buf: usize) {
    let RetInfo { ret, err, cb } = ri;
    let Some(cb) = cb else { return };

    let result = catch_unwind(AssertUnwindSafe(move || match cb {
        Callback::NoRet(f) => match err {
            Some(e) => f(Err(e)),
            None => f(Ok(())),
        },
        Callback::OneRet(f) => f(ret_single(RetInfo { ret, err, cb: None })),
        Callback::MultiRet(f) => f(ret_multi(RetInfo { ret, err, cb: None })),
    }));

    if let Err(payload) = result {
        log_panic(&panic_message(&payload), len_stack_buf);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn log_panic(msg: &str, len_stack_buf: usize) {
    if len_stack_buf > 0 {
        let mut stack = Backtrace::force_capture().to_string();
        if stack.len() > len_stack_buf {
            let mut end = len_stack_buf;
            while !stack.is_char_boundary(end) {
                end -= 1;
            }
            stack.truncate(end);
        }
        tracing::error!("{}: {}", msg, stack);
    } else {
        tracing::error!("{}", msg);
    }
}
