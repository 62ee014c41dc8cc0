/// 模块生命周期管理
///
/// 每个模块独占一个 tokio 任务。`App` 持有有序的模块注册表：
/// 初始化按注册顺序同步执行（后一个模块的初始化可以依赖前一个），
/// 销毁严格按注册的逆序进行，并逐个等待模块任务退出。
use std::any::type_name;
use std::panic::{catch_unwind, AssertUnwindSafe};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 关闭信号的接收端，容量为 1
///
/// 模块的 `run` 循环应当在收到信号后尽快退出。
pub struct CloseSignal {
    rx: mpsc::Receiver<()>,
}

impl CloseSignal {
    /// 等待关闭信号
    pub async fn recv(&mut self) {
        let _ = self.rx.recv().await;
    }
}

/// 模块能力集
///
/// 状态机：注册 → 初始化 → 运行 → 销毁。`run` 在模块自己的任务里执行，
/// 收到关闭信号前应当一直循环。
#[async_trait]
pub trait Module: Send + 'static {
    /// 初始化钩子，在注册顺序上同步执行一次
    fn on_init(&mut self) {}

    /// 运行循环，收到 `close_sig` 后退出
    async fn run(&mut self, close_sig: CloseSignal);

    /// 销毁钩子，在 `run` 退出之后执行一次，panic 会被隔离
    fn on_destroy(&mut self) {}
}

struct ModuleRecord {
    module: Option<Box<dyn Module>>,
    close_tx: mpsc::Sender<()>,
    close_sig: Option<CloseSignal>,
    handle: Option<JoinHandle<Box<dyn Module>>>,
    name: &'static str,
}

/// 模块注册表与生命周期编排器
///
/// 显式持有全部状态，不依赖任何进程级的全局注册表，
/// 多个 `App` 实例互不影响，测试可以各建各的。
#[derive(Default)]
pub struct App {
    mods: Vec<ModuleRecord>,
}

impl App {
    pub fn new() -> Self {
        App { mods: Vec::new() }
    }

    /// 注册一个模块，注册顺序决定初始化顺序和（逆序的）销毁顺序
    pub fn register<M: Module>(&mut self, module: M) {
        let (tx, rx) = mpsc::channel(1);
        self.mods.push(ModuleRecord {
            module: Some(Box::new(module)),
            close_tx: tx,
            close_sig: Some(CloseSignal { rx }),
            handle: None,
            name: type_name::<M>(),
        });
    }

    /// 按注册顺序初始化所有模块，然后为每个模块启动独立任务
    pub fn init(&mut self) {
        for rec in &mut self.mods {
            if let Some(m) = rec.module.as_mut() {
                m.on_init();
            }
        }

        for rec in &mut self.mods {
            let (Some(mut m), Some(sig)) = (rec.module.take(), rec.close_sig.take()) else {
                continue;
            };
            tracing::debug!("module {} running", rec.name);
            rec.handle = Some(tokio::spawn(async move {
                m.run(sig).await;
                m
            }));
        }
    }

    /// 按注册的逆序销毁所有模块
    ///
    /// 对每个模块：发出关闭信号，等待其任务退出，再执行销毁钩子。
    /// 销毁钩子或运行循环 panic 只记日志，不影响后续模块的销毁。
    pub async fn destroy(&mut self) {
        for rec in self.mods.iter_mut().rev() {
            let _ = rec.close_tx.try_send(());
            let Some(handle) = rec.handle.take() else {
                continue;
            };
            match handle.await {
                Ok(mut m) => {
                    if catch_unwind(AssertUnwindSafe(|| m.on_destroy())).is_err() {
                        tracing::error!("module {} on_destroy panicked", rec.name);
                    }
                }
                Err(e) => tracing::error!("module {} run task failed: {}", rec.name, e),
            }
            tracing::debug!("module {} destroyed", rec.name);
        }
    }

    /// 初始化全部模块并阻塞到进程收到中断信号，随后逆序销毁
    pub async fn run_until_signal(&mut self) {
        tracing::info!("🚀 modnet starting up ({} modules)", self.mods.len());
        self.init();
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("listen interrupt signal: {}", e);
        }
        tracing::info!("🛑 modnet closing down");
        self.destroy().await;
    }
}
