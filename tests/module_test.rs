/// 模块生命周期测试
///
/// 覆盖：初始化顺序、逆序销毁、销毁钩子 panic 隔离。
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{timeout, Duration};

use modnet::{App, CloseSignal, Module};

struct RecordModule {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    panic_on_destroy: bool,
}

impl RecordModule {
    fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
        RecordModule {
            name,
            log,
            panic_on_destroy: false,
        }
    }
}

#[async_trait]
impl Module for RecordModule {
    fn on_init(&mut self) {
        self.log.lock().push(format!("init {}", self.name));
    }

    async fn run(&mut self, mut close_sig: CloseSignal) {
        close_sig.recv().await;
    }

    fn on_destroy(&mut self) {
        self.log.lock().push(format!("destroy {}", self.name));
        if self.panic_on_destroy {
            panic!("destroy exploded");
        }
    }
}

#[tokio::test]
async fn test_init_order_and_reverse_destroy() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut app = App::new();
    app.register(RecordModule::new("a", log.clone()));
    app.register(RecordModule::new("b", log.clone()));
    app.register(RecordModule::new("c", log.clone()));

    app.init();
    timeout(Duration::from_secs(5), app.destroy())
        .await
        .expect("destroy must not hang");

    assert_eq!(
        log.lock().as_slice(),
        [
            "init a", "init b", "init c",
            "destroy c", "destroy b", "destroy a",
        ]
    );
}

#[tokio::test]
async fn test_destroy_panic_does_not_block_teardown() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut app = App::new();
    app.register(RecordModule::new("a", log.clone()));
    let mut bad = RecordModule::new("b", log.clone());
    bad.panic_on_destroy = true;
    app.register(bad);
    app.register(RecordModule::new("c", log.clone()));

    app.init();
    timeout(Duration::from_secs(5), app.destroy())
        .await
        .expect("destroy must not hang");

    // b 的销毁钩子 panic 不影响 a 的销毁
    assert_eq!(
        log.lock().as_slice(),
        [
            "init a", "init b", "init c",
            "destroy c", "destroy b", "destroy a",
        ]
    );
}

struct PanickyRun {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Module for PanickyRun {
    async fn run(&mut self, _close_sig: CloseSignal) {
        panic!("run exploded");
    }

    fn on_destroy(&mut self) {
        self.log.lock().push("destroy panicky".to_string());
    }
}

#[tokio::test]
async fn test_run_panic_is_logged_not_propagated() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut app = App::new();
    app.register(PanickyRun { log: log.clone() });
    app.register(RecordModule::new("a", log.clone()));

    app.init();
    tokio::time::sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(5), app.destroy())
        .await
        .expect("destroy must not hang");

    // run panic 吞掉了模块本体，销毁钩子无从执行，但 a 正常拆除
    assert!(log.lock().contains(&"destroy a".to_string()));
    assert!(!log.lock().contains(&"destroy panicky".to_string()));
}
