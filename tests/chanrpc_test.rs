/// ChanRPC 调用机制测试
///
/// 覆盖：同步 / 异步 / 发后即忘三条路径、形态校验、容量背压、
/// panic 隔离以及关闭时的排空语义。
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{timeout, Duration};

use modnet::chanrpc::{Args, Callback, Server};
use modnet::RpcError;

// 启动接收循环：不断取调用并执行
fn spawn_dispatcher(server: Arc<Server>) {
    let s = server.clone();
    tokio::spawn(async move {
        while let Some(ci) = s.recv().await {
            s.exec(ci);
        }
    });
}

#[tokio::test]
async fn test_sync_echo() {
    let mut server = Server::new(16);
    server.register_one_ret("echo", |mut args: Args| args.remove(0));
    let server = Arc::new(server);
    spawn_dispatcher(server.clone());

    let mut client = server.clone().open(0);
    let ret = client
        .call1("echo", vec![Box::new("hello".to_string())])
        .await
        .unwrap();
    assert_eq!(ret.downcast_ref::<String>().unwrap(), "hello");

    server.close().await;
}

#[tokio::test]
async fn test_arity_mismatch_never_invokes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();

    let mut server = Server::new(16);
    server.register_one_ret("echo", move |mut args: Args| {
        c.fetch_add(1, Ordering::SeqCst);
        args.remove(0)
    });
    let server = Arc::new(server);
    spawn_dispatcher(server.clone());

    let mut client = server.clone().open(0);

    // 以 call0 / calln 去调一个单返回值函数
    let err = client.call0("echo", vec![Box::new(1i64)]).await.unwrap_err();
    assert_eq!(err, RpcError::ArityMismatch("echo".to_string()));
    let err = client.calln("echo", vec![Box::new(1i64)]).await.unwrap_err();
    assert_eq!(err, RpcError::ArityMismatch("echo".to_string()));

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    server.close().await;
}

#[tokio::test]
async fn test_call_not_registered() {
    let server = Arc::new(Server::new(4));
    let mut client = server.clone().open(0);
    let err = client.call0("nope", vec![]).await.unwrap_err();
    assert_eq!(err, RpcError::NotRegistered("nope".to_string()));
}

#[test]
#[should_panic(expected = "already registered")]
fn test_duplicate_registration_is_fatal() {
    let mut server = Server::new(4);
    server.register_no_ret("dup", |_args: Args| {});
    server.register_no_ret("dup", |_args: Args| {});
}

#[tokio::test]
async fn test_go_on_full_queue_drops_without_blocking() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();

    // 队列容量 1，不启动接收循环，制造持续满队
    let mut server = Server::new(1);
    server.register_no_ret("tick", move |_args: Args| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    let server = Arc::new(server);

    server.go("tick", vec![]);
    // 第二次必须立即返回且被丢弃
    timeout(Duration::from_secs(1), async { server.go("tick", vec![]) })
        .await
        .expect("go must not block");
    // 未注册的 id 同样静默
    server.go("missing", vec![]);

    spawn_dispatcher(server.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    server.close().await;
}

#[tokio::test]
async fn test_asyn_call_over_capacity() {
    let mut server = Server::new(16);
    server.register_one_ret("echo", |mut args: Args| args.remove(0));
    let server = Arc::new(server);

    // 异步容量 1：第一个在途，第二个立刻吃到 too many calls
    let mut client = server.clone().open(1);
    let results: Arc<Mutex<Vec<Result<String, RpcError>>>> = Arc::new(Mutex::new(Vec::new()));

    let r = results.clone();
    client.asyn_call(
        "echo",
        vec![Box::new("first".to_string())],
        Callback::OneRet(Box::new(move |ret| {
            r.lock()
                .push(ret.map(|v| v.downcast_ref::<String>().unwrap().clone()));
        })),
    );
    assert!(!client.idle());

    let r = results.clone();
    client.asyn_call(
        "echo",
        vec![Box::new("second".to_string())],
        Callback::OneRet(Box::new(move |ret| {
            r.lock()
                .push(ret.map(|v| v.downcast_ref::<String>().unwrap().clone()));
        })),
    );

    // 超容量的调用立刻完成，且不影响在途计数
    assert_eq!(results.lock().len(), 1);
    assert_eq!(
        results.lock()[0].as_ref().unwrap_err(),
        &RpcError::TooManyCalls
    );

    // 启动接收循环，让第一个调用完成
    spawn_dispatcher(server.clone());
    let ri = client.recv_ret().await.unwrap();
    client.cb(ri);
    assert!(client.idle());
    assert_eq!(results.lock()[1].as_ref().unwrap(), "first");

    server.close().await;
}

#[tokio::test]
async fn test_asyn_call_not_registered() {
    let server = Arc::new(Server::new(4));
    let mut client = server.clone().open(8);
    let results: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let r = results.clone();
    client.asyn_call(
        "slow",
        vec![],
        Callback::OneRet(Box::new(move |ret| {
            r.lock().push(ret.unwrap_err().to_string());
        })),
    );

    let ri = client.recv_ret().await.unwrap();
    client.cb(ri);
    assert_eq!(
        results.lock().as_slice(),
        ["function id slow: function not registered"]
    );
    assert!(client.idle());
}

#[tokio::test]
async fn test_sync_calls_no_cross_talk() {
    let mut server = Server::new(16);
    server.register_one_ret("token", |mut args: Args| args.remove(0));
    let server = Arc::new(server);
    spawn_dispatcher(server.clone());

    let mut client = server.clone().open(0);
    for i in 0..50u64 {
        let token = format!("token-{}-{}", i, rand::random::<u64>());
        let ret = client
            .call1("token", vec![Box::new(token.clone())])
            .await
            .unwrap();
        assert_eq!(ret.downcast_ref::<String>().unwrap(), &token);
    }

    server.close().await;
}

#[tokio::test]
async fn test_panic_in_handler_is_isolated() {
    let mut server = Server::new(16);
    server.register_no_ret("boom", |_args: Args| panic!("handler exploded"));
    server.register_one_ret("echo", |mut args: Args| args.remove(0));
    let server = Arc::new(server);
    spawn_dispatcher(server.clone());

    let mut client = server.clone().open(0);
    let err = client.call0("boom", vec![]).await.unwrap_err();
    assert_eq!(err, RpcError::Callee("handler exploded".to_string()));

    // 接收循环还活着，后续调用照常服务
    let ret = client
        .call1("echo", vec![Box::new(7i64)])
        .await
        .unwrap();
    assert_eq!(*ret.downcast_ref::<i64>().unwrap(), 7);

    server.close().await;
}

#[tokio::test]
async fn test_close_drains_pending_calls() {
    let mut server = Server::new(8);
    server.register_no_ret("noop", |_args: Args| {});
    let server = Arc::new(server);
    // 不启动接收循环，调用全部滞留在队列里

    let mut handles = Vec::new();
    for _ in 0..3 {
        let server = server.clone();
        handles.push(tokio::spawn(async move {
            let mut client = server.clone().open(0);
            client.call0("noop", vec![]).await
        }));
    }
    // 等调用进入队列
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.close().await;

    for handle in handles {
        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("caller must not block forever")
            .unwrap();
        assert_eq!(result.unwrap_err(), RpcError::ServerClosed);
    }
}

#[tokio::test]
async fn test_asyn_callback_panic_is_isolated() {
    let mut server = Server::new(4);
    server.register_no_ret("noop", |_args: Args| {});
    let server = Arc::new(server);
    spawn_dispatcher(server.clone());

    let mut client = server.clone().open(4);
    client.asyn_call(
        "noop",
        vec![],
        Callback::NoRet(Box::new(|_ret| panic!("callback exploded"))),
    );

    let ri = client.recv_ret().await.unwrap();
    // 回调 panic 被吞掉，计数照常递减
    client.cb(ri);
    assert!(client.idle());

    server.close().await;
}

#[tokio::test]
async fn test_server_convenience_calls() {
    let mut server = Server::new(8);
    server.register_multi_ret("pair", |mut args: Args| {
        let a = args.remove(0);
        vec![a, Box::new(42i64)]
    });
    let server = Arc::new(server);
    spawn_dispatcher(server.clone());

    let ret = server
        .calln("pair", vec![Box::new("x".to_string())])
        .await
        .unwrap();
    assert_eq!(ret.len(), 2);
    assert_eq!(ret[0].downcast_ref::<String>().unwrap(), "x");
    assert_eq!(*ret[1].downcast_ref::<i64>().unwrap(), 42);

    server.close().await;
}
