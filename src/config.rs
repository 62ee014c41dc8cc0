/// 进程配置
///
/// 核心只消费这些"值"：队列容量、连接上限、帧长上限、握手超时、
/// 长度前缀的宽度与字节序、panic 栈回溯截断长度。配置文件为 JSON，
/// 缺省字段回落到与运行期一致的默认值。
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chanrpc;
use crate::gate::Gate;
use crate::network::PrefixWidth;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // chanrpc
    /// panic 栈回溯截断长度，0 表示不采集
    pub len_stack_buf: usize,
    /// RPC 调用队列容量
    pub call_queue_len: usize,
    /// 客户端异步回复通道容量
    pub asyn_ret_len: usize,

    // gate
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub max_msg_len: u32,
    pub tcp_addr: Option<String>,
    pub ws_addr: Option<String>,
    pub http_addr: Option<String>,
    /// 长度前缀宽度（字节数 1 / 2 / 4）
    pub len_msg_len: PrefixWidth,
    pub little_endian: bool,
    /// 握手超时（秒）
    pub http_timeout_secs: u64,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            len_stack_buf: 4096,
            call_queue_len: 10000,
            asyn_ret_len: 10000,
            max_conn_num: 100,
            pending_write_num: 100,
            max_msg_len: 4096,
            tcp_addr: None,
            ws_addr: None,
            http_addr: None,
            len_msg_len: PrefixWidth::default(),
            little_endian: false,
            http_timeout_secs: 10,
            cert_file: None,
            key_file: None,
        }
    }
}

impl Config {
    /// 从 JSON 文本解析配置
    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// 从 JSON 配置文件加载
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// 按本配置构建一个 Gate（处理器、RPC 服务器、会话查询与路由
    /// 由调用方在返回值上补齐）
    pub fn gate(&self) -> Gate {
        Gate {
            max_conn_num: self.max_conn_num,
            pending_write_num: self.pending_write_num,
            max_msg_len: self.max_msg_len,
            tcp_addr: self.tcp_addr.clone(),
            ws_addr: self.ws_addr.clone(),
            http_addr: self.http_addr.clone(),
            len_msg_len: self.len_msg_len,
            little_endian: self.little_endian,
            http_timeout: Duration::from_secs(self.http_timeout_secs),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            ..Gate::default()
        }
    }

    /// 按本配置创建一个还未注册任何函数的 RPC 服务器
    pub fn rpc_server(&self) -> chanrpc::Server {
        let mut server = chanrpc::Server::new(self.call_queue_len);
        server.set_len_stack_buf(self.len_stack_buf);
        server
    }

    /// 按本配置为 `server` 挂接一个客户端
    pub fn rpc_client(&self, server: Arc<chanrpc::Server>) -> chanrpc::Client {
        server.open(self.asyn_ret_len)
    }
}
