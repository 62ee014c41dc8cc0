/// 消息处理器边界
///
/// 编解码与路由是外部协作方，核心不解释消息内容：
/// 原始帧进来交给 `unmarshal` + `route`，出去经 `marshal` 变回帧序列。
/// 三个方法任何一个返回错误，都会终结所属连接的读循环。
use std::any::Any;

use bytes::Bytes;

/// 解码后的应用消息，对核心而言完全不透明
pub type RawMessage = Box<dyn Any + Send>;

pub trait Processor: Send + Sync {
    /// 把一个完整帧解码成应用消息
    fn unmarshal(&self, data: &[u8]) -> anyhow::Result<RawMessage>;

    /// 把应用消息编码成一个或多个帧片段（片段会被连接层拼成一帧发出）
    fn marshal(&self, msg: &(dyn Any + Send)) -> anyhow::Result<Vec<Bytes>>;

    /// 把消息路由给业务方，`sender` 是发出该消息的 Agent 句柄
    fn route(&self, msg: RawMessage, sender: RawMessage) -> anyhow::Result<()>;
}
