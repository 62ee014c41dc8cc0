/// 会话用户数据
///
/// 核心只携带这份不透明的用户数据（身份 + 令牌 + 过期时刻），
/// 令牌背后的键值存储由外部协作方实现，这里只定义查询边界。
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 挂在 Agent 上的用户数据
#[derive(Debug, Clone, PartialEq)]
pub struct UserData {
    pub user_id: i64,
    pub token: String,
    /// 过期时刻，过期后整份数据视为不存在
    pub expires_at: DateTime<Utc>,
}

impl UserData {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// 会话令牌查询边界
///
/// WebSocket 握手携带的 token cookie 经由它换取用户数据；
/// 查询失败只记日志，连接照常建立（无用户数据）。
#[async_trait]
pub trait SessionLookup: Send + Sync {
    async fn resolve(&self, token: &str) -> anyhow::Result<Option<UserData>>;
}
