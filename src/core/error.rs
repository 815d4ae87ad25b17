//! 控制面错误类型
//!
//! 各接缝（协议、后端、凭证存储）各自有错误枚举；这里是注册表 / 控制 API 对外暴露的错误。

use thiserror::Error;

/// 注册表与控制 API 可能返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("tenant id is missing or invalid")]
    InvalidTenantId,

    /// 会话 actor 已退出（终态），无法再接收命令
    #[error("session closed: {0}")]
    SessionClosed(String),
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::SessionNotFound(_))
    }
}
