//! 协议层接缝
//!
//! 线上协议（握手、加密、编码）由外部实现，这里只定义编排器消费的接口：
//! - **Connector**：为某个租户打开一条连接，返回连接句柄与事件流
//! - **ProtocolConnection**：发送文本、presence、关闭
//! - **ProtocolEvent**：生命周期事件、凭证更新、入站消息

pub mod bridge;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::auth::AuthBlob;

pub use bridge::BridgeConnector;
pub use mock::{MockConnection, MockConnector};

/// 协议层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("send timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,
}

/// 连接关闭原因（协议层上报的状态码）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseReason(pub u16);

impl CloseReason {
    pub const LOGGED_OUT: CloseReason = CloseReason(401);
    pub const FORBIDDEN: CloseReason = CloseReason(403);
    pub const CONNECTION_LOST: CloseReason = CloseReason(408);
    pub const MULTIDEVICE_MISMATCH: CloseReason = CloseReason(411);
    pub const CONNECTION_CLOSED: CloseReason = CloseReason(428);
    pub const CONNECTION_REPLACED: CloseReason = CloseReason(440);
    pub const BAD_SESSION: CloseReason = CloseReason(500);
    pub const UNAVAILABLE: CloseReason = CloseReason(503);
    pub const RESTART_REQUIRED: CloseReason = CloseReason(515);

    pub fn code(&self) -> u16 {
        self.0
    }

    /// 日志用的可读名称
    pub fn label(&self) -> &'static str {
        match self.0 {
            401 => "logged_out",
            403 => "forbidden",
            408 => "connection_lost",
            411 => "multidevice_mismatch",
            428 => "connection_closed",
            440 => "connection_replaced",
            500 => "bad_session",
            503 => "unavailable",
            515 => "restart_required",
            _ => "unknown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.0, self.label())
    }
}

/// 连接生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ProvisioningCodeIssued(String),
    Opened,
    Closed(CloseReason),
}

/// 连接上发出的所有事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Connection(ConnectionEvent),
    /// 协议层刷新了凭证，需要持久化
    CredentialsUpdated(AuthBlob),
    Inbound(InboundMessage),
}

/// 消息来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginKind {
    Direct,
    Group,
    Broadcast,
    Status,
}

impl OriginKind {
    /// 按会话地址后缀推断来源：`@g.us` 群组、`status@broadcast` 状态、`@broadcast` 广播
    pub fn from_address(address: &str) -> Self {
        if address.ends_with("@g.us") {
            OriginKind::Group
        } else if address == "status@broadcast" {
            OriginKind::Status
        } else if address.ends_with("@broadcast") {
            OriginKind::Broadcast
        } else {
            OriginKind::Direct
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub caption: Option<String>,
}

/// 入站消息的原始内容；文本提取顺序见 `inbound::extract_text`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub text: Option<String>,
    pub media: Option<MediaAttachment>,
    pub voice_note: bool,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn media(kind: MediaKind, caption: Option<&str>) -> Self {
        Self {
            media: Some(MediaAttachment {
                kind,
                caption: caption.map(str::to_string),
            }),
            ..Default::default()
        }
    }

    pub fn voice_note() -> Self {
        Self {
            voice_note: true,
            ..Default::default()
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// 入站消息
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// 发送方地址（回复发往此地址）
    pub sender: String,
    pub content: MessageContent,
    /// 自己发出的消息（多设备同步回来的）
    pub from_me: bool,
    pub origin: OriginKind,
}

impl InboundMessage {
    /// 来源类型由地址推断
    pub fn new(sender: impl Into<String>, content: MessageContent, from_me: bool) -> Self {
        let sender = sender.into();
        let origin = OriginKind::from_address(&sender);
        Self {
            sender,
            content,
            from_me,
            origin,
        }
    }
}

/// 「正在输入」状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Composing,
    Paused,
}

/// 单个租户的连接句柄
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), ProtocolError>;

    /// 默认不支持 presence，直接成功
    async fn send_presence(&self, _recipient: &str, _presence: Presence) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// 释放连接；重复调用无副作用
    async fn close(&self);
}

/// 一次 connect 的结果：句柄 + 该连接的事件订阅
pub struct Connection {
    pub handle: Arc<dyn ProtocolConnection>,
    pub events: mpsc::UnboundedReceiver<ProtocolEvent>,
}

/// 连接工厂
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, tenant_id: &str, auth: Option<AuthBlob>) -> Result<Connection, ProtocolError>;
}
