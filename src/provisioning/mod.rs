//! 扫码配对推送
//!
//! 会话拿到配对码后通过 ProvisioningBroadcaster 扇出给所有在线订阅者（如管理后台）。
//! 尽力投递：不重试、不持久化，晚到的订阅者需要通过状态查询拉取。

pub mod push;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use push::PushServer;

/// 推送给订阅者的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisioningEvent {
    #[serde(rename_all = "camelCase")]
    Qr {
        tenant_id: String,
        business_name: String,
        code: String,
    },
}

/// 配对码广播器；克隆后共享同一通道
#[derive(Debug, Clone)]
pub struct ProvisioningBroadcaster {
    tx: broadcast::Sender<ProvisioningEvent>,
}

impl ProvisioningBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 广播配对码，返回收到事件的订阅者数量（0 表示当前无人订阅）
    pub fn publish(&self, tenant_id: &str, business_name: &str, code: &str) -> usize {
        let event = ProvisioningEvent::Qr {
            tenant_id: tenant_id.to_string(),
            business_name: business_name.to_string(),
            code: code.to_string(),
        };
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisioningEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProvisioningBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}
