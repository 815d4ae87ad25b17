//! 发送出口：所有外发文本先入队，再由 drain 任务在 Connected 状态下按序发出
//!
//! 每条消息：composing → 输入延时 → send → paused；相邻两条之间再等待 pacing。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::actor::Command;
use super::queue::{MessageQueue, QueuedMessage};
use crate::config::SessionSection;
use crate::core::{RelayError, Scheduler};
use crate::protocol::{Presence, ProtocolConnection};

/// 发送节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub typing: Duration,
    pub between: Duration,
}

impl Pacing {
    pub fn from_config(cfg: &SessionSection) -> Self {
        Self {
            typing: Duration::from_millis(cfg.typing_delay_ms),
            between: Duration::from_millis(cfg.pacing_ms),
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::from_config(&SessionSection::default())
    }
}

/// 会话的入队句柄，可在会话外（入站处理任务）克隆使用
#[derive(Clone)]
pub struct Outbox {
    tenant_id: String,
    queue: Arc<Mutex<MessageQueue>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Outbox {
    pub(super) fn new(
        tenant_id: &str,
        queue: Arc<Mutex<MessageQueue>>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            queue,
            commands,
        }
    }

    /// 入队并通知会话；会话已结束时返回 SessionClosed
    pub async fn push(&self, recipient: &str, text: &str) -> Result<(), RelayError> {
        if self.commands.is_closed() {
            return Err(RelayError::SessionClosed(self.tenant_id.clone()));
        }
        let evicted = self
            .queue
            .lock()
            .await
            .enqueue(QueuedMessage::new(recipient, text));
        if let Some(old) = evicted {
            tracing::warn!(
                tenant_id = %self.tenant_id,
                "outbound queue full, dropped oldest message to {}",
                old.recipient
            );
        }
        self.commands
            .send(Command::Kick)
            .map_err(|_| RelayError::SessionClosed(self.tenant_id.clone()))
    }
}

/// 一次 drain 的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub expired: usize,
}

/// 按序发送队列中的消息，直到队列为空或 token 被取消
///
/// 单条失败只记录日志并继续；取消发生在发送前时消息放回队首。
pub(super) async fn drain(
    tenant_id: &str,
    conn: Arc<dyn ProtocolConnection>,
    queue: Arc<Mutex<MessageQueue>>,
    scheduler: Arc<dyn Scheduler>,
    pacing: Pacing,
    token: CancellationToken,
) -> DrainReport {
    let mut report = DrainReport::default();
    let mut first = true;

    loop {
        if token.is_cancelled() {
            break;
        }

        let next = queue.lock().await.dequeue_fresh(Utc::now());
        if next.expired > 0 {
            tracing::warn!(tenant_id = %tenant_id, "dropped {} expired queued messages", next.expired);
            report.expired += next.expired;
        }
        let Some(msg) = next.message else { break };

        if !first {
            let interrupted = tokio::select! {
                biased;
                _ = token.cancelled() => true,
                _ = scheduler.sleep(pacing.between) => false,
            };
            if interrupted {
                queue.lock().await.requeue_front(msg);
                break;
            }
        }
        first = false;

        let _ = conn.send_presence(&msg.recipient, Presence::Composing).await;
        let interrupted = tokio::select! {
            biased;
            _ = token.cancelled() => true,
            _ = scheduler.sleep(pacing.typing) => false,
        };
        if interrupted {
            queue.lock().await.requeue_front(msg);
            break;
        }

        match conn.send(&msg.recipient, &msg.text).await {
            Ok(()) => {
                report.sent += 1;
                tracing::info!(tenant_id = %tenant_id, "message sent to {}", msg.recipient);
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(tenant_id = %tenant_id, "send to {} failed: {}", msg.recipient, e);
            }
        }
        let _ = conn.send_presence(&msg.recipient, Presence::Paused).await;
    }

    report
}
