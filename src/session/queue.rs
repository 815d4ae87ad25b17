//! 每租户待发队列
//!
//! 入队永不失败；超出上限时淘汰最旧的一条，出队时丢弃超过 max_age 的消息。

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::QueueSection;

/// 待发消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub recipient: String,
    pub text: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(recipient: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            text: text.into(),
            enqueued_at: Utc::now(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(self.enqueued_at) > max_age,
            Err(_) => false,
        }
    }
}

/// 一次出队的结果
#[derive(Debug, Default)]
pub struct Dequeued {
    pub message: Option<QueuedMessage>,
    /// 因过期被丢弃的条数
    pub expired: usize,
}

/// FIFO 待发队列
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<QueuedMessage>,
    max_len: usize,
    max_age: Duration,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::from_config(&QueueSection::default())
    }
}

impl MessageQueue {
    pub fn new(max_len: usize, max_age: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            max_len: max_len.max(1),
            max_age,
        }
    }

    pub fn from_config(cfg: &QueueSection) -> Self {
        Self::new(cfg.max_len, Duration::from_secs(cfg.max_age_secs))
    }

    /// 追加到队尾；队满时返回被淘汰的最旧消息
    pub fn enqueue(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.items.len() >= self.max_len {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(message);
        evicted
    }

    /// 取出队首第一条未过期的消息
    pub fn dequeue_fresh(&mut self, now: DateTime<Utc>) -> Dequeued {
        let mut out = Dequeued::default();
        while let Some(msg) = self.items.pop_front() {
            if msg.is_expired(now, self.max_age) {
                out.expired += 1;
                continue;
            }
            out.message = Some(msg);
            break;
        }
        out
    }

    /// 放回队首（发送被中断时保持顺序）
    pub fn requeue_front(&mut self, message: QueuedMessage) {
        self.items.push_front(message);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 当前内容的快照（按发送顺序）
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.items.iter().cloned().collect()
    }
}
