//! Mock 协议连接（用于测试，无需真实 sidecar）
//!
//! 每次 connect 生成一个 MockConnection，测试通过 `emit` 注入事件，通过 `sent` 检查已发出的消息。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    CloseReason, Connection, ConnectionEvent, Connector, InboundMessage, Presence, ProtocolConnection,
    ProtocolError, ProtocolEvent,
};
use crate::auth::AuthBlob;

/// 轮询等待的上限
const WAIT_ROUNDS: usize = 1000;
const WAIT_STEP: Duration = Duration::from_millis(2);

/// 单条模拟连接
pub struct MockConnection {
    pub tenant_id: String,
    /// connect 时传入的凭证
    pub auth: Option<AuthBlob>,
    events: Mutex<Option<mpsc::UnboundedSender<ProtocolEvent>>>,
    sent: Mutex<Vec<(String, String)>>,
    presence: Mutex<Vec<(String, Presence)>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

impl MockConnection {
    /// 注入事件；连接已被会话丢弃时返回 false
    pub fn emit(&self, event: ProtocolEvent) -> bool {
        match self.events.lock() {
            Ok(events) => events.as_ref().is_some_and(|tx| tx.send(event).is_ok()),
            Err(_) => false,
        }
    }

    /// 结束事件流而不发出 Closed，模拟底层连接无声断开
    pub fn end_stream(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.take();
        }
    }

    pub fn emit_code(&self, code: &str) -> bool {
        self.emit(ProtocolEvent::Connection(ConnectionEvent::ProvisioningCodeIssued(
            code.to_string(),
        )))
    }

    pub fn emit_open(&self) -> bool {
        self.emit(ProtocolEvent::Connection(ConnectionEvent::Opened))
    }

    pub fn emit_close(&self, reason: CloseReason) -> bool {
        self.emit(ProtocolEvent::Connection(ConnectionEvent::Closed(reason)))
    }

    pub fn emit_inbound(&self, message: InboundMessage) -> bool {
        self.emit(ProtocolEvent::Inbound(message))
    }

    /// 已成功发送的 (收件人, 文本)
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn presence_updates(&self) -> Vec<(String, Presence)> {
        self.presence.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// 之后的 send 全部失败
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 等到至少发出 n 条消息
    pub async fn wait_for_sent(&self, n: usize) -> Vec<(String, String)> {
        for _ in 0..WAIT_ROUNDS {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        self.sent()
    }
}

#[async_trait]
impl ProtocolConnection for MockConnection {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Send("mock failure".to_string()));
        }
        if let Ok(mut v) = self.sent.lock() {
            v.push((recipient.to_string(), text.to_string()));
        }
        Ok(())
    }

    async fn send_presence(&self, recipient: &str, presence: Presence) -> Result<(), ProtocolError> {
        if let Ok(mut v) = self.presence.lock() {
            v.push((recipient.to_string(), presence));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 模拟连接工厂：记录每次 connect 产生的连接
#[derive(Default)]
pub struct MockConnector {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    fail_connects: AtomicBool,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 connect 全部失败
    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// 所有 connect 调用次数（含失败）
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 成功建立的连接数
    pub fn connect_count(&self) -> usize {
        self.connections.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// 第 index 次 connect 的连接（从 0 开始），轮询等待其出现
    pub async fn connection(&self, index: usize) -> Option<Arc<MockConnection>> {
        for _ in 0..WAIT_ROUNDS {
            let found = self
                .connections
                .lock()
                .ok()
                .and_then(|v| v.get(index).cloned());
            if found.is_some() {
                return found;
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        None
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, tenant_id: &str, auth: Option<AuthBlob>) -> Result<Connection, ProtocolError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connect("mock connect failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(MockConnection {
            tenant_id: tenant_id.to_string(),
            auth,
            events: Mutex::new(Some(tx)),
            sent: Mutex::new(Vec::new()),
            presence: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        if let Ok(mut v) = self.connections.lock() {
            v.push(Arc::clone(&conn));
        }
        Ok(Connection {
            handle: conn,
            events: rx,
        })
    }
}
