//! 会话状态机
//!
//! 纯状态转换：输入一个事件，更新状态并返回待执行的动作列表，不做任何 I/O。
//! 动作由 `actor` 执行，因此转换表可以脱离真实连接单独测试。
//!
//! ```text
//! Initializing ──code──▶ QrPending ──open──▶ Connected
//!      │  ▲                  │                  │
//!      │  └──reconnect due── Reconnecting ◀─────┤ transient close
//!      └────────────────────────────────────────┴─▶ Failed / Disconnected
//! ```

use std::time::Duration;

use serde::Serialize;

use super::policy::{ReconnectDecision, ReconnectionPolicy, TerminalCause};
use crate::protocol::{CloseReason, ConnectionEvent, InboundMessage};

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    QrPending,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::QrPending => "qr_pending",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        }
    }

    /// 连接是否处于活动阶段（可以收到连接事件）
    fn is_attached(&self) -> bool {
        matches!(
            self,
            SessionState::Initializing | SessionState::QrPending | SessionState::Connected
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 断开方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// 运营方主动断开：注销设备并删除凭证
    Logout,
    /// 进程关闭：只释放连接，保留凭证
    Shutdown,
}

/// 会话结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    Failed(TerminalCause),
}

impl SessionEnd {
    pub fn reason(&self) -> &'static str {
        match self {
            SessionEnd::Disconnected => "disconnected",
            SessionEnd::Failed(cause) => cause.as_str(),
        }
    }
}

/// 状态机输入
#[derive(Debug, Clone)]
pub enum MachineInput {
    Start,
    Connection(ConnectionEvent),
    /// connect 调用本身失败（按临时断开处理）
    ConnectFailed(String),
    ReconnectDue,
    Inbound(InboundMessage),
    Disconnect(DisconnectMode),
}

/// 状态机输出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenConnection,
    ReleaseConnection,
    PublishCode(String),
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartFlush,
    StopFlush,
    Forward(InboundMessage),
    ClearCredentials,
    Finish(SessionEnd),
}

/// 单租户状态机
#[derive(Debug, Clone)]
pub struct SessionMachine {
    tenant_id: String,
    state: SessionState,
    retry_count: u32,
    provisioning_code: Option<String>,
    policy: ReconnectionPolicy,
}

impl SessionMachine {
    pub fn new(tenant_id: impl Into<String>, policy: ReconnectionPolicy) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            state: SessionState::Initializing,
            retry_count: 0,
            provisioning_code: None,
            policy,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn provisioning_code(&self) -> Option<&str> {
        self.provisioning_code.as_deref()
    }

    /// 处理一个输入，返回需要执行的动作（按顺序）
    pub fn handle(&mut self, input: MachineInput) -> Vec<Action> {
        if self.state.is_terminal() {
            tracing::warn!(
                tenant_id = %self.tenant_id,
                state = %self.state,
                "dropping late event in terminal state: {:?}",
                input
            );
            return Vec::new();
        }

        let before = self.state;
        let actions = match input {
            MachineInput::Start => self.on_start(),
            MachineInput::Connection(ConnectionEvent::ProvisioningCodeIssued(code)) => self.on_code(code),
            MachineInput::Connection(ConnectionEvent::Opened) => self.on_opened(),
            MachineInput::Connection(ConnectionEvent::Closed(reason)) => self.on_closed(reason),
            MachineInput::ConnectFailed(error) => {
                tracing::warn!(tenant_id = %self.tenant_id, "connect failed: {}", error);
                self.on_closed(CloseReason::CONNECTION_CLOSED)
            }
            MachineInput::ReconnectDue => self.on_reconnect_due(),
            MachineInput::Inbound(msg) => self.on_inbound(msg),
            MachineInput::Disconnect(mode) => self.on_disconnect(mode),
        };

        if before != self.state {
            tracing::info!(
                tenant_id = %self.tenant_id,
                from = %before,
                to = %self.state,
                retry = self.retry_count,
                "session state changed"
            );
        }
        actions
    }

    fn on_start(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Initializing => vec![Action::OpenConnection],
            _ => Vec::new(),
        }
    }

    fn on_code(&mut self, code: String) -> Vec<Action> {
        match self.state {
            SessionState::Initializing | SessionState::QrPending => {
                self.state = SessionState::QrPending;
                self.provisioning_code = Some(code.clone());
                vec![Action::PublishCode(code)]
            }
            other => {
                tracing::debug!(tenant_id = %self.tenant_id, state = %other, "ignoring provisioning code");
                Vec::new()
            }
        }
    }

    fn on_opened(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Initializing | SessionState::QrPending => {
                self.state = SessionState::Connected;
                self.provisioning_code = None;
                self.retry_count = 0;
                vec![Action::StartFlush]
            }
            // 重复的 Opened 不重新触发 flush
            _ => Vec::new(),
        }
    }

    fn on_closed(&mut self, reason: CloseReason) -> Vec<Action> {
        if !self.state.is_attached() {
            tracing::debug!(tenant_id = %self.tenant_id, code = %reason, "ignoring close while detached");
            return Vec::new();
        }

        self.provisioning_code = None;
        let mut actions = vec![Action::StopFlush, Action::ReleaseConnection];

        match self.policy.decide(reason, self.retry_count) {
            ReconnectDecision::Retry(delay) => {
                self.retry_count += 1;
                self.state = SessionState::Reconnecting;
                tracing::info!(
                    tenant_id = %self.tenant_id,
                    code = %reason,
                    "reconnect attempt {}/{} in {:?}",
                    self.retry_count,
                    self.policy.max_retries,
                    delay
                );
                actions.push(Action::ScheduleReconnect(delay));
            }
            ReconnectDecision::Terminal(cause) => {
                self.state = SessionState::Failed;
                tracing::warn!(tenant_id = %self.tenant_id, code = %reason, "session failed: {}", cause.as_str());
                if cause == TerminalCause::Deauthorized {
                    actions.push(Action::ClearCredentials);
                }
                actions.push(Action::Finish(SessionEnd::Failed(cause)));
            }
        }
        actions
    }

    fn on_reconnect_due(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Reconnecting => {
                self.state = SessionState::Initializing;
                vec![Action::OpenConnection]
            }
            _ => Vec::new(),
        }
    }

    fn on_inbound(&mut self, msg: InboundMessage) -> Vec<Action> {
        match self.state {
            SessionState::Connected => vec![Action::Forward(msg)],
            other => {
                tracing::debug!(
                    tenant_id = %self.tenant_id,
                    state = %other,
                    "dropping inbound message from {}: session not connected",
                    msg.sender
                );
                Vec::new()
            }
        }
    }

    fn on_disconnect(&mut self, mode: DisconnectMode) -> Vec<Action> {
        self.state = SessionState::Disconnected;
        self.provisioning_code = None;
        let mut actions = vec![Action::CancelReconnect, Action::StopFlush, Action::ReleaseConnection];
        if mode == DisconnectMode::Logout {
            actions.push(Action::ClearCredentials);
        }
        actions.push(Action::Finish(SessionEnd::Disconnected));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageContent;

    fn machine() -> SessionMachine {
        SessionMachine::new("T1", ReconnectionPolicy::default())
    }

    fn code(c: &str) -> MachineInput {
        MachineInput::Connection(ConnectionEvent::ProvisioningCodeIssued(c.to_string()))
    }

    fn opened() -> MachineInput {
        MachineInput::Connection(ConnectionEvent::Opened)
    }

    fn closed(reason: CloseReason) -> MachineInput {
        MachineInput::Connection(ConnectionEvent::Closed(reason))
    }

    #[test]
    fn test_start_opens_connection() {
        let mut m = machine();
        assert_eq!(m.handle(MachineInput::Start), vec![Action::OpenConnection]);
        assert_eq!(m.state(), SessionState::Initializing);
    }

    #[test]
    fn test_code_then_open() {
        let mut m = machine();
        m.handle(MachineInput::Start);
        assert_eq!(m.handle(code("ABC123")), vec![Action::PublishCode("ABC123".into())]);
        assert_eq!(m.state(), SessionState::QrPending);
        assert_eq!(m.provisioning_code(), Some("ABC123"));

        // 新码覆盖旧码
        m.handle(code("DEF456"));
        assert_eq!(m.provisioning_code(), Some("DEF456"));

        assert_eq!(m.handle(opened()), vec![Action::StartFlush]);
        assert_eq!(m.state(), SessionState::Connected);
        assert_eq!(m.provisioning_code(), None);
        assert_eq!(m.retry_count(), 0);
    }

    #[test]
    fn test_duplicate_open_does_not_restart_flush() {
        let mut m = machine();
        m.handle(opened());
        assert!(m.handle(opened()).is_empty());
    }

    #[test]
    fn test_code_ignored_when_connected() {
        let mut m = machine();
        m.handle(opened());
        assert!(m.handle(code("LATE")).is_empty());
        assert_eq!(m.provisioning_code(), None);
    }

    #[test]
    fn test_transient_close_counts_up_then_fails() {
        let mut m = machine();
        for expected in 1..=3u32 {
            let actions = m.handle(closed(CloseReason::CONNECTION_LOST));
            assert_eq!(m.state(), SessionState::Reconnecting);
            assert_eq!(m.retry_count(), expected);
            assert_eq!(
                actions,
                vec![
                    Action::StopFlush,
                    Action::ReleaseConnection,
                    Action::ScheduleReconnect(Duration::from_secs(5 * expected as u64)),
                ]
            );
            assert_eq!(m.handle(MachineInput::ReconnectDue), vec![Action::OpenConnection]);
            assert_eq!(m.state(), SessionState::Initializing);
        }

        let actions = m.handle(closed(CloseReason::CONNECTION_LOST));
        assert_eq!(m.state(), SessionState::Failed);
        assert_eq!(
            actions.last(),
            Some(&Action::Finish(SessionEnd::Failed(TerminalCause::RetriesExhausted)))
        );
        assert!(!actions.contains(&Action::ClearCredentials));

        // 终态后不再有任何动作
        assert!(m.handle(MachineInput::ReconnectDue).is_empty());
        assert!(m.handle(opened()).is_empty());
    }

    #[test]
    fn test_open_resets_retry_counter() {
        let mut m = machine();
        m.handle(closed(CloseReason::CONNECTION_LOST));
        m.handle(MachineInput::ReconnectDue);
        m.handle(closed(CloseReason::CONNECTION_LOST));
        m.handle(MachineInput::ReconnectDue);
        assert_eq!(m.retry_count(), 2);
        m.handle(opened());
        assert_eq!(m.retry_count(), 0);
    }

    #[test]
    fn test_logout_fails_immediately_and_clears_credentials() {
        let mut m = machine();
        m.handle(closed(CloseReason::CONNECTION_LOST));
        m.handle(MachineInput::ReconnectDue);
        let actions = m.handle(closed(CloseReason::LOGGED_OUT));
        assert_eq!(m.state(), SessionState::Failed);
        assert_eq!(m.retry_count(), 1);
        assert_eq!(
            actions,
            vec![
                Action::StopFlush,
                Action::ReleaseConnection,
                Action::ClearCredentials,
                Action::Finish(SessionEnd::Failed(TerminalCause::Deauthorized)),
            ]
        );
    }

    #[test]
    fn test_close_clears_code() {
        let mut m = machine();
        m.handle(code("ABC"));
        m.handle(closed(CloseReason::RESTART_REQUIRED));
        assert_eq!(m.provisioning_code(), None);
    }

    #[test]
    fn test_close_while_reconnecting_is_ignored() {
        let mut m = machine();
        m.handle(closed(CloseReason::CONNECTION_LOST));
        assert!(m.handle(closed(CloseReason::CONNECTION_LOST)).is_empty());
        assert_eq!(m.retry_count(), 1);
    }

    #[test]
    fn test_connect_failure_is_transient() {
        let mut m = machine();
        let actions = m.handle(MachineInput::ConnectFailed("refused".into()));
        assert_eq!(m.state(), SessionState::Reconnecting);
        assert!(matches!(actions.last(), Some(Action::ScheduleReconnect(_))));
    }

    #[test]
    fn test_inbound_only_forwarded_when_connected() {
        let msg = InboundMessage::new("555@s.whatsapp.net", MessageContent::text("hi"), false);
        let mut m = machine();
        assert!(m.handle(MachineInput::Inbound(msg.clone())).is_empty());

        m.handle(closed(CloseReason::CONNECTION_LOST));
        assert!(m.handle(MachineInput::Inbound(msg.clone())).is_empty());

        m.handle(MachineInput::ReconnectDue);
        m.handle(opened());
        assert_eq!(m.handle(MachineInput::Inbound(msg.clone())), vec![Action::Forward(msg)]);
    }

    #[test]
    fn test_disconnect_modes() {
        let mut m = machine();
        m.handle(opened());
        let actions = m.handle(MachineInput::Disconnect(DisconnectMode::Logout));
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(actions.contains(&Action::CancelReconnect));
        assert!(actions.contains(&Action::ClearCredentials));
        assert_eq!(actions.last(), Some(&Action::Finish(SessionEnd::Disconnected)));

        let mut m = machine();
        m.handle(closed(CloseReason::CONNECTION_LOST));
        let actions = m.handle(MachineInput::Disconnect(DisconnectMode::Shutdown));
        assert!(actions.contains(&Action::CancelReconnect));
        assert!(!actions.contains(&Action::ClearCredentials));

        // 终态下再次断开无动作
        assert!(m.handle(MachineInput::Disconnect(DisconnectMode::Logout)).is_empty());
    }
}
