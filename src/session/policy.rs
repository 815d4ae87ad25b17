//! 重连策略
//!
//! 纯函数：根据断开码与已重试次数决定「延时后重试」还是「终止」。

use std::time::Duration;

use crate::config::SessionSection;
use crate::protocol::CloseReason;

/// 策略决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry(Duration),
    Terminal(TerminalCause),
}

/// 终止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    /// 注销 / 取消授权，需要重新扫码
    Deauthorized,
    /// 重试预算耗尽
    RetriesExhausted,
}

impl TerminalCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalCause::Deauthorized => "logged_out",
            TerminalCause::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// 线性退避：第 n 次（从 0 计）重试等待 base * (n + 1)，不超过 max
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    terminal_codes: Vec<u16>,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::from_config(&SessionSection::default())
    }
}

impl ReconnectionPolicy {
    pub fn from_config(cfg: &SessionSection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms.max(cfg.backoff_base_ms)),
            terminal_codes: cfg.terminal_codes.clone(),
        }
    }

    pub fn is_terminal(&self, reason: CloseReason) -> bool {
        self.terminal_codes.contains(&reason.code())
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.backoff_base
            .saturating_mul(retry_count.saturating_add(1))
            .min(self.backoff_max)
    }

    /// 使用策略自身的 max_retries
    pub fn decide(&self, reason: CloseReason, retry_count: u32) -> ReconnectDecision {
        self.decide_with(reason, retry_count, self.max_retries)
    }

    pub fn decide_with(&self, reason: CloseReason, retry_count: u32, max_retries: u32) -> ReconnectDecision {
        if self.is_terminal(reason) {
            return ReconnectDecision::Terminal(TerminalCause::Deauthorized);
        }
        if retry_count >= max_retries {
            return ReconnectDecision::Terminal(TerminalCause::RetriesExhausted);
        }
        ReconnectDecision::Retry(self.delay_for(retry_count))
    }
}
