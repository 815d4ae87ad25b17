//! 优雅关闭
//!
//! 关闭分两段：先取消 token，让推送通道和控制 API 停止接入；
//! 再按注册顺序执行排空步骤，每步有独立超时。会话以 shutdown 模式断开，凭证保留。

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

/// 触发关闭的原因，只记录第一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 控制 API 异常退出
    ServerError(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt (Ctrl+C)"),
            ShutdownReason::Terminate => f.write_str("terminate (SIGTERM)"),
            ShutdownReason::ServerError(e) => write!(f, "control API error: {}", e),
        }
    }
}

/// 关闭信号：一个取消 token 加上首个关闭原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 监听循环持有的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；返回 false 表示此前已有原因，本次原因被忽略
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    /// Ctrl+C 与 SIGTERM（unix）都会触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C");
                manager.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM");
                        manager.trigger(ShutdownReason::Terminate);
                    }
                    Err(e) => tracing::warn!("SIGTERM handler not installed: {}", e),
                }
            });
        }
    }
}

/// 关闭阶段的一个排空步骤
#[async_trait]
pub trait DrainStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// 单个步骤的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Failed(String),
    TimedOut,
}

/// 顺序执行排空步骤；某一步失败或超时不影响后续步骤
pub struct ShutdownSequence {
    steps: Vec<Box<dyn DrainStep>>,
    step_timeout: Duration,
}

impl ShutdownSequence {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            step_timeout,
        }
    }

    pub fn then(mut self, step: impl DrainStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(&self) -> Vec<(&'static str, StepOutcome)> {
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let outcome = match tokio::time::timeout(self.step_timeout, step.run()).await {
                Ok(Ok(())) => StepOutcome::Done,
                Ok(Err(e)) => {
                    tracing::warn!("Shutdown step '{}' failed: {:#}", step.name(), e);
                    StepOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::warn!("Shutdown step '{}' timed out after {:?}", step.name(), self.step_timeout);
                    StepOutcome::TimedOut
                }
            };
            outcomes.push((step.name(), outcome));
        }
        outcomes
    }
}

/// 以 shutdown 模式断开注册表中的全部会话
pub struct SessionDrain {
    registry: Arc<SessionRegistry>,
}

impl SessionDrain {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DrainStep for SessionDrain {
    fn name(&self) -> &'static str {
        "sessions"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let drained = self.registry.shutdown_all().await;
        tracing::info!("Drained {} sessions", drained);
        Ok(())
    }
}
