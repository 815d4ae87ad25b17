//! 租户会话
//!
//! - `machine`：纯状态机
//! - `policy`：重连策略
//! - `queue` / `outbox`：外发队列与发送节奏
//! - `actor`：每租户一个任务，执行状态机动作
//! - `registry`：进程内会话注册表

pub mod actor;
pub mod machine;
pub mod outbox;
pub mod policy;
pub mod queue;
pub mod registry;

pub use actor::{
    SendOutcome, SessionContext, SessionExit, SessionObserver, SessionStatus, Tenant, WhatsAppSession,
};
pub use machine::{Action, DisconnectMode, MachineInput, SessionEnd, SessionMachine, SessionState};
pub use outbox::{DrainReport, Outbox, Pacing};
pub use policy::{ReconnectDecision, ReconnectionPolicy, TerminalCause};
pub use queue::{MessageQueue, QueuedMessage};
pub use registry::{CreateOutcome, ProvisioningStatus, RegistryHealth, SessionRegistry, SessionSummary};
