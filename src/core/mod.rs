//! 核心基础设施：错误、延时调度、优雅关闭

pub mod error;
pub mod scheduler;
pub mod shutdown;

pub use error::RelayError;
pub use scheduler::{schedule_cancellable, ImmediateScheduler, Scheduler, TokioScheduler};
pub use shutdown::{DrainStep, SessionDrain, ShutdownManager, ShutdownReason, ShutdownSequence, StepOutcome};
