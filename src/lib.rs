//! Bee Relay - 多租户 WhatsApp 会话编排网关
//!
//! 模块划分：
//! - **api**: 控制面 HTTP API（创建 / 状态 / 断开 / 列表 / 健康检查）
//! - **auth**: 租户凭证持久化
//! - **backend**: AI 后端客户端（超时 + 兜底回复）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、延时调度、优雅关闭
//! - **inbound**: 入站消息过滤与转发
//! - **observability**: tracing 初始化
//! - **protocol**: 协议层接缝（sidecar 桥接 / Mock）
//! - **provisioning**: 扫码配对码广播与 WebSocket 推送
//! - **session**: 会话状态机、发送队列、重连策略、注册表

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod core;
pub mod inbound;
pub mod observability;
pub mod protocol;
pub mod provisioning;
pub mod session;

pub use config::{load_config, AppConfig};
pub use session::{SessionRegistry, SessionState, WhatsAppSession};
