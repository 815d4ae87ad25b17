//! AI 后端转发
//!
//! `AiBackend` 是传输层（HTTP 实现见 `http`），`BackendClient` 在其上加超时与兜底回复：
//! 任何失败都返回固定的致歉文本，调用方永远拿到一个可发送的字符串，且不做重试。

pub mod http;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::BackendSection;

pub use http::HttpBackend;
pub use mock::MockBackend;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend request timed out")]
    Timeout,

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("backend returned HTTP {0}")]
    Status(u16),

    #[error("backend response could not be decoded: {0}")]
    Decode(String),
}

/// 转发给后端的一条入站消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardRequest {
    pub tenant_id: String,
    /// 完整发送方地址
    #[serde(skip)]
    pub sender: String,
    /// 地址 `@` 前的部分
    pub customer_phone: String,
    pub message: String,
    pub message_type: String,
}

impl ForwardRequest {
    pub fn new(tenant_id: &str, sender: &str, text: &str) -> Self {
        let customer_phone = sender.split('@').next().unwrap_or(sender).to_string();
        Self {
            tenant_id: tenant_id.to_string(),
            sender: sender.to_string(),
            customer_phone,
            message: text.to_string(),
            message_type: "text".to_string(),
        }
    }

    pub fn with_message_type(mut self, message_type: &str) -> Self {
        self.message_type = message_type.to_string();
        self
    }
}

/// 后端传输接口
#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn reply(&self, request: &ForwardRequest) -> Result<String, BackendError>;

    /// 健康检查里展示的目标地址
    fn target(&self) -> String;
}

/// 带超时与兜底的后端客户端
pub struct BackendClient {
    backend: Arc<dyn AiBackend>,
    timeout: Duration,
    fallback_reply: String,
}

impl BackendClient {
    pub fn new(backend: Arc<dyn AiBackend>, timeout: Duration, fallback_reply: impl Into<String>) -> Self {
        Self {
            backend,
            timeout,
            fallback_reply: fallback_reply.into(),
        }
    }

    pub fn from_config(cfg: &BackendSection, backend: Arc<dyn AiBackend>) -> Self {
        Self::new(backend, cfg.timeout(), cfg.fallback_reply.clone())
    }

    pub fn target(&self) -> String {
        self.backend.target()
    }

    /// 转发文本消息并返回回复
    pub async fn forward(&self, tenant_id: &str, sender: &str, text: &str) -> String {
        self.forward_request(ForwardRequest::new(tenant_id, sender, text)).await
    }

    /// 失败（超时 / 传输 / 状态码 / 解码）时返回兜底回复；空字符串表示后端无需回复
    pub async fn forward_request(&self, request: ForwardRequest) -> String {
        let result = match tokio::time::timeout(self.timeout, self.backend.reply(&request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    tenant_id = %request.tenant_id,
                    "backend call failed for {}, using fallback: {}",
                    request.customer_phone,
                    e
                );
                self.fallback_reply.clone()
            }
        }
    }
}
