//! Mock 后端（用于测试，无需 HTTP 服务）

use std::sync::Mutex;

use async_trait::async_trait;

use super::{AiBackend, BackendError, ForwardRequest};

enum Behavior {
    Reply(String),
    Echo,
    Fail,
    Hang,
}

/// 可配置行为的后端：固定回复 / 回显 / 失败 / 永不返回
pub struct MockBackend {
    behavior: Behavior,
    calls: Mutex<Vec<ForwardRequest>>,
}

impl MockBackend {
    fn with(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(reply: &str) -> Self {
        Self::with(Behavior::Reply(reply.to_string()))
    }

    /// 回复 `echo: <message>`
    pub fn echo() -> Self {
        Self::with(Behavior::Echo)
    }

    pub fn failing() -> Self {
        Self::with(Behavior::Fail)
    }

    pub fn hanging() -> Self {
        Self::with(Behavior::Hang)
    }

    /// 收到的全部请求
    pub fn calls(&self) -> Vec<ForwardRequest> {
        self.calls.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AiBackend for MockBackend {
    async fn reply(&self, request: &ForwardRequest) -> Result<String, BackendError> {
        if let Ok(mut v) = self.calls.lock() {
            v.push(request.clone());
        }
        match &self.behavior {
            Behavior::Reply(r) => Ok(r.clone()),
            Behavior::Echo => Ok(format!("echo: {}", request.message)),
            Behavior::Fail => Err(BackendError::Transport("mock failure".to_string())),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Err(BackendError::Timeout)
            }
        }
    }

    fn target(&self) -> String {
        "mock://backend".to_string()
    }
}
