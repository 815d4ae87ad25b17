//! HTTP 后端：POST {url}{path}，请求体为 ForwardRequest，响应体取 `ai_response`

use async_trait::async_trait;
use serde::Deserialize;

use super::{AiBackend, BackendError, ForwardRequest};
use crate::config::BackendSection;

#[derive(Debug, Deserialize)]
struct ProcessMessageResponse {
    ai_response: Option<String>,
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    endpoint: String,
}

impl HttpBackend {
    pub fn from_config(cfg: &BackendSection) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let base_url = cfg.url.trim_end_matches('/').to_string();
        let endpoint = format!("{}/{}", base_url, cfg.path.trim_start_matches('/'));
        Ok(Self {
            client,
            base_url,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AiBackend for HttpBackend {
    async fn reply(&self, request: &ForwardRequest) -> Result<String, BackendError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(BackendError::Status(resp.status().as_u16()));
        }

        let body: ProcessMessageResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        body.ai_response
            .ok_or_else(|| BackendError::Decode("missing ai_response".to_string()))
    }

    fn target(&self) -> String {
        self.base_url.clone()
    }
}
