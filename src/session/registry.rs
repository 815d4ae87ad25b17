//! 会话注册表
//!
//! 进程内唯一的 租户 ID → 会话 映射。会话失败后从表中移除，但保留一条墓碑记录，
//! 让状态查询能回答 failed 而不是 404。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::actor::{SessionContext, SessionExit, SessionObserver, SessionStatus, Tenant, WhatsAppSession};
use super::machine::{DisconnectMode, SessionEnd, SessionState};
use crate::auth::is_valid_tenant_id;
use crate::core::RelayError;

/// create 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    Exists,
}

/// 配对状态查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisioningStatus {
    Connected,
    QrReady { code: String },
    Initializing,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub tenant_id: String,
    pub business_name: String,
    pub state: SessionState,
    pub connected: bool,
    pub retry_count: u32,
    pub queue_length: usize,
}

impl From<SessionStatus> for SessionSummary {
    fn from(s: SessionStatus) -> Self {
        Self {
            connected: s.state == SessionState::Connected,
            tenant_id: s.tenant_id,
            business_name: s.business_name,
            state: s.state,
            retry_count: s.retry_count,
            queue_length: s.queue_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHealth {
    pub active_sessions: usize,
}

#[derive(Default)]
struct RegistryState {
    sessions: RwLock<HashMap<String, Arc<WhatsAppSession>>>,
    /// 失败原因，按租户保留到下一次 create / disconnect
    tombstones: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl SessionObserver for RegistryState {
    async fn on_session_end(&self, exit: SessionExit) {
        let mut sessions = self.sessions.write().await;
        // 只移除同一实例，避免误删已被重新创建的会话
        let same = sessions
            .get(&exit.tenant_id)
            .is_some_and(|s| s.instance_id() == exit.instance_id);
        if !same {
            return;
        }
        if let SessionEnd::Failed(cause) = exit.end {
            self.tombstones
                .write()
                .await
                .insert(exit.tenant_id.clone(), cause.as_str().to_string());
            tracing::warn!(tenant_id = %exit.tenant_id, "session removed after failure: {}", cause.as_str());
        }
        sessions.remove(&exit.tenant_id);
    }
}

pub struct SessionRegistry {
    ctx: SessionContext,
    state: Arc<RegistryState>,
    /// 同一租户的 create / disconnect 串行执行；断开期间旧会话留在表中直到 actor 退出
    lifecycle: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            state: Arc::new(RegistryState::default()),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_tenant(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .lifecycle
            .lock()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// 幂等创建：已存在的会话（任何非终止状态）原样返回
    pub async fn create(
        &self,
        tenant_id: &str,
        business_name: &str,
    ) -> Result<(CreateOutcome, Arc<WhatsAppSession>), RelayError> {
        let tenant_id = tenant_id.trim();
        if !is_valid_tenant_id(tenant_id) {
            return Err(RelayError::InvalidTenantId);
        }

        let _guard = self.lock_tenant(tenant_id).await;
        let mut sessions = self.state.sessions.write().await;
        if let Some(existing) = sessions.get(tenant_id) {
            if !existing.is_finished() {
                tracing::debug!(tenant_id = %tenant_id, "session already exists");
                return Ok((CreateOutcome::Exists, existing.clone()));
            }
        }

        self.state.tombstones.write().await.remove(tenant_id);
        let session = WhatsAppSession::spawn(
            Tenant::new(tenant_id, business_name),
            self.ctx.clone(),
            self.state.clone(),
        );
        sessions.insert(tenant_id.to_string(), session.clone());
        tracing::info!(tenant_id = %tenant_id, "session created ({} active)", sessions.len());
        Ok((CreateOutcome::Created, session))
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Arc<WhatsAppSession>, RelayError> {
        self.state
            .sessions
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(tenant_id.to_string()))
    }

    pub async fn provisioning_status(&self, tenant_id: &str) -> Result<ProvisioningStatus, RelayError> {
        if let Ok(session) = self.get(tenant_id).await {
            let status = session.status().await;
            return Ok(match (status.state, status.provisioning_code) {
                (SessionState::Connected, _) => ProvisioningStatus::Connected,
                (SessionState::QrPending, Some(code)) => ProvisioningStatus::QrReady { code },
                (SessionState::Failed, _) => ProvisioningStatus::Failed {
                    reason: status.end_reason.unwrap_or_default(),
                },
                _ => ProvisioningStatus::Initializing,
            });
        }
        match self.state.tombstones.read().await.get(tenant_id) {
            Some(reason) => Ok(ProvisioningStatus::Failed {
                reason: reason.clone(),
            }),
            None => Err(RelayError::SessionNotFound(tenant_id.to_string())),
        }
    }

    /// 运营方主动断开：登出并清除凭证，返回时旧会话已完全退出
    pub async fn disconnect(&self, tenant_id: &str) -> Result<(), RelayError> {
        let _guard = self.lock_tenant(tenant_id).await;
        let session = self.state.sessions.read().await.get(tenant_id).cloned();
        let had_tombstone = self.state.tombstones.write().await.remove(tenant_id).is_some();

        let Some(session) = session else {
            return if had_tombstone {
                Ok(())
            } else {
                Err(RelayError::SessionNotFound(tenant_id.to_string()))
            };
        };

        session.disconnect(DisconnectMode::Logout).await;
        let mut sessions = self.state.sessions.write().await;
        if sessions
            .get(tenant_id)
            .is_some_and(|s| s.instance_id() == session.instance_id())
        {
            sessions.remove(tenant_id);
        }
        tracing::info!(tenant_id = %tenant_id, "session disconnected by operator");
        Ok(())
    }

    /// 一致性快照：先复制句柄列表再逐个读取状态
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self.state.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(SessionSummary::from(session.status().await));
        }
        summaries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        summaries
    }

    pub async fn active_count(&self) -> usize {
        self.state.sessions.read().await.len()
    }

    pub async fn health(&self) -> RegistryHealth {
        RegistryHealth {
            active_sessions: self.active_count().await,
        }
    }

    /// 排空：取出所有会话并以 shutdown 模式断开（保留凭证），等待全部结束
    pub async fn shutdown_all(&self) -> usize {
        let sessions: Vec<_> = self.state.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        if count > 0 {
            tracing::info!("Draining {} sessions", count);
        }
        join_all(
            sessions
                .iter()
                .map(|s| s.disconnect(DisconnectMode::Shutdown)),
        )
        .await;
        count
    }
}
