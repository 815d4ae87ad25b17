//! 控制 API（HTTP）
//!
//! - `GET  /health`
//! - `POST /session/create`            body: `{tenantId, businessName?}`
//! - `GET  /session/qr/:tenantId`      配对状态
//! - `POST /session/disconnect/:tenantId`
//! - `GET  /sessions`

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::RelayError;
use crate::session::{CreateOutcome, ProvisioningStatus, SessionRegistry, SessionState, SessionSummary};

/// API 共享状态
pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
    /// 健康检查里回显的后端地址
    pub backend_target: String,
}

/// API 错误：统一返回 `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        let status = match e {
            RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidTenantId => StatusCode::BAD_REQUEST,
            RelayError::SessionClosed(_) => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// 字符串或数字
    #[serde(default)]
    pub tenant_id: Option<serde_json::Value>,
    #[serde(default)]
    pub business_name: Option<String>,
}

impl CreateSessionRequest {
    fn tenant_id(&self) -> Option<String> {
        let id = match self.tenant_id.as_ref()? {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub status: CreateOutcome,
    pub tenant_id: String,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub total: usize,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub backend_target: String,
}

/// 创建控制 API 路由
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session/create", post(create_session))
        .route("/session/qr/:tenant_id", get(session_status))
        .route("/session/disconnect/:tenant_id", post(disconnect_session))
        .route("/sessions", get(list_sessions))
        .with_state(state)
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let health = state.registry.health().await;
    Json(HealthResponse {
        status: "healthy",
        active_sessions: health.active_sessions,
        backend_target: state.backend_target.clone(),
    })
}

async fn create_session(
    State(state): State<Arc<ApiState>>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let Some(Json(req)) = body else {
        return Err(ApiError::bad_request("tenantId is required"));
    };
    let tenant_id = req
        .tenant_id()
        .ok_or_else(|| ApiError::bad_request("tenantId is required"))?;
    let business_name = req
        .business_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("Business {}", tenant_id));

    let (outcome, session) = state.registry.create(&tenant_id, &business_name).await?;
    let connected = session.state().await == SessionState::Connected;
    tracing::info!(tenant_id = %tenant_id, "create session: {:?}", outcome);
    Ok(Json(CreateSessionResponse {
        status: outcome,
        tenant_id,
        connected,
    }))
}

async fn session_status(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<ProvisioningStatus>, ApiError> {
    Ok(Json(state.registry.provisioning_status(&tenant_id).await?))
}

async fn disconnect_session(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.registry.disconnect(&tenant_id).await?;
    Ok(Json(serde_json::json!({ "status": "disconnected", "tenantId": tenant_id })))
}

async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<SessionList> {
    let sessions = state.registry.list().await;
    Json(SessionList {
        total: sessions.len(),
        sessions,
    })
}
