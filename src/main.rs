//! Bee Relay 入口
//!
//! 加载配置 → 启动扫码推送与控制 API → 等待关闭信号 → 排空所有会话。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bee_relay::api::{create_router, ApiState};
use bee_relay::auth::FileAuthStore;
use bee_relay::backend::{BackendClient, HttpBackend};
use bee_relay::config::{load_config, AppConfig};
use bee_relay::core::{SessionDrain, ShutdownManager, ShutdownReason, ShutdownSequence};
use bee_relay::protocol::BridgeConnector;
use bee_relay::provisioning::{ProvisioningBroadcaster, PushServer};
use bee_relay::session::{SessionContext, SessionRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bee_relay::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
    };

    std::fs::create_dir_all(&cfg.auth.dir)
        .with_context(|| format!("Failed to create auth dir {}", cfg.auth.dir.display()))?;

    let http_backend = HttpBackend::from_config(&cfg.backend).context("Failed to build backend client")?;
    let backend = Arc::new(BackendClient::from_config(&cfg.backend, Arc::new(http_backend)));
    let broadcaster = ProvisioningBroadcaster::default();
    let ctx = SessionContext::from_config(
        &cfg,
        Arc::new(BridgeConnector::from_config(&cfg.protocol)),
        Arc::new(FileAuthStore::new(&cfg.auth.dir)),
        backend.clone(),
        broadcaster.clone(),
    );
    let registry = Arc::new(SessionRegistry::new(ctx));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let push = PushServer::bind(&cfg.server.push_bind, broadcaster)
        .await
        .with_context(|| format!("Failed to bind push server on {}", cfg.server.push_bind))?;
    let push_task = tokio::spawn(push.run(shutdown.token()));

    let state = Arc::new(ApiState {
        registry: registry.clone(),
        backend_target: backend.target(),
    });
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("Failed to bind control API on {}", cfg.server.bind))?;
    tracing::info!("Control API listening on http://{}", cfg.server.bind);
    tracing::info!("AI backend: {}", backend.target());

    let token = shutdown.token();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
    {
        tracing::error!("Control API failed: {}", e);
        shutdown.trigger(ShutdownReason::ServerError(e.to_string()));
    }

    if let Some(reason) = shutdown.reason() {
        tracing::info!("Shutting down: {}", reason);
    }
    ShutdownSequence::new(Duration::from_secs(cfg.shutdown.timeout_secs))
        .then(SessionDrain::new(registry))
        .run()
        .await;

    let _ = push_task.await;
    tracing::info!("Bee Relay stopped");

    if let Some(ShutdownReason::ServerError(e)) = shutdown.reason() {
        anyhow::bail!("control API failed: {}", e);
    }
    Ok(())
}
