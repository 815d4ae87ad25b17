//! 扫码推送 WebSocket 服务
//!
//! 每个连接订阅广播器，把事件以 JSON 文本帧写出；客户端发来的帧只记录日志。

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::ProvisioningBroadcaster;

pub struct PushServer {
    listener: TcpListener,
    broadcaster: ProvisioningBroadcaster,
}

impl PushServer {
    pub async fn bind(addr: &str, broadcaster: ProvisioningBroadcaster) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            broadcaster,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接直到 token 被取消
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Provisioning push listening on ws://{}", addr);
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let rx = self.broadcaster.subscribe();
                            let token = shutdown.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_subscriber(stream, addr, rx, token).await {
                                    tracing::warn!("push subscriber {} error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("push accept error: {}", e);
                        }
                    }
                }
            }
        }
        tracing::info!("Provisioning push stopped");
    }
}

async fn handle_subscriber(
    stream: TcpStream,
    addr: SocketAddr,
    mut rx: broadcast::Receiver<super::ProvisioningEvent>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    tracing::info!("New provisioning subscriber from {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break;
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let json = serde_json::to_string(&event).map_err(|e| e.to_string())?;
                        if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("push subscriber {} lagged, skipped {} events", addr, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(v) => tracing::debug!("push subscriber {} sent: {}", addr, v),
                            Err(e) => tracing::debug!("push subscriber {} sent invalid JSON: {}", addr, e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("push subscriber {} receive error: {}", addr, e);
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Provisioning subscriber closed: {}", addr);
    Ok(())
}
