//! 协议 sidecar 连接器
//!
//! 握手、加密、编码都在外部 sidecar 进程里完成，这里每个租户开一条 WebSocket
//! （`{bridge_url}/tenants/{tenant_id}`），用 JSON 文本帧交换命令与事件。
//!
//! 发往 sidecar：`start` / `send` / `presence` / `close`（字段 `op`）
//! 来自 sidecar：`qr` / `open` / `close` / `creds` / `message` / `ack`（字段 `event`）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::{
    CloseReason, Connection, ConnectionEvent, Connector, InboundMessage, MediaAttachment, MediaKind, MessageContent,
    Presence, ProtocolConnection, ProtocolError, ProtocolEvent,
};
use crate::auth::{is_valid_tenant_id, AuthBlob};
use crate::config::ProtocolSection;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Outgoing<'a> {
    Start { auth: serde_json::Value },
    Send { id: u64, to: &'a str, text: &'a str },
    Presence { to: &'a str, state: Presence },
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Incoming {
    Qr {
        code: String,
    },
    Open,
    Close {
        code: u16,
    },
    Creds {
        auth: serde_json::Value,
    },
    Message {
        from: String,
        #[serde(default, rename = "fromMe")]
        from_me: bool,
        #[serde(default)]
        content: RawContent,
    },
    Ack {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContent {
    conversation: Option<String>,
    extended_text_message: Option<RawText>,
    image_message: Option<RawMedia>,
    video_message: Option<RawMedia>,
    audio_message: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawText {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMedia {
    caption: Option<String>,
}

impl From<RawContent> for MessageContent {
    fn from(raw: RawContent) -> Self {
        let text = raw
            .conversation
            .or_else(|| raw.extended_text_message.and_then(|m| m.text));
        let media = match (raw.image_message, raw.video_message) {
            (Some(img), _) => Some(MediaAttachment {
                kind: MediaKind::Image,
                caption: img.caption,
            }),
            (None, Some(vid)) => Some(MediaAttachment {
                kind: MediaKind::Video,
                caption: vid.caption,
            }),
            (None, None) => None,
        };
        MessageContent {
            text,
            media,
            voice_note: raw.audio_message.is_some(),
        }
    }
}

type AckSender = oneshot::Sender<Result<(), String>>;

/// 通过 sidecar 建立租户连接
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    base_url: String,
    send_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(base_url: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            send_timeout,
        }
    }

    pub fn from_config(cfg: &ProtocolSection) -> Self {
        Self::new(cfg.bridge_url.clone(), Duration::from_secs(cfg.send_timeout_secs))
    }

    /// 租户 ID 原样作为路径段，因此只接受 URL 安全字符集
    pub fn tenant_url(&self, tenant_id: &str) -> Result<String, ProtocolError> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(ProtocolError::Connect(format!("invalid tenant id {:?}", tenant_id)));
        }
        Ok(format!("{}/tenants/{}", self.base_url, tenant_id))
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, tenant_id: &str, auth: Option<AuthBlob>) -> Result<Connection, ProtocolError> {
        let url = self.tenant_url(tenant_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ProtocolError::Connect(format!("{}: {}", url, e)))?;
        let (mut write, mut read) = ws_stream.split();

        let auth = match auth {
            Some(blob) => serde_json::from_slice::<serde_json::Value>(&blob).unwrap_or_else(|e| {
                tracing::warn!(tenant_id = %tenant_id, "stored credentials are not valid JSON, ignoring: {}", e);
                serde_json::Value::Null
            }),
            None => serde_json::Value::Null,
        };
        let start = serde_json::to_string(&Outgoing::Start { auth })
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        write
            .send(WsMessage::Text(start))
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: Arc<Mutex<HashMap<u64, AckSender>>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // 写任务
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let is_close = matches!(frame, WsMessage::Close(_));
                if write.send(frame).await.is_err() || is_close {
                    break;
                }
            }
        });

        // 读任务
        let tenant = tenant_id.to_string();
        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut close_reported = false;
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(t)) => t,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(tenant_id = %tenant, "bridge socket error: {}", e);
                        break;
                    }
                };
                let incoming: Incoming = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(tenant_id = %tenant, "unrecognized bridge frame: {}", e);
                        continue;
                    }
                };
                let event = match incoming {
                    Incoming::Qr { code } => ProtocolEvent::Connection(ConnectionEvent::ProvisioningCodeIssued(code)),
                    Incoming::Open => ProtocolEvent::Connection(ConnectionEvent::Opened),
                    Incoming::Close { code } => {
                        close_reported = true;
                        ProtocolEvent::Connection(ConnectionEvent::Closed(CloseReason(code)))
                    }
                    Incoming::Creds { auth } => match serde_json::to_vec(&auth) {
                        Ok(blob) => ProtocolEvent::CredentialsUpdated(blob),
                        Err(e) => {
                            tracing::warn!(tenant_id = %tenant, "could not encode credentials: {}", e);
                            continue;
                        }
                    },
                    Incoming::Message { from, from_me, content } => {
                        ProtocolEvent::Inbound(InboundMessage::new(from, content.into(), from_me))
                    }
                    Incoming::Ack { id, ok, error } => {
                        let waiter = reader_pending.lock().ok().and_then(|mut p| p.remove(&id));
                        if let Some(waiter) = waiter {
                            let result = if ok {
                                Ok(())
                            } else {
                                Err(error.unwrap_or_else(|| "rejected by bridge".to_string()))
                            };
                            let _ = waiter.send(result);
                        }
                        continue;
                    }
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }

            // 未确认的发送全部失败（丢弃 sender 即可）
            if let Ok(mut p) = reader_pending.lock() {
                p.clear();
            }
            let was_closed = reader_closed.swap(true, Ordering::SeqCst);
            if !was_closed && !close_reported {
                tracing::info!(tenant_id = %tenant, "bridge socket dropped");
                let _ = event_tx.send(ProtocolEvent::Connection(ConnectionEvent::Closed(
                    CloseReason::CONNECTION_CLOSED,
                )));
            }
        });

        tracing::info!(tenant_id = %tenant_id, "bridge connected: {}", url);
        let handle = BridgeConnection {
            frames: frame_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            send_timeout: self.send_timeout,
        };
        Ok(Connection {
            handle: Arc::new(handle),
            events: event_rx,
        })
    }
}

struct BridgeConnection {
    frames: mpsc::UnboundedSender<WsMessage>,
    pending: Arc<Mutex<HashMap<u64, AckSender>>>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    send_timeout: Duration,
}

impl BridgeConnection {
    fn push(&self, op: &Outgoing<'_>) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        let text = serde_json::to_string(op).map_err(|e| ProtocolError::Send(e.to_string()))?;
        self.frames
            .send(WsMessage::Text(text))
            .map_err(|_| ProtocolError::Closed)
    }
}

#[async_trait]
impl ProtocolConnection for BridgeConnection {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, tx);
        }
        if let Err(e) = self.push(&Outgoing::Send {
            id,
            to: recipient,
            text,
        }) {
            if let Ok(mut p) = self.pending.lock() {
                p.remove(&id);
            }
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(ProtocolError::Send(reason)),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                Err(ProtocolError::Timeout)
            }
        }
    }

    async fn send_presence(&self, recipient: &str, presence: Presence) -> Result<(), ProtocolError> {
        self.push(&Outgoing::Presence {
            to: recipient,
            state: presence,
        })
    }

    async fn close(&self) {
        if self.push(&Outgoing::Close).is_ok() {
            let _ = self.frames.send(WsMessage::Close(None));
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    async fn sidecar() -> (BridgeConnector, tokio::task::JoinHandle<ServerWs>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let connector = BridgeConnector::new(format!("ws://{}/", addr), Duration::from_secs(5));
        (connector, server)
    }

    async fn next_json(ws: &mut ServerWs) -> serde_json::Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(t) => return serde_json::from_str(&t).unwrap(),
                _ => continue,
            }
        }
    }

    async fn push_json(ws: &mut ServerWs, value: serde_json::Value) {
        ws.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    #[test]
    fn test_tenant_url() {
        let c = BridgeConnector::new("ws://127.0.0.1:3010/", Duration::from_secs(1));
        assert_eq!(c.tenant_url("T1").unwrap(), "ws://127.0.0.1:3010/tenants/T1");
        for bad in ["../escape", "a/b", "a b", "t?x=1", "t#frag"] {
            assert!(matches!(c.tenant_url(bad), Err(ProtocolError::Connect(_))), "{bad}");
        }
    }

    #[test]
    fn test_raw_content_mapping() {
        let raw: RawContent = serde_json::from_value(serde_json::json!({
            "extendedTextMessage": {"text": "hello"},
            "imageMessage": {"caption": "pic"}
        }))
        .unwrap();
        let content = MessageContent::from(raw);
        assert_eq!(content.text.as_deref(), Some("hello"));
        assert_eq!(content.media.unwrap().kind, MediaKind::Image);

        let raw: RawContent = serde_json::from_value(serde_json::json!({"audioMessage": {}})).unwrap();
        assert!(MessageContent::from(raw).voice_note);
    }

    #[tokio::test]
    async fn test_events_and_acked_send() {
        let (connector, server) = sidecar().await;
        let mut conn = connector.connect("T1", Some(b"{\"me\":\"x\"}".to_vec())).await.unwrap();
        let mut ws = server.await.unwrap();

        let start = next_json(&mut ws).await;
        assert_eq!(start, serde_json::json!({"op": "start", "auth": {"me": "x"}}));

        push_json(&mut ws, serde_json::json!({"event": "qr", "code": "ABC123"})).await;
        push_json(&mut ws, serde_json::json!({"event": "open"})).await;
        push_json(
            &mut ws,
            serde_json::json!({"event": "message", "from": "c@s.whatsapp.net", "fromMe": false, "content": {"conversation": "hi"}}),
        )
        .await;

        assert_eq!(
            conn.events.recv().await.unwrap(),
            ProtocolEvent::Connection(ConnectionEvent::ProvisioningCodeIssued("ABC123".into()))
        );
        assert_eq!(
            conn.events.recv().await.unwrap(),
            ProtocolEvent::Connection(ConnectionEvent::Opened)
        );
        assert_eq!(
            conn.events.recv().await.unwrap(),
            ProtocolEvent::Inbound(InboundMessage::new("c@s.whatsapp.net", MessageContent::text("hi"), false))
        );

        let handle = conn.handle.clone();
        let send = tokio::spawn(async move { handle.send("c@s.whatsapp.net", "reply").await });
        let op = next_json(&mut ws).await;
        assert_eq!(op["op"], "send");
        assert_eq!(op["to"], "c@s.whatsapp.net");
        assert_eq!(op["text"], "reply");
        push_json(&mut ws, serde_json::json!({"event": "ack", "id": op["id"], "ok": true})).await;
        assert_eq!(send.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_socket_reports_transient_close() {
        let (connector, server) = sidecar().await;
        let mut conn = connector.connect("T1", None).await.unwrap();
        let mut ws = server.await.unwrap();
        assert_eq!(next_json(&mut ws).await["auth"], serde_json::Value::Null);
        drop(ws);

        assert_eq!(
            conn.events.recv().await.unwrap(),
            ProtocolEvent::Connection(ConnectionEvent::Closed(CloseReason::CONNECTION_CLOSED))
        );
        assert_eq!(
            conn.handle.send("c@s.whatsapp.net", "late").await,
            Err(ProtocolError::Closed)
        );
    }
}
