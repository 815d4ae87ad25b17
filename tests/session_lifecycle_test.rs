//! 会话生命周期集成测试：Mock 协议 + Mock 后端 + 内存凭证，延时全部走 ImmediateScheduler

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bee_relay::auth::{AuthStateStore, MemoryAuthStore};
use bee_relay::backend::{BackendClient, MockBackend};
use bee_relay::core::{ImmediateScheduler, Scheduler, SessionDrain, ShutdownSequence, StepOutcome, TokioScheduler};
use bee_relay::inbound::VOICE_NOTE_PLACEHOLDER;
use bee_relay::protocol::{CloseReason, InboundMessage, MessageContent, MockConnector};
use bee_relay::provisioning::{ProvisioningBroadcaster, ProvisioningEvent};
use bee_relay::session::{
    ProvisioningStatus, ReconnectionPolicy, SessionContext, SessionRegistry, SessionState,
};

const CUSTOMER: &str = "237690000000@s.whatsapp.net";

struct Harness {
    registry: Arc<SessionRegistry>,
    connector: Arc<MockConnector>,
    auth: Arc<MemoryAuthStore>,
    backend: Arc<MockBackend>,
    broadcaster: ProvisioningBroadcaster,
    scheduler: ImmediateScheduler,
}

fn harness_with(backend: MockBackend, timeout: Duration, scheduler: Option<Arc<dyn Scheduler>>) -> Harness {
    let connector = Arc::new(MockConnector::new());
    let auth = Arc::new(MemoryAuthStore::new());
    let backend = Arc::new(backend);
    let broadcaster = ProvisioningBroadcaster::default();
    let immediate = ImmediateScheduler::new();
    let client = Arc::new(BackendClient::new(backend.clone(), timeout, "Un conseiller va vous répondre."));
    let ctx = SessionContext::new(connector.clone(), auth.clone(), client, broadcaster.clone())
        .with_scheduler(scheduler.unwrap_or_else(|| Arc::new(immediate.clone()) as Arc<dyn Scheduler>));
    Harness {
        registry: Arc::new(SessionRegistry::new(ctx)),
        connector,
        auth,
        backend,
        broadcaster,
        scheduler: immediate,
    }
}

fn harness() -> Harness {
    harness_with(MockBackend::echo(), Duration::from_secs(15), None)
}

/// 轮询直到条件成立
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..2000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition never held: {}", what);
}

async fn wait_state(h: &Harness, tenant: &str, state: SessionState) {
    eventually(&format!("{} reaches {:?}", tenant, state), || async move {
        match h.registry.get(tenant).await {
            Ok(s) => s.state().await == state,
            Err(_) => false,
        }
    })
    .await;
}

#[tokio::test]
async fn test_provisioning_code_reaches_subscriber_then_connects() {
    let h = &harness();
    let mut observer = h.broadcaster.subscribe();

    h.registry.create("T1", "Boutique Akwa").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_code("ABC123");

    let event = tokio::time::timeout(Duration::from_secs(5), observer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ProvisioningEvent::Qr {
            tenant_id: "T1".into(),
            business_name: "Boutique Akwa".into(),
            code: "ABC123".into(),
        }
    );
    assert_eq!(
        h.registry.provisioning_status("T1").await.unwrap(),
        ProvisioningStatus::QrReady { code: "ABC123".into() }
    );

    conn.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;
    assert_eq!(
        h.registry.provisioning_status("T1").await.unwrap(),
        ProvisioningStatus::Connected
    );
}

#[tokio::test]
async fn test_queued_messages_flush_in_order_after_open() {
    let h = &harness();
    let (_, session) = h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();

    for i in 1..=5 {
        session.send(CUSTOMER, &format!("message {}", i)).await.unwrap();
    }
    assert_eq!(session.status().await.queue_length, 5);
    assert!(conn.sent().is_empty());

    conn.emit_open();
    let sent = conn.wait_for_sent(5).await;
    let texts: Vec<_> = sent.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(texts, vec!["message 1", "message 2", "message 3", "message 4", "message 5"]);
    let session = &session;
    eventually("queue drained", || async move { session.status().await.queue_length == 0 }).await;

    // 每条消息一次输入延时，相邻消息之间一次节奏延时
    let requested = h.scheduler.requested();
    assert_eq!(requested.len(), 9);
}

#[tokio::test]
async fn test_transient_closes_exhaust_retries_then_fail() {
    let h = &harness();
    h.registry.create("T1", "B").await.unwrap();

    for i in 0..4 {
        let conn = h.connector.connection(i).await.unwrap();
        conn.emit_close(CloseReason::CONNECTION_LOST);
    }

    eventually("failed status", || async move {
        h.registry.provisioning_status("T1").await
            == Ok(ProvisioningStatus::Failed {
                reason: "retries_exhausted".into(),
            })
    })
    .await;
    assert_eq!(h.connector.connect_count(), 4);
    assert_eq!(
        h.scheduler.requested(),
        vec![Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(15)]
    );
    assert!(h.registry.get("T1").await.is_err());
    assert_eq!(h.registry.health().await.active_sessions, 0);
}

#[tokio::test]
async fn test_connect_failures_count_against_retry_budget() {
    let h = &harness();
    h.connector.set_fail_connects(true);
    h.registry.create("T1", "B").await.unwrap();

    eventually("failed status", || async move {
        matches!(
            h.registry.provisioning_status("T1").await,
            Ok(ProvisioningStatus::Failed { .. })
        )
    })
    .await;
    assert_eq!(h.connector.attempt_count(), 4);
    assert_eq!(h.connector.connect_count(), 0);
}

#[tokio::test]
async fn test_logout_fails_without_retry_and_clears_credentials() {
    let h = &harness();
    h.auth.save("T1", b"{\"creds\":true}").await.unwrap();
    h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;

    conn.emit_close(CloseReason::LOGGED_OUT);
    eventually("logged out", || async move {
        h.registry.provisioning_status("T1").await
            == Ok(ProvisioningStatus::Failed {
                reason: "logged_out".into(),
            })
    })
    .await;
    assert_eq!(h.connector.attempt_count(), 1);
    assert!(h.scheduler.requested().is_empty());
    assert!(!h.auth.contains("T1").await);
}

#[tokio::test]
async fn test_inbound_text_is_answered_and_noise_is_filtered() {
    let h = &harness();
    h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;

    conn.emit_inbound(InboundMessage::new("1203630@g.us", MessageContent::text("group chatter"), false));
    conn.emit_inbound(InboundMessage::new("status@broadcast", MessageContent::text("story"), false));
    conn.emit_inbound(InboundMessage::new(CUSTOMER, MessageContent::text("my own"), true));
    conn.emit_inbound(InboundMessage::new(CUSTOMER, MessageContent::none(), false));
    conn.emit_inbound(InboundMessage::new(CUSTOMER, MessageContent::text("Bonjour"), false));

    let sent = conn.wait_for_sent(1).await;
    assert_eq!(sent, vec![(CUSTOMER.to_string(), "echo: Bonjour".to_string())]);

    let calls = h.backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tenant_id, "T1");
    assert_eq!(calls[0].message, "Bonjour");
    assert_eq!(calls[0].message_type, "text");
}

#[tokio::test]
async fn test_empty_backend_reply_sends_nothing() {
    let h = &harness_with(MockBackend::replying(""), Duration::from_secs(15), None);
    let (_, session) = h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;

    conn.emit_inbound(InboundMessage::new(CUSTOMER, MessageContent::text("merci"), false));
    eventually("backend called", || async move { h.backend.calls().len() == 1 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(conn.sent().is_empty());
    assert!(conn.presence_updates().is_empty());
    assert_eq!(session.status().await.queue_length, 0);
}

#[tokio::test]
async fn test_voice_note_forwards_placeholder() {
    let h = &harness();
    h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;

    conn.emit_inbound(InboundMessage::new(CUSTOMER, MessageContent::voice_note(), false));
    let sent = conn.wait_for_sent(1).await;
    assert_eq!(sent[0].1, format!("echo: {}", VOICE_NOTE_PLACEHOLDER));
}

#[tokio::test]
async fn test_backend_timeout_sends_fallback() {
    let h = &harness_with(MockBackend::hanging(), Duration::from_millis(50), None);
    h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;

    conn.emit_inbound(InboundMessage::new(CUSTOMER, MessageContent::text("Allô ?"), false));
    let sent = conn.wait_for_sent(1).await;
    assert_eq!(sent[0], (CUSTOMER.to_string(), "Un conseiller va vous répondre.".to_string()));
}

#[tokio::test]
async fn test_inbound_during_reconnect_is_ignored() {
    // 真实定时器 + 长退避：会话停留在 Reconnecting
    let h = &harness_with(MockBackend::echo(), Duration::from_secs(15), Some(Arc::new(TokioScheduler) as Arc<dyn Scheduler>));
    h.registry.create("T2", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_open();
    wait_state(h, "T2", SessionState::Connected).await;

    conn.emit_close(CloseReason::CONNECTION_LOST);
    wait_state(h, "T2", SessionState::Reconnecting).await;
    conn.emit_inbound(InboundMessage::new(CUSTOMER, MessageContent::text("hello?"), false));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.backend.calls().is_empty());
    assert_eq!(h.connector.attempt_count(), 1);

    // 断开会取消待执行的重连
    h.registry.disconnect("T2").await.unwrap();
    assert_eq!(h.connector.attempt_count(), 1);
}

#[tokio::test]
async fn test_create_is_idempotent_across_states() {
    let h = &harness();
    h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_code("ABC123");
    wait_state(h, "T1", SessionState::QrPending).await;

    let (outcome, _) = h.registry.create("T1", "B").await.unwrap();
    assert_eq!(outcome, bee_relay::session::CreateOutcome::Exists);
    assert_eq!(h.connector.attempt_count(), 1);
}

#[tokio::test]
async fn test_one_tenant_failure_does_not_affect_others() {
    let h = &harness();
    h.registry.create("T1", "B1").await.unwrap();
    h.registry.create("T2", "B2").await.unwrap();
    let first = h.connector.connection(0).await.unwrap();
    let second = h.connector.connection(1).await.unwrap();
    let (t1, t2) = if first.tenant_id == "T1" { (first, second) } else { (second, first) };

    t1.emit_open();
    t2.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;
    wait_state(h, "T2", SessionState::Connected).await;

    t1.emit_close(CloseReason::LOGGED_OUT);
    eventually("T1 removed", || async move { h.registry.get("T1").await.is_err() }).await;

    let list = h.registry.list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].tenant_id, "T2");
    assert!(list[0].connected);
}

#[tokio::test]
async fn test_shutdown_drains_sessions_and_keeps_credentials() {
    let h = &harness();
    h.auth.save("T1", b"{}").await.unwrap();
    let (_, session) = h.registry.create("T1", "B").await.unwrap();
    let conn = h.connector.connection(0).await.unwrap();
    conn.emit_open();
    wait_state(h, "T1", SessionState::Connected).await;

    let outcomes = ShutdownSequence::new(Duration::from_secs(5))
        .then(SessionDrain::new(h.registry.clone()))
        .run()
        .await;
    assert_eq!(outcomes, vec![("sessions", StepOutcome::Done)]);

    assert_eq!(session.state().await, SessionState::Disconnected);
    assert!(conn.is_closed());
    assert_eq!(h.registry.active_count().await, 0);
    assert!(h.auth.contains("T1").await);
}

#[test]
fn test_default_policy_matches_documented_backoff() {
    let p = ReconnectionPolicy::default();
    assert_eq!(p.max_retries, 3);
    assert_eq!(p.delay_for(0), Duration::from_secs(5));
    assert_eq!(p.delay_for(2), Duration::from_secs(15));
}
