//! 会话 actor
//!
//! 每个租户一个 tokio 任务，串行处理命令：协议事件、连接结果、重连定时、发送通知、断开请求。
//! 状态转换交给 `SessionMachine`，这里只负责执行它返回的动作。
//!
//! 连接代号（generation）：每次建立或释放连接都会递增，旧连接上迟到的事件按代号过滤掉。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::machine::{Action, DisconnectMode, MachineInput, SessionEnd, SessionMachine, SessionState};
use super::outbox::{self, Outbox, Pacing};
use super::policy::ReconnectionPolicy;
use super::queue::MessageQueue;
use crate::auth::AuthStateStore;
use crate::backend::BackendClient;
use crate::config::{AppConfig, QueueSection};
use crate::core::{schedule_cancellable, RelayError, Scheduler, TokioScheduler};
use crate::inbound::handle_inbound;
use crate::protocol::{
    CloseReason, Connection, ConnectionEvent, Connector, ProtocolConnection, ProtocolError, ProtocolEvent,
};
use crate::provisioning::ProvisioningBroadcaster;

/// 发给 actor 的命令
pub(crate) enum Command {
    Protocol {
        generation: u64,
        event: ProtocolEvent,
    },
    ConnectResult {
        generation: u64,
        result: Result<Connection, ProtocolError>,
    },
    ReconnectDue,
    /// 队列里有新消息
    Kick,
    FlushDone {
        flush_id: u64,
    },
    Disconnect {
        mode: DisconnectMode,
        done: oneshot::Sender<()>,
    },
}

/// 所有会话共享的依赖
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn Connector>,
    pub auth_store: Arc<dyn AuthStateStore>,
    pub backend: Arc<BackendClient>,
    pub broadcaster: ProvisioningBroadcaster,
    pub scheduler: Arc<dyn Scheduler>,
    pub policy: ReconnectionPolicy,
    pub pacing: Pacing,
    pub queue: QueueSection,
}

impl SessionContext {
    pub fn new(
        connector: Arc<dyn Connector>,
        auth_store: Arc<dyn AuthStateStore>,
        backend: Arc<BackendClient>,
        broadcaster: ProvisioningBroadcaster,
    ) -> Self {
        Self {
            connector,
            auth_store,
            backend,
            broadcaster,
            scheduler: Arc::new(TokioScheduler),
            policy: ReconnectionPolicy::default(),
            pacing: Pacing::default(),
            queue: QueueSection::default(),
        }
    }

    /// 按配置填充重连策略、发送节奏与队列上限
    pub fn from_config(
        cfg: &AppConfig,
        connector: Arc<dyn Connector>,
        auth_store: Arc<dyn AuthStateStore>,
        backend: Arc<BackendClient>,
        broadcaster: ProvisioningBroadcaster,
    ) -> Self {
        Self::new(connector, auth_store, backend, broadcaster)
            .with_policy(ReconnectionPolicy::from_config(&cfg.session))
            .with_pacing(Pacing::from_config(&cfg.session))
            .with_queue(cfg.queue.clone())
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_queue(mut self, queue: QueueSection) -> Self {
        self.queue = queue;
        self
    }
}

/// 租户标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub business_name: String,
}

impl Tenant {
    pub fn new(id: impl Into<String>, business_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            business_name: business_name.into(),
        }
    }
}

/// 会话结束通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub end: SessionEnd,
}

/// 会话结束回调（注册表实现它以移除条目）
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_session_end(&self, exit: SessionExit);
}

/// 会话状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub tenant_id: String,
    pub business_name: String,
    pub state: SessionState,
    pub retry_count: u32,
    pub provisioning_code: Option<String>,
    pub queue_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
}

/// send 的结果：已连接时立即进入发送流程，否则排队等待连接
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    Queued,
}

#[derive(Debug, Clone)]
struct StatusCell {
    state: SessionState,
    retry_count: u32,
    provisioning_code: Option<String>,
    end_reason: Option<String>,
}

/// 会话句柄；真正的状态在 actor 任务里
pub struct WhatsAppSession {
    tenant: Tenant,
    instance_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<StatusCell>>,
    queue: Arc<Mutex<MessageQueue>>,
    outbox: Outbox,
}

impl std::fmt::Debug for WhatsAppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhatsAppSession")
            .field("tenant", &self.tenant)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl WhatsAppSession {
    /// 创建会话并立即开始连接
    pub fn spawn(tenant: Tenant, ctx: SessionContext, observer: Arc<dyn SessionObserver>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance_id = Uuid::new_v4();
        let queue = Arc::new(Mutex::new(MessageQueue::from_config(&ctx.queue)));
        let outbox = Outbox::new(&tenant.id, queue.clone(), tx.clone());
        let status = Arc::new(RwLock::new(StatusCell {
            state: SessionState::Initializing,
            retry_count: 0,
            provisioning_code: None,
            end_reason: None,
        }));

        let actor = SessionActor {
            machine: SessionMachine::new(tenant.id.clone(), ctx.policy.clone()),
            tenant: tenant.clone(),
            instance_id,
            ctx,
            observer,
            status: status.clone(),
            queue: queue.clone(),
            outbox: outbox.clone(),
            tx: tx.clone(),
            rx,
            generation: 0,
            connection: None,
            forwarder: None,
            reconnect: None,
            flush: None,
            flush_seq: 0,
            waiters: Vec::new(),
        };

        tracing::info!(tenant_id = %tenant.id, %instance_id, "starting session for {}", tenant.business_name);
        tokio::spawn(actor.run());

        Arc::new(Self {
            tenant,
            instance_id,
            commands: tx,
            status,
            queue,
            outbox,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.id
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn state(&self) -> SessionState {
        self.status.read().await.state
    }

    pub async fn status(&self) -> SessionStatus {
        let cell = self.status.read().await.clone();
        let queue_length = self.queue.lock().await.len();
        SessionStatus {
            tenant_id: self.tenant.id.clone(),
            business_name: self.tenant.business_name.clone(),
            state: cell.state,
            retry_count: cell.retry_count,
            provisioning_code: cell.provisioning_code,
            queue_length,
            end_reason: cell.end_reason,
        }
    }

    /// 外发文本；一律经过队列，保证同一会话内的发送顺序
    pub async fn send(&self, recipient: &str, text: &str) -> Result<SendOutcome, RelayError> {
        let connected = self.state().await == SessionState::Connected;
        self.outbox.push(recipient, text).await?;
        Ok(if connected {
            SendOutcome::Accepted
        } else {
            SendOutcome::Queued
        })
    }

    /// 请求断开并等待会话结束；会话已结束时直接返回
    pub async fn disconnect(&self, mode: DisconnectMode) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Disconnect { mode, done }).is_err() {
            return;
        }
        let _ = wait.await;
    }

    /// actor 是否已退出
    pub fn is_finished(&self) -> bool {
        self.commands.is_closed()
    }
}

struct SessionActor {
    tenant: Tenant,
    instance_id: Uuid,
    ctx: SessionContext,
    observer: Arc<dyn SessionObserver>,
    machine: SessionMachine,
    status: Arc<RwLock<StatusCell>>,
    queue: Arc<Mutex<MessageQueue>>,
    outbox: Outbox,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    generation: u64,
    connection: Option<Arc<dyn ProtocolConnection>>,
    forwarder: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
    flush: Option<(u64, CancellationToken)>,
    flush_seq: u64,
    waiters: Vec<oneshot::Sender<()>>,
}

impl SessionActor {
    async fn run(mut self) {
        let mut finished = self.step(MachineInput::Start).await;

        while !finished {
            let Some(command) = self.rx.recv().await else {
                break;
            };
            finished = self.dispatch(command).await;
        }

        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Disconnect { done, .. } => {
                    let _ = done.send(());
                }
                Command::ConnectResult { result: Ok(conn), .. } => {
                    conn.handle.close().await;
                }
                _ => {}
            }
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::debug!(tenant_id = %self.tenant.id, "session actor stopped");
    }

    /// 处理一条命令；返回 true 表示会话已结束
    async fn dispatch(&mut self, command: Command) -> bool {
        match command {
            Command::Protocol { generation, event } => {
                if generation != self.generation {
                    tracing::debug!(
                        tenant_id = %self.tenant.id,
                        generation,
                        current = self.generation,
                        "dropping event from stale connection"
                    );
                    return false;
                }
                match event {
                    ProtocolEvent::CredentialsUpdated(blob) => {
                        // 原地写入，关闭流程不会打断半截的凭证文件
                        if let Err(e) = self.ctx.auth_store.save(&self.tenant.id, &blob).await {
                            tracing::error!(tenant_id = %self.tenant.id, "failed to persist credentials: {}", e);
                        }
                        false
                    }
                    ProtocolEvent::Connection(event) => self.step(MachineInput::Connection(event)).await,
                    ProtocolEvent::Inbound(msg) => self.step(MachineInput::Inbound(msg)).await,
                }
            }
            Command::ConnectResult { generation, result } => {
                if generation != self.generation {
                    if let Ok(conn) = result {
                        conn.handle.close().await;
                    }
                    return false;
                }
                match result {
                    Ok(conn) => {
                        self.attach(conn);
                        false
                    }
                    Err(e) => self.step(MachineInput::ConnectFailed(e.to_string())).await,
                }
            }
            Command::ReconnectDue => {
                self.reconnect = None;
                self.step(MachineInput::ReconnectDue).await
            }
            Command::Kick => {
                if self.machine.state() == SessionState::Connected {
                    self.ensure_flush();
                }
                false
            }
            Command::FlushDone { flush_id } => {
                if matches!(self.flush, Some((id, _)) if id == flush_id) {
                    self.flush = None;
                    let pending = !self.queue.lock().await.is_empty();
                    if pending && self.machine.state() == SessionState::Connected {
                        self.ensure_flush();
                    }
                }
                false
            }
            Command::Disconnect { mode, done } => {
                self.waiters.push(done);
                self.step(MachineInput::Disconnect(mode)).await
            }
        }
    }

    async fn step(&mut self, input: MachineInput) -> bool {
        let actions = self.machine.handle(input);
        {
            let mut cell = self.status.write().await;
            cell.state = self.machine.state();
            cell.retry_count = self.machine.retry_count();
            cell.provisioning_code = self.machine.provisioning_code().map(str::to_string);
        }

        let mut finished = false;
        for action in actions {
            finished |= self.execute(action).await;
        }
        finished
    }

    async fn execute(&mut self, action: Action) -> bool {
        match action {
            Action::OpenConnection => self.open_connection().await,
            Action::ReleaseConnection => self.release_connection().await,
            Action::PublishCode(code) => {
                let delivered = self
                    .ctx
                    .broadcaster
                    .publish(&self.tenant.id, &self.tenant.business_name, &code);
                tracing::info!(tenant_id = %self.tenant.id, "provisioning code published to {} subscribers", delivered);
            }
            Action::ScheduleReconnect(delay) => {
                if let Some(old) = self.reconnect.take() {
                    old.cancel();
                }
                let token = CancellationToken::new();
                let tx = self.tx.clone();
                schedule_cancellable(self.ctx.scheduler.clone(), delay, token.clone(), async move {
                    let _ = tx.send(Command::ReconnectDue);
                });
                self.reconnect = Some(token);
            }
            Action::CancelReconnect => {
                if let Some(token) = self.reconnect.take() {
                    token.cancel();
                }
            }
            Action::StartFlush => self.ensure_flush(),
            Action::StopFlush => {
                if let Some((_, token)) = self.flush.take() {
                    token.cancel();
                }
            }
            Action::Forward(msg) => {
                let tenant_id = self.tenant.id.clone();
                let backend = self.ctx.backend.clone();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let outcome = handle_inbound(&tenant_id, msg, &backend, &outbox).await;
                    tracing::debug!(tenant_id = %tenant_id, "inbound handled: {:?}", outcome);
                });
            }
            Action::ClearCredentials => {
                if let Err(e) = self.ctx.auth_store.remove(&self.tenant.id).await {
                    tracing::error!(tenant_id = %self.tenant.id, "failed to clear credentials: {}", e);
                } else {
                    tracing::info!(tenant_id = %self.tenant.id, "credentials cleared");
                }
            }
            Action::Finish(end) => {
                self.finish(end).await;
                return true;
            }
        }
        false
    }

    async fn open_connection(&mut self) {
        self.release_connection().await;
        let generation = self.generation;
        let tenant_id = self.tenant.id.clone();
        let connector = self.ctx.connector.clone();
        let auth_store = self.ctx.auth_store.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let auth = match auth_store.load(&tenant_id).await {
                Ok(auth) => auth,
                Err(e) => {
                    tracing::warn!(tenant_id = %tenant_id, "failed to load credentials, starting fresh: {}", e);
                    None
                }
            };
            let result = connector.connect(&tenant_id, auth).await;
            // 会话已结束：没人接收这个连接，直接关闭
            if let Err(mpsc::error::SendError(Command::ConnectResult { result: Ok(conn), .. })) =
                tx.send(Command::ConnectResult { generation, result })
            {
                conn.handle.close().await;
            }
        });
    }

    fn attach(&mut self, conn: Connection) {
        let Connection { handle, mut events } = conn;
        let generation = self.generation;
        let token = CancellationToken::new();
        let tx = self.tx.clone();
        let stop = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else {
                            // 事件流结束但未收到 Closed：按连接关闭处理，交给重连策略
                            let event =
                                ProtocolEvent::Connection(ConnectionEvent::Closed(CloseReason::CONNECTION_CLOSED));
                            let _ = tx.send(Command::Protocol { generation, event });
                            break;
                        };
                        if tx.send(Command::Protocol { generation, event }).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.connection = Some(handle);
        self.forwarder = Some(token);
        tracing::debug!(tenant_id = %self.tenant.id, generation, "connection attached");
    }

    async fn release_connection(&mut self) {
        if let Some(token) = self.forwarder.take() {
            token.cancel();
        }
        if let Some(handle) = self.connection.take() {
            handle.close().await;
        }
        self.generation += 1;
    }

    /// 已有 drain 在跑时不重复启动
    fn ensure_flush(&mut self) {
        if self.flush.is_some() {
            return;
        }
        let Some(conn) = self.connection.clone() else {
            return;
        };

        self.flush_seq += 1;
        let flush_id = self.flush_seq;
        let token = CancellationToken::new();
        let tenant_id = self.tenant.id.clone();
        let queue = self.queue.clone();
        let scheduler = self.ctx.scheduler.clone();
        let pacing = self.ctx.pacing;
        let tx = self.tx.clone();
        let stop = token.clone();

        tokio::spawn(async move {
            let report = outbox::drain(&tenant_id, conn, queue, scheduler, pacing, stop).await;
            tracing::debug!(tenant_id = %tenant_id, "flush finished: {:?}", report);
            let _ = tx.send(Command::FlushDone { flush_id });
        });
        self.flush = Some((flush_id, token));
    }

    async fn finish(&mut self, end: SessionEnd) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
        if let Some((_, token)) = self.flush.take() {
            token.cancel();
        }
        self.release_connection().await;

        {
            let mut cell = self.status.write().await;
            cell.state = self.machine.state();
            cell.provisioning_code = None;
            cell.end_reason = Some(end.reason().to_string());
        }

        tracing::info!(tenant_id = %self.tenant.id, "session ended: {}", end.reason());
        self.observer
            .on_session_end(SessionExit {
                tenant_id: self.tenant.id.clone(),
                instance_id: self.instance_id,
                end,
            })
            .await;
    }
}
