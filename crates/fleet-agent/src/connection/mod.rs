//! One logical session to the coordinator: connect, reconnect with backoff,
//! registration bookkeeping, unary calls and the command stream.

mod backoff;
mod dialer;
mod frames;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use base64::Engine;
use fleet_process::ProcessEvent;
use fleet_proto::coordinator_v1::{
    Command, CommandUpdate, HeartbeatRequest, HeartbeatResponse, ProcessEventReport,
    ProcessStatus, RegisterRequest, RegisterResponse, ReportProcessEventResponse, ResourceUsage,
    methods,
};
use prost::Message;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

pub use backoff::Backoff;
pub use dialer::{Dialer, FramePipe, WsDialer};
pub use frames::{AgentFrame, CoordinatorFrame};

use crate::error::RpcError;
use frames::RpcResponse;

const COMMAND_BUFFER: usize = 32;

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot published on every connection or registration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub registered: bool,
    /// Incremented for every new session.
    pub epoch: u64,
}

impl LinkStatus {
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected && self.registered
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub urls: Vec<String>,
    pub node_name: String,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl ConnectionSettings {
    pub fn from_config(cfg: &crate::config::AgentConfig) -> Self {
        Self {
            urls: cfg.coordinator_urls.clone(),
            node_name: cfg.node_name.clone(),
            connect_timeout: cfg.connect_timeout(),
            rpc_timeout: cfg.rpc_timeout(),
            reconnect_min: Duration::from_millis(cfg.reconnect_min_ms),
            reconnect_max: Duration::from_millis(cfg.reconnect_max_ms),
        }
    }
}

/// Handles one inbound command. Implementations reply through `replier`.
#[tonic::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command, replier: CommandReplier);
}

/// Write half of the command stream, bound to the session it came from.
#[derive(Debug, Clone)]
pub struct CommandReplier {
    tx: mpsc::Sender<AgentFrame>,
}

impl CommandReplier {
    pub fn new(tx: mpsc::Sender<AgentFrame>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, update: CommandUpdate) -> Result<(), RpcError> {
        let frame = AgentFrame::Stream {
            payload_b64: b64().encode(update.encode_to_vec()),
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::Transient("command stream closed".to_string()))
    }
}

#[derive(Debug)]
struct Session {
    epoch: u64,
    url: String,
    tx: mpsc::Sender<AgentFrame>,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>,
    commands: Mutex<Option<mpsc::Receiver<Command>>>,
    closed: CancellationToken,
}

impl Session {
    fn fail_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        // Dropping the senders wakes every waiter with a closed-channel error.
        pending.clear();
    }
}

struct Inner {
    settings: ConnectionSettings,
    dialer: Arc<dyn Dialer>,
    session: RwLock<Option<Arc<Session>>>,
    status: watch::Sender<LinkStatus>,
    agent_id: Mutex<Option<String>>,
    next_req: AtomicU64,
    next_url: AtomicUsize,
    epochs: AtomicU64,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

/// Cheap to clone; every clone shares one session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, dialer: Arc<dyn Dialer>) -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: ConnectionState::Disconnected,
            registered: false,
            epoch: 0,
        });
        Self {
            inner: Arc::new(Inner {
                settings,
                dialer,
                session: RwLock::new(None),
                status,
                agent_id: Mutex::new(None),
                next_req: AtomicU64::new(1),
                next_url: AtomicUsize::new(0),
                epochs: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// False when running unmanaged, with no coordinator address at all.
    pub fn has_coordinator(&self) -> bool {
        !self.inner.settings.urls.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_registered(&self) -> bool {
        self.status().is_ready()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn agent_id(&self) -> Option<String> {
        self.inner
            .agent_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.status.send_modify(|s| {
            s.state = state;
            if state != ConnectionState::Connected {
                s.registered = false;
            }
        });
    }

    /// Flags the registration as lost so the owner re-registers.
    pub fn mark_unregistered(&self) {
        self.inner.status.send_if_modified(|s| {
            let changed = s.registered;
            s.registered = false;
            changed
        });
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.inner
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One connection attempt. On failure the caller is not failed: the
    /// attempt is handed off to background reconnection.
    pub async fn connect(&self, timeout: Duration) -> anyhow::Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if !self.has_coordinator() {
            tracing::debug!("no coordinator address configured; staying offline");
            return Ok(());
        }
        if let Err(e) = self.try_connect_once(timeout).await {
            tracing::warn!(error = %e, "initial coordinator connection failed; reconnecting in background");
            self.spawn_reconnect();
        }
        Ok(())
    }

    async fn try_connect_once(&self, timeout: Duration) -> Result<(), RpcError> {
        let urls = &self.inner.settings.urls;
        if urls.is_empty() {
            return Err(RpcError::Fatal("no coordinator address configured".to_string()));
        }

        self.set_state(ConnectionState::Connecting);
        let start = self.inner.next_url.load(Ordering::Relaxed);
        let mut last_err = String::new();
        for i in 0..urls.len() {
            let idx = (start + i) % urls.len();
            let url = &urls[idx];
            match tokio::time::timeout(timeout, self.inner.dialer.dial(url)).await {
                Ok(Ok(pipe)) => {
                    self.inner.next_url.store(idx, Ordering::Relaxed);
                    self.install_session(url, pipe).await?;
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::debug!(%url, error = %e, "dial failed");
                    last_err = format!("{url}: {e}");
                }
                Err(_) => {
                    tracing::debug!(%url, "dial timed out");
                    last_err = format!("{url}: connect timeout after {}ms", timeout.as_millis());
                }
            }
        }
        // Start from the next address on the following attempt.
        self.inner.next_url.store((start + 1) % urls.len(), Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnected);
        Err(RpcError::Transient(last_err))
    }

    async fn install_session(&self, url: &str, pipe: FramePipe) -> Result<(), RpcError> {
        let FramePipe { tx, rx } = pipe;
        let hello = AgentFrame::Hello {
            node: self.inner.settings.node_name.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if tx.send(hello).await.is_err() {
            self.set_state(ConnectionState::Disconnected);
            return Err(RpcError::Transient(format!("{url}: session closed during handshake")));
        }

        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(COMMAND_BUFFER);
        let session = Arc::new(Session {
            epoch,
            url: url.to_string(),
            tx,
            pending: Mutex::new(HashMap::new()),
            commands: Mutex::new(Some(cmd_rx)),
            closed: CancellationToken::new(),
        });

        let previous = self
            .inner
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(session.clone());
        if let Some(old) = previous {
            old.closed.cancel();
            old.fail_pending();
        }

        let manager = self.clone();
        let span = tracing::info_span!("coordinator_session", url = %url, epoch);
        tokio::spawn(
            async move {
                manager.route_frames(session, rx, cmd_tx).await;
            }
            .instrument(span),
        );

        self.inner.status.send_modify(|s| {
            s.state = ConnectionState::Connected;
            s.registered = false;
            s.epoch = epoch;
        });
        tracing::info!(%url, epoch, "connected to coordinator");
        Ok(())
    }

    async fn route_frames(
        &self,
        session: Arc<Session>,
        mut rx: mpsc::Receiver<CoordinatorFrame>,
        cmd_tx: mpsc::Sender<Command>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = session.closed.cancelled() => break,
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            match frame {
                CoordinatorFrame::Resp {
                    id,
                    ok,
                    payload_b64,
                    status_code,
                    status_message,
                } => {
                    let waiter = session
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                    if let Some(tx) = waiter {
                        let _ = tx.send(RpcResponse {
                            ok,
                            payload_b64,
                            status_code,
                            status_message,
                        });
                    }
                }
                CoordinatorFrame::Stream { payload_b64 } => {
                    let command = b64()
                        .decode(payload_b64.as_bytes())
                        .ok()
                        .and_then(|bytes| Command::decode(bytes.as_slice()).ok());
                    let Some(command) = command else {
                        tracing::warn!("dropping undecodable command frame");
                        continue;
                    };
                    if cmd_tx.send(command).await.is_err() {
                        tracing::debug!("command receiver gone");
                    }
                }
                CoordinatorFrame::Unknown => {}
            }
        }
        self.session_lost(&session);
    }

    fn session_lost(&self, session: &Arc<Session>) {
        session.closed.cancel();
        session.fail_pending();

        let mut slot = self.inner.session.write().unwrap_or_else(|e| e.into_inner());
        let is_current = slot.as_ref().is_some_and(|s| s.epoch == session.epoch);
        if !is_current {
            return;
        }
        *slot = None;
        drop(slot);

        self.set_state(ConnectionState::Disconnected);
        if !self.inner.shutdown.is_cancelled() {
            tracing::warn!(url = %session.url, epoch = session.epoch, "coordinator session lost");
        }
    }

    /// Retries with exponential backoff until connected or `cancel` fires.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), RpcError> {
        let mut backoff = Backoff::new(
            self.inner.settings.reconnect_min,
            self.inner.settings.reconnect_max,
        );
        loop {
            if cancel.is_cancelled() || self.inner.shutdown.is_cancelled() {
                return Err(RpcError::Transient("reconnect cancelled".to_string()));
            }
            if self.is_connected() {
                return Ok(());
            }
            match self.try_connect_once(self.inner.settings.connect_timeout).await {
                Ok(()) => return Ok(()),
                Err(RpcError::Fatal(msg)) => return Err(RpcError::Fatal(msg)),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::info!(error = %e, delay_ms = delay.as_millis() as u64, "reconnect failed; backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = self.inner.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Starts a detached reconnect unless one is already running.
    pub fn spawn_reconnect(&self) -> bool {
        if !self.has_coordinator() {
            return false;
        }
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return false;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let cancel = manager.inner.shutdown.clone();
            if let Err(e) = manager.reconnect(&cancel).await {
                tracing::warn!(error = %e, "background reconnect gave up");
            }
            manager.inner.reconnecting.store(false, Ordering::Release);
        });
        true
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    async fn call<Req, Res>(&self, method: &'static str, req: Req) -> Result<Res, RpcError>
    where
        Req: Message,
        Res: Message + Default,
    {
        let Some(session) = self.current_session() else {
            return Err(RpcError::not_connected());
        };

        let id = self.inner.next_req.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel::<RpcResponse>();
        session
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);

        let frame = AgentFrame::Req {
            id: id.clone(),
            method: method.to_string(),
            payload_b64: b64().encode(req.encode_to_vec()),
        };
        let forget = |session: &Session| {
            session
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        };

        if session.tx.send(frame).await.is_err() {
            forget(&session);
            return Err(tonic::Status::unavailable("coordinator connection closed").into());
        }

        let resp = match tokio::time::timeout(self.inner.settings.rpc_timeout, rx).await {
            Ok(Ok(v)) => v,
            Ok(Err(_)) => {
                forget(&session);
                return Err(tonic::Status::unavailable("coordinator connection closed").into());
            }
            Err(_) => {
                forget(&session);
                return Err(tonic::Status::deadline_exceeded("coordinator call timeout").into());
            }
        };

        if !resp.ok {
            let code = fleet_proto::code_from_i32(resp.status_code.unwrap_or(2));
            return Err(tonic::Status::new(
                code,
                resp.status_message
                    .unwrap_or_else(|| "coordinator error".to_string()),
            )
            .into());
        }

        let bytes = match resp.payload_b64 {
            Some(p) => b64()
                .decode(p)
                .map_err(|_| RpcError::Transient("invalid response base64".to_string()))?,
            None => Vec::new(),
        };
        Res::decode(bytes.as_slice())
            .map_err(|e| RpcError::Transient(format!("failed to decode response: {e}")))
    }

    fn note_failure(&self, err: &RpcError) {
        if err.is_not_registered() {
            self.mark_unregistered();
        }
    }

    /// Registers this node. A rejection is a hard error; an acceptance
    /// records the assigned id and flips the link to registered.
    pub async fn register(&self, mut req: RegisterRequest) -> Result<RegisterResponse, RpcError> {
        if req.agent_id.is_empty()
            && let Some(id) = self.agent_id()
        {
            req.agent_id = id;
        }
        let epoch = self.status().epoch;
        let resp: RegisterResponse = self.call(methods::REGISTER, req).await?;
        if !resp.accepted {
            let msg = if resp.message.is_empty() {
                "registration rejected".to_string()
            } else {
                resp.message.clone()
            };
            return Err(RpcError::Fatal(msg));
        }
        if resp.agent_id.is_empty() {
            return Err(RpcError::Fatal("registration accepted without agent id".to_string()));
        }

        *self.inner.agent_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(resp.agent_id.clone());
        self.inner.status.send_if_modified(|s| {
            if s.epoch != epoch || s.state != ConnectionState::Connected || s.registered {
                return false;
            }
            s.registered = true;
            true
        });
        tracing::info!(agent_id = %resp.agent_id, "registered with coordinator");
        Ok(resp)
    }

    pub async fn send_heartbeat(
        &self,
        usage: ResourceUsage,
        processes: Vec<ProcessStatus>,
    ) -> Result<(), RpcError> {
        let Some(agent_id) = self.agent_id() else {
            return Err(RpcError::NotRegistered("no agent id assigned yet".to_string()));
        };
        let req = HeartbeatRequest {
            agent_id,
            timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
            usage: Some(usage),
            processes,
        };
        let res: Result<HeartbeatResponse, RpcError> = self.call(methods::HEARTBEAT, req).await;
        if let Err(e) = &res {
            self.note_failure(e);
        }
        res.map(|_| ())
    }

    /// Single delivery attempt; retry and caching belong to the caller.
    pub async fn report_event(&self, event: &ProcessEvent) -> Result<(), RpcError> {
        let Some(agent_id) = self.agent_id() else {
            return Err(RpcError::NotRegistered("no agent id assigned yet".to_string()));
        };
        let req = ProcessEventReport {
            agent_id,
            event_id: event.id.to_string(),
            event_type: event.event_type.as_str().to_string(),
            pid: event.pid,
            process_name: event.name.clone(),
            install_dir: event.install_dir.clone(),
            role: event.role.clone(),
            timestamp_unix_ms: event.timestamp.timestamp_millis(),
            details: event
                .details
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let res: Result<ReportProcessEventResponse, RpcError> =
            self.call(methods::REPORT_PROCESS_EVENT, req).await;
        if let Err(e) = &res {
            self.note_failure(e);
        }
        res.map(|_| ())
    }

    /// Serves the command stream of the current session until it breaks
    /// (error) or `cancel` fires (Ok). Each command runs as its own task on
    /// `tasks`.
    pub async fn start_command_stream(
        &self,
        cancel: &CancellationToken,
        tasks: &TaskTracker,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RpcError> {
        let Some(session) = self.current_session() else {
            return Err(RpcError::not_connected());
        };
        let Some(mut commands) = session
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Err(RpcError::Transient("command stream already open".to_string()));
        };

        let open = AgentFrame::StreamOpen {
            agent_id: self.agent_id().unwrap_or_default(),
        };
        if session.tx.send(open).await.is_err() {
            return Err(RpcError::Transient("command stream closed".to_string()));
        }
        tracing::info!(epoch = session.epoch, "command stream open");

        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = session.closed.cancelled() => {
                    return Err(RpcError::Transient("command stream closed".to_string()));
                }
                command = commands.recv() => command,
            };
            let Some(command) = command else {
                return Err(RpcError::Transient("command stream closed".to_string()));
            };

            let replier = CommandReplier::new(session.tx.clone());
            let handler = handler.clone();
            let span = tracing::info_span!(
                "command",
                command_id = %command.command_id,
                command_type = %command.command_type
            );
            tasks.spawn(
                async move {
                    handler.handle(command, replier).await;
                }
                .instrument(span),
            );
        }
    }

    /// Closes the session and stops background reconnection.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let session = self
            .inner
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            session.closed.cancel();
            session.fail_pending();
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("coordinator connection closed");
    }
}
