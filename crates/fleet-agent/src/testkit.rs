//! In-memory stand-ins for the coordinator and the OS, shared by unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use base64::Engine;
use fleet_process::ProcessEvent;
use fleet_proto::coordinator_v1::{
    Command, CommandUpdate, HeartbeatRequest, HeartbeatResponse, ProcessEventReport,
    RegisterRequest, RegisterResponse, ReportProcessEventResponse, RuntimeConfig, methods,
};
use prost::Message;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{
        AgentFrame, ConnectionManager, ConnectionSettings, CoordinatorFrame, Dialer, FramePipe,
    },
    error::ProcessError,
    process::{ProcessController, StartParams, StopOutcome, supervisor::EventCallback},
};

const WAIT: Duration = Duration::from_secs(5);

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

struct FakeSession {
    to_agent: mpsc::Sender<CoordinatorFrame>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct CoordState {
    reachable: AtomicBool,
    reject: Mutex<Option<String>>,
    known_agents: Mutex<HashSet<String>>,
    next_agent: AtomicU32,
    fail_events: AtomicBool,
    runtime_config: Mutex<Option<RuntimeConfig>>,
    registrations: AtomicUsize,
    heartbeats: AtomicUsize,
    dials: AtomicUsize,
    events: Mutex<Vec<ProcessEventReport>>,
    sessions: Mutex<Vec<FakeSession>>,
    stream_open: AtomicBool,
    changed: Notify,
    updates_tx: Mutex<Option<mpsc::UnboundedSender<CommandUpdate>>>,
    updates_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<CommandUpdate>>>,
}

/// Coordinator double speaking the agent's frame protocol. Assigns agent ids
/// `agent-1`, `agent-2`, ... and forgets them on demand.
#[derive(Clone)]
pub(crate) struct FakeCoordinator {
    state: Arc<CoordState>,
}

impl FakeCoordinator {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = CoordState {
            reachable: AtomicBool::new(true),
            next_agent: AtomicU32::new(1),
            updates_tx: Mutex::new(Some(tx)),
            updates_rx: tokio::sync::Mutex::new(Some(rx)),
            ..CoordState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn reject_registration(&self, message: &str) {
        *self.state.reject.lock().unwrap() = Some(message.to_string());
    }

    pub(crate) fn set_runtime_config(&self, cfg: RuntimeConfig) {
        *self.state.runtime_config.lock().unwrap() = Some(cfg);
    }

    /// Simulates a coordinator restart that lost every registration.
    pub(crate) fn forget_agents(&self) {
        self.state.known_agents.lock().unwrap().clear();
    }

    pub(crate) fn set_fail_events(&self, fail: bool) {
        self.state.fail_events.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn drop_sessions(&self) {
        let sessions: Vec<FakeSession> = self.state.sessions.lock().unwrap().drain(..).collect();
        for s in sessions {
            s.cancel.cancel();
        }
        self.state.stream_open.store(false, Ordering::SeqCst);
    }

    pub(crate) fn registrations(&self) -> usize {
        self.state.registrations.load(Ordering::SeqCst)
    }

    pub(crate) fn heartbeats(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }

    pub(crate) fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<ProcessEventReport> {
        self.state.events.lock().unwrap().clone()
    }

    async fn wait_until(&self, what: &str, mut cond: impl FnMut(&Self) -> bool) {
        let res = tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.state.changed.notified();
                if cond(self) {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(res.is_ok(), "timed out waiting for {what}");
    }

    pub(crate) async fn wait_for_events(&self, n: usize) -> Vec<ProcessEventReport> {
        self.wait_until("events", |c| c.events().len() >= n).await;
        self.events()
    }

    pub(crate) async fn wait_for_registrations(&self, n: usize) {
        self.wait_until("registrations", |c| c.registrations() >= n)
            .await;
    }

    pub(crate) async fn wait_for_heartbeats(&self, n: usize) {
        self.wait_until("heartbeats", |c| c.heartbeats() >= n).await;
    }

    pub(crate) async fn wait_for_stream_open(&self) {
        self.wait_until("stream open", |c| {
            c.state.stream_open.load(Ordering::SeqCst)
        })
        .await;
    }

    pub(crate) fn push_command(&self, id: &str, command_type: &str, params: &[(&str, &str)]) {
        let command = Command {
            command_id: id.to_string(),
            command_type: command_type.to_string(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let frame = CoordinatorFrame::Stream {
            payload_b64: b64().encode(command.encode_to_vec()),
        };
        let sessions = self.state.sessions.lock().unwrap();
        let session = sessions.last().expect("no open session");
        session.to_agent.try_send(frame).expect("session buffer full");
    }

    /// Next command update, in arrival order.
    pub(crate) async fn next_update(&self) -> CommandUpdate {
        let mut guard = self.state.updates_rx.lock().await;
        let rx = guard.as_mut().expect("updates receiver");
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a command update")
            .expect("update channel closed")
    }

    /// Updates until (and including) the first terminal one.
    pub(crate) async fn updates_until_terminal(&self) -> Vec<CommandUpdate> {
        let mut out = Vec::new();
        loop {
            let u = self.next_update().await;
            let done = u.status().is_terminal();
            out.push(u);
            if done {
                return out;
            }
        }
    }

    fn respond<M: Message>(id: String, msg: &M) -> CoordinatorFrame {
        CoordinatorFrame::Resp {
            id,
            ok: true,
            payload_b64: Some(b64().encode(msg.encode_to_vec())),
            status_code: None,
            status_message: None,
        }
    }

    fn fail(id: String, code: tonic::Code, message: &str) -> CoordinatorFrame {
        CoordinatorFrame::Resp {
            id,
            ok: false,
            payload_b64: None,
            status_code: Some(code as i32),
            status_message: Some(message.to_string()),
        }
    }

    fn handle_request(&self, id: String, method: &str, payload: &[u8]) -> CoordinatorFrame {
        let st = &self.state;
        match method {
            methods::REGISTER => {
                let Ok(req) = RegisterRequest::decode(payload) else {
                    return Self::fail(id, tonic::Code::InvalidArgument, "bad register payload");
                };
                if let Some(msg) = st.reject.lock().unwrap().clone() {
                    return Self::respond(
                        id,
                        &RegisterResponse {
                            accepted: false,
                            message: msg,
                            ..Default::default()
                        },
                    );
                }
                let mut known = st.known_agents.lock().unwrap();
                let agent_id = if !req.agent_id.is_empty() && known.contains(&req.agent_id) {
                    req.agent_id
                } else {
                    format!("agent-{}", st.next_agent.fetch_add(1, Ordering::SeqCst))
                };
                known.insert(agent_id.clone());
                st.registrations.fetch_add(1, Ordering::SeqCst);
                Self::respond(
                    id,
                    &RegisterResponse {
                        accepted: true,
                        agent_id,
                        message: String::new(),
                        runtime_config: st.runtime_config.lock().unwrap().clone(),
                    },
                )
            }
            methods::HEARTBEAT => {
                let Ok(req) = HeartbeatRequest::decode(payload) else {
                    return Self::fail(id, tonic::Code::InvalidArgument, "bad heartbeat payload");
                };
                if !st.known_agents.lock().unwrap().contains(&req.agent_id) {
                    return Self::fail(id, tonic::Code::NotFound, "agent not registered");
                }
                st.heartbeats.fetch_add(1, Ordering::SeqCst);
                Self::respond(id, &HeartbeatResponse { ok: true })
            }
            methods::REPORT_PROCESS_EVENT => {
                let Ok(req) = ProcessEventReport::decode(payload) else {
                    return Self::fail(id, tonic::Code::InvalidArgument, "bad event payload");
                };
                if st.fail_events.load(Ordering::SeqCst) {
                    return Self::fail(id, tonic::Code::Unavailable, "event store down");
                }
                if !st.known_agents.lock().unwrap().contains(&req.agent_id) {
                    return Self::fail(id, tonic::Code::NotFound, "agent not registered");
                }
                st.events.lock().unwrap().push(req);
                Self::respond(id, &ReportProcessEventResponse { ok: true })
            }
            other => Self::fail(id, tonic::Code::Unimplemented, &format!("unknown method {other}")),
        }
    }

    async fn serve(
        self,
        mut from_agent: mpsc::Receiver<AgentFrame>,
        to_agent: mpsc::Sender<CoordinatorFrame>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                f = from_agent.recv() => f,
            };
            let Some(frame) = frame else { break };
            match frame {
                AgentFrame::Hello { .. } => {}
                AgentFrame::Req {
                    id,
                    method,
                    payload_b64,
                } => {
                    let payload = b64().decode(payload_b64).unwrap_or_default();
                    let resp = self.handle_request(id, &method, &payload);
                    if to_agent.send(resp).await.is_err() {
                        break;
                    }
                }
                AgentFrame::StreamOpen { .. } => {
                    self.state.stream_open.store(true, Ordering::SeqCst);
                }
                AgentFrame::Stream { payload_b64 } => {
                    let update = b64()
                        .decode(payload_b64)
                        .ok()
                        .and_then(|b| CommandUpdate::decode(b.as_slice()).ok());
                    if let (Some(u), Some(tx)) = (update, self.state.updates_tx.lock().unwrap().as_ref()) {
                        let _ = tx.send(u);
                    }
                }
            }
            self.state.changed.notify_waiters();
        }
    }
}

#[tonic::async_trait]
impl Dialer for FakeCoordinator {
    async fn dial(&self, url: &str) -> anyhow::Result<FramePipe> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if !self.state.reachable.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused: {url}");
        }
        let (agent_tx, agent_rx) = mpsc::channel::<AgentFrame>(64);
        let (coord_tx, coord_rx) = mpsc::channel::<CoordinatorFrame>(64);
        let cancel = CancellationToken::new();
        self.state.sessions.lock().unwrap().push(FakeSession {
            to_agent: coord_tx.clone(),
            cancel: cancel.clone(),
        });
        tokio::spawn(self.clone().serve(agent_rx, coord_tx, cancel));
        Ok(FramePipe {
            tx: agent_tx,
            rx: coord_rx,
        })
    }
}

pub(crate) fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        urls: vec!["ws://coordinator.test/agent".to_string()],
        node_name: "node-test".to_string(),
        connect_timeout: Duration::from_secs(1),
        rpc_timeout: Duration::from_secs(2),
        reconnect_min: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
    }
}

pub(crate) fn connection_for(coord: &FakeCoordinator) -> ConnectionManager {
    ConnectionManager::new(test_settings(), Arc::new(coord.clone()))
}

/// Process table double: PIDs are counters, "alive" is a set.
#[derive(Debug, Default)]
pub(crate) struct FakeController {
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    by_name: Mutex<HashMap<String, u32>>,
    fail_starts: AtomicU32,
    fail_stops: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeController {
    pub(crate) fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    fn spawn(&self, name: &str) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().unwrap().insert(pid);
        self.by_name.lock().unwrap().insert(name.to_string(), pid);
        pid
    }

    /// A matching process started outside the agent.
    pub(crate) fn spawn_external(&self, name: &str) -> u32 {
        self.spawn(name)
    }

    pub(crate) fn kill(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    pub(crate) fn fail_next_starts(&self, n: u32) {
        self.fail_starts.store(n, Ordering::SeqCst);
    }

    /// Every stop fails and leaves the process running.
    pub(crate) fn set_fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl ProcessController for FakeController {
    async fn start(&self, params: &StartParams) -> Result<u32, ProcessError> {
        let failing = self
            .fail_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProcessError::LauncherFailed("exit status: 1".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(self.spawn(&params.name()))
    }

    async fn stop(&self, pid: u32, _timeout: Duration) -> Result<StopOutcome, ProcessError> {
        if self.fail_stops.load(Ordering::SeqCst) {
            return Err(ProcessError::Signal {
                pid,
                source: std::io::Error::from_raw_os_error(libc::EPERM),
            });
        }
        if self.alive.lock().unwrap().remove(&pid) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(StopOutcome::Terminated)
        } else {
            Ok(StopOutcome::AlreadyStopped)
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn discover(&self, params: &StartParams) -> Option<u32> {
        let pid = *self.by_name.lock().unwrap().get(&params.name())?;
        self.is_alive(pid).then_some(pid)
    }
}

/// Collects events handed to the supervisor callback.
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    events: Arc<Mutex<Vec<ProcessEvent>>>,
}

impl EventLog {
    pub(crate) fn callback(&self) -> EventCallback {
        let events = self.events.clone();
        Arc::new(move |e| events.lock().unwrap().push(e))
    }

    pub(crate) fn all(&self) -> Vec<ProcessEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn types(&self) -> Vec<&'static str> {
        self.all().iter().map(|e| e.event_type.as_str()).collect()
    }

    pub(crate) fn last(&self) -> Option<ProcessEvent> {
        self.all().pop()
    }
}
