//! Client session: connection lifecycle, heartbeat, request correlation, local variable mirror.
//! Host-driven: the host reports transport events and ticks; the session sends through the channel
//! it obtained from the injected transport and queues `ClientEvent`s for the host to drain.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::correlation::{Correlation, Origin, PendingResponse, Resolution};
use crate::error::{DisconnectReason, RequestError};
use crate::heartbeat::{Beat, HeartbeatMonitor};
use crate::identity::PeerId;
use crate::protocol::{
    Envelope, Message, Response, VarAction, VarMessage, VarMode, VarState, VariableSnapshot,
};
use crate::transport::{Channel, Transport};
use crate::variable::{Stamp, VariableStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    /// First connection attempt, waiting for the transport to open.
    Connecting,
    /// Transport open, `init` sent.
    AwaitingInit,
    Active,
    /// Link lost; waiting for a new transport open.
    Reconnecting,
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Reconnecting,
    Reconnected,
    /// Terminal; emitted at most once.
    Disconnected(DisconnectReason),
    VariableChanged {
        name: String,
        mode: VarMode,
        value: Value,
    },
    /// Server `socket` push.
    Socket(Value),
}

pub struct ClientSession<T: Transport> {
    config: SessionConfig,
    peer_id: PeerId,
    server_id: PeerId,
    credential: String,
    transport: T,
    channel: Option<T::Channel>,
    state: ClientState,
    initialized: bool,
    dead: bool,
    heartbeat: HeartbeatMonitor,
    /// Connect-timeout deadline (ms); pushed back by every inbound envelope.
    watchdog: Option<u64>,
    correlation: Correlation,
    variables: VariableStore,
    events: Vec<ClientEvent>,
}

impl<T: Transport> ClientSession<T> {
    pub fn new(
        config: SessionConfig,
        peer_id: PeerId,
        server_id: PeerId,
        credential: impl Into<String>,
        transport: T,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::new(config.heartbeat_period_ms, config.max_missed_heartbeats);
        Self {
            config,
            peer_id,
            server_id,
            credential: credential.into(),
            transport,
            channel: None,
            state: ClientState::Idle,
            initialized: false,
            dead: false,
            heartbeat,
            watchdog: None,
            correlation: Correlation::new(),
            variables: VariableStore::new(),
            events: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn server_id(&self) -> &PeerId {
        &self.server_id
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// True once the first init handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn heartbeat_misses(&self) -> u32 {
        self.heartbeat.misses()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlation.pending_len()
    }

    pub fn queued_envelopes(&self) -> usize {
        self.correlation.queued_len()
    }

    /// Take all events queued since the last call.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    /// Transport is ready: open the first connection to the server.
    pub fn start(&mut self, now: u64) {
        if self.state != ClientState::Idle {
            return;
        }
        self.state = ClientState::Connecting;
        self.watchdog = Some(now.saturating_add(self.config.connect_timeout_ms));
        self.connect();
    }

    fn connect(&mut self) {
        match self.transport.connect(&self.server_id) {
            Some(channel) => {
                debug!(server = %self.server_id, "connecting");
                self.channel = Some(channel);
            }
            None => {
                warn!(server = %self.server_id, "transport has no route to server");
                self.die(DisconnectReason::ServerMissing);
            }
        }
    }

    /// Transport reports the channel open: authenticate and request the variable snapshot.
    pub fn on_open(&mut self, now: u64) {
        if self.dead || !matches!(self.state, ClientState::Connecting | ClientState::Reconnecting) {
            return;
        }
        self.touch(now);
        let (kind, body) = Message::Init {
            credential: self.credential.clone(),
        }
        .into_parts();
        let envelope = self.correlation.register(kind, body, now, Origin::Init);
        self.transmit(&envelope);
        self.state = ClientState::AwaitingInit;
    }

    /// Transport lost the link.
    pub fn on_close(&mut self, now: u64) {
        if self.dead || self.state == ClientState::Idle {
            return;
        }
        if !self.initialized && self.state == ClientState::Connecting {
            warn!(server = %self.server_id, "first connection attempt failed");
            self.die(DisconnectReason::ServerMissing);
            return;
        }
        info!(state = ?self.state, "connection to server lost");
        self.begin_reconnect(now, DisconnectReason::Closed);
    }

    pub fn on_error(&mut self, error: &str) {
        warn!(error, "transport error");
    }

    /// Inbound envelope from the server.
    pub fn on_envelope(&mut self, envelope: Envelope, now: u64) {
        if self.dead {
            debug!(kind = %envelope.kind, "dropping envelope on dead session");
            return;
        }
        self.touch(now);
        let msg = match Message::decode(&envelope) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(kind = %envelope.kind, "dropping unknown envelope type");
                return;
            }
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "dropping malformed envelope");
                return;
            }
        };
        match msg {
            Message::Response { id, response } => self.on_response(id, response, now),
            Message::Var(var) => self.on_remote_var(var),
            Message::Disconnect { reason } => {
                // Confirm before the server tears the link down.
                self.send_untracked(Message::Disconnect { reason: None }, now);
                let reason = reason
                    .as_deref()
                    .map(DisconnectReason::from_remote)
                    .unwrap_or_else(|| DisconnectReason::Remote("server".into()));
                self.die(reason);
            }
            Message::Socket(body) => self.events.push(ClientEvent::Socket(body)),
            other => debug!(kind = other.kind().as_str(), "ignoring server-bound message"),
        }
    }

    /// Timers: connect-timeout watchdog and heartbeat.
    pub fn tick(&mut self, now: u64) {
        if self.dead {
            return;
        }
        if let Some(deadline) = self.watchdog {
            if now >= deadline && self.state != ClientState::Active {
                warn!(state = ?self.state, "connect timed out");
                self.die(DisconnectReason::Timeout);
                return;
            }
        }
        match self.heartbeat.poll(now) {
            Beat::Idle => {}
            Beat::Probe => {
                let (kind, body) = Message::Heartbeat.into_parts();
                self.dispatch(kind, body, now, Origin::Heartbeat);
            }
            Beat::Exhausted => {
                warn!(
                    misses = self.heartbeat.misses(),
                    "heartbeats unanswered; link considered lost"
                );
                self.begin_reconnect(now, DisconnectReason::Timeout);
            }
        }
    }

    /// Send a request with a raw type string. Resolves with the server's `{status, body}`.
    pub fn send(&mut self, kind: impl Into<String>, body: Value, now: u64) -> PendingResponse {
        if self.dead {
            return PendingResponse::rejected(RequestError::ConnectionDead);
        }
        let (reply, pending) = PendingResponse::channel();
        self.dispatch(kind.into(), body, now, Origin::Caller(reply));
        pending
    }

    /// `post/<path>` RPC to a server handler.
    pub fn post(&mut self, path: &str, body: Value, now: u64) -> PendingResponse {
        self.send(format!("post/{path}"), body, now)
    }

    /// Synchronous read of an active variable.
    pub fn active(&self, name: &str) -> Option<&Value> {
        self.variables.get(VarMode::Active, name).map(|v| v.value())
    }

    /// Last lazy value seen; may be stale.
    pub fn cached_lazy(&self, name: &str) -> Option<&Value> {
        self.variables.get(VarMode::Lazy, name).map(|v| v.value())
    }

    /// Local write to an active variable stamped `(now, self)`. If it wins, the server is told.
    /// Returns the server's ack, or `None` when the write lost to a newer stamp.
    pub fn set_active(&mut self, name: &str, value: Value, now: u64) -> Option<PendingResponse> {
        self.write(VarMode::Active, name, value, now)
    }

    /// Local write to a lazy variable; the server stores it for later reads, nobody is pushed.
    pub fn set_lazy(&mut self, name: &str, value: Value, now: u64) -> Option<PendingResponse> {
        self.write(VarMode::Lazy, name, value, now)
    }

    fn write(&mut self, mode: VarMode, name: &str, value: Value, now: u64) -> Option<PendingResponse> {
        if self.dead {
            return Some(PendingResponse::rejected(RequestError::ConnectionDead));
        }
        let stamp = Stamp::new(now, self.peer_id.clone());
        let outcome = self.variables.apply(mode, name, value.clone(), stamp);
        if !outcome.is_applied() {
            debug!(name, "local write lost to a newer stamp");
            return None;
        }
        if outcome.changed(&value) {
            self.events.push(ClientEvent::VariableChanged {
                name: name.to_owned(),
                mode,
                value: value.clone(),
            });
        }
        let var = VarMessage::set(name, mode, value, self.peer_id.clone(), now);
        Some(self.send_var(var, now))
    }

    /// Fetch a lazy variable from the server. Never answered from the local cache.
    pub fn read_lazy(&mut self, name: &str, now: u64) -> PendingResponse {
        if self.dead {
            return PendingResponse::rejected(RequestError::ConnectionDead);
        }
        let (reply, pending) = PendingResponse::channel();
        let (kind, body) = Message::Var(VarMessage::read(name, VarMode::Lazy)).into_parts();
        self.dispatch(
            kind,
            body,
            now,
            Origin::LazyRead {
                name: name.to_owned(),
                reply,
            },
        );
        pending
    }

    /// Local teardown: tell the server if connected, then die without waiting.
    pub fn disconnect(&mut self, now: u64) {
        if self.dead {
            return;
        }
        if matches!(self.state, ClientState::AwaitingInit | ClientState::Active) {
            self.send_untracked(Message::DisconnectRequest, now);
        }
        self.die(DisconnectReason::Local);
    }

    fn send_var(&mut self, var: VarMessage, now: u64) -> PendingResponse {
        let (kind, body) = Message::Var(var).into_parts();
        self.send(kind, body, now)
    }

    fn dispatch(&mut self, kind: String, body: Value, now: u64, origin: Origin) {
        let envelope = self.correlation.register(kind, body, now, origin);
        if self.state == ClientState::Active {
            self.transmit(&envelope);
        } else {
            self.correlation.enqueue(envelope);
        }
    }

    fn send_untracked(&mut self, msg: Message, now: u64) {
        let envelope = msg.into_envelope(None, now);
        self.transmit(&envelope);
    }

    /// A failed send leaves the request pending; the reconnect resend covers it.
    fn transmit(&mut self, envelope: &Envelope) {
        let Some(channel) = self.channel.as_mut() else {
            debug!(kind = %envelope.kind, "no channel; envelope not sent");
            return;
        };
        if let Err(e) = channel.send(envelope) {
            warn!(kind = %envelope.kind, error = %e, "send failed");
        }
    }

    fn touch(&mut self, now: u64) {
        if self.watchdog.is_some() {
            self.watchdog = Some(now.saturating_add(self.config.connect_timeout_ms));
        }
    }

    fn on_response(&mut self, id: u32, response: Response, now: u64) {
        match self.correlation.resolve(id, response) {
            None => debug!(id, "response for unknown request"),
            Some(Resolution::Delivered) => {}
            Some(Resolution::Heartbeat) => self.heartbeat.on_response(),
            Some(Resolution::Init(response)) => self.on_init(response, now),
            Some(Resolution::LazyRead {
                name,
                reply,
                response,
            }) => {
                let answer = if response.is_ok() {
                    match serde_json::from_value::<VarState>(response.body.clone()) {
                        Ok(state) => {
                            let value = state.value.clone();
                            self.apply_remote(VarMode::Lazy, &name, state);
                            Response::new(response.status, value)
                        }
                        Err(e) => {
                            warn!(name, error = %e, "malformed lazy read reply");
                            response
                        }
                    }
                } else {
                    response
                };
                let _ = reply.send(Ok(answer));
            }
        }
    }

    fn on_init(&mut self, response: Response, now: u64) {
        if !response.is_ok() {
            warn!(status = response.status, "init refused");
            return;
        }
        match serde_json::from_value::<VariableSnapshot>(response.body) {
            Ok(snapshot) => {
                for (mode, name, value) in self.variables.seed(snapshot) {
                    self.events
                        .push(ClientEvent::VariableChanged { name, mode, value });
                }
            }
            Err(e) => warn!(error = %e, "malformed init snapshot"),
        }
        self.state = ClientState::Active;
        self.watchdog = None;
        for envelope in self.correlation.drain_queue() {
            self.transmit(&envelope);
        }
        self.heartbeat.start(now);
        if self.initialized {
            info!(server = %self.server_id, "reconnected");
            self.events.push(ClientEvent::Reconnected);
        } else {
            info!(server = %self.server_id, "connected");
            self.initialized = true;
            self.events.push(ClientEvent::Connected);
        }
    }

    fn on_remote_var(&mut self, var: VarMessage) {
        if var.action != VarAction::Set {
            debug!(name = %var.name, "ignoring var read from server");
            return;
        }
        let state = VarState {
            value: var.value.unwrap_or(Value::Null),
            time: var.time.unwrap_or(0),
            from: var.from.unwrap_or_else(|| self.server_id.clone()),
        };
        self.apply_remote(var.mode, &var.name, state);
    }

    /// Apply a server-originated write. Never echoed back.
    fn apply_remote(&mut self, mode: VarMode, name: &str, state: VarState) {
        let outcome = self
            .variables
            .apply(mode, name, state.value, Stamp::new(state.time, state.from));
        if let Some(var) = self.variables.get(mode, name) {
            if outcome.changed(var.value()) {
                self.events.push(ClientEvent::VariableChanged {
                    name: name.to_owned(),
                    mode,
                    value: var.value().clone(),
                });
            }
        }
    }

    /// Link lost: stop heartbeats, schedule resends, open a new connection.
    /// Only leaving `Active` arms a fresh watchdog; repeated failures keep the running deadline.
    fn begin_reconnect(&mut self, now: u64, reason: DisconnectReason) {
        self.heartbeat.stop();
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if !self.config.auto_reconnect {
            self.die(reason);
            return;
        }
        let was_active = self.state == ClientState::Active;
        let resent = self.correlation.prepare_resend();
        debug!(resent, "requests scheduled for retransmission");
        if was_active || self.watchdog.is_none() {
            self.watchdog = Some(now.saturating_add(self.config.connect_timeout_ms));
        }
        if self.state != ClientState::Reconnecting {
            self.events.push(ClientEvent::Reconnecting);
        }
        self.state = ClientState::Reconnecting;
        self.connect();
    }

    fn die(&mut self, reason: DisconnectReason) {
        if self.dead {
            return;
        }
        info!(reason = %reason, "session disconnected");
        self.dead = true;
        self.heartbeat.stop();
        self.watchdog = None;
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.correlation.reject_all(RequestError::Closed);
        self.state = ClientState::Disconnected(reason.clone());
        self.events.push(ClientEvent::Disconnected(reason));
    }
}
