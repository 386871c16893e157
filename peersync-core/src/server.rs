//! Server core: connection registry, auth, post routing, authoritative variable store, eviction sweep.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::heartbeat::{stale_peers, Sweep};
use crate::identity::PeerId;
use crate::protocol::{status, Envelope, Message, Response, VarAction, VarMessage, VarMode, VariableSnapshot};
use crate::transport::Channel;
use crate::variable::{Stamp, VariableStore, WriteOutcome};

/// Reason broadcast to every peer by a graceful `disconnect()`.
pub const SHUTDOWN_REASON: &str = "server shutdown";

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Evicted by the heartbeat sweep.
    Timeout,
    /// Client sent `disconnect-req`.
    Requested,
    /// Client confirmed a server `disconnect`.
    Confirmed,
    /// Transport closed.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PeerConnected(PeerId),
    /// Emitted once per `PeerConnected`.
    PeerDisconnected { peer: PeerId, reason: LeaveReason },
    VariableChanged {
        name: String,
        mode: VarMode,
        value: Value,
    },
}

/// Token for answering a post request after the handler returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    pub peer: PeerId,
    pub id: u32,
}

#[derive(Debug, Clone)]
pub struct PostRequest {
    pub peer: PeerId,
    pub path: String,
    pub body: Value,
    /// `None` when the request carried no correlation ID (nothing can be answered).
    pub reply_to: Option<ReplyTo>,
}

/// Handler-side response builder.
#[derive(Debug)]
pub struct Responder {
    status: u16,
    body: Option<Value>,
}

impl Responder {
    fn new() -> Self {
        Self {
            status: status::OK,
            body: None,
        }
    }

    pub fn status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    pub fn send(&mut self, body: impl Into<Value>) {
        self.body = Some(body.into());
    }

    pub fn has_replied(&self) -> bool {
        self.body.is_some()
    }

    fn into_response(self) -> Option<Response> {
        let status = self.status;
        self.body.map(|body| Response::new(status, body))
    }
}

/// Returns `true` to keep the request open and answer later with `ServerCore::reply`.
pub type PostHandler = Box<dyn FnMut(&PostRequest, &mut Responder) -> bool>;

#[derive(Debug)]
pub struct ConnectionRecord<C> {
    peer_id: PeerId,
    channel: C,
    last_heartbeat: u64,
    authenticated: bool,
    /// Set once the server has asked this peer to disconnect.
    closing_reason: Option<String>,
}

impl<C> ConnectionRecord<C> {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn closing_reason(&self) -> Option<&str> {
        self.closing_reason.as_deref()
    }
}

pub struct ServerCore<C: Channel> {
    config: SessionConfig,
    peer_id: PeerId,
    password: Option<String>,
    connections: HashMap<PeerId, ConnectionRecord<C>>,
    handlers: HashMap<String, PostHandler>,
    variables: VariableStore,
    sweep: Sweep,
    events: Vec<ServerEvent>,
}

impl<C: Channel> ServerCore<C> {
    pub fn new(config: SessionConfig, peer_id: PeerId) -> Self {
        let sweep = Sweep::new(config.sweep_interval_ms());
        Self {
            config,
            peer_id,
            password: None,
            connections: HashMap::new(),
            handlers: HashMap::new(),
            variables: VariableStore::new(),
            sweep,
            events: Vec::new(),
        }
    }

    /// Require clients to present `password` in `init`. Empty means no password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Register (or replace) the handler for `post/<path>`.
    pub fn post<F>(&mut self, path: impl Into<String>, handler: F)
    where
        F: FnMut(&PostRequest, &mut Responder) -> bool + 'static,
    {
        self.handlers.insert(path.into(), Box::new(handler));
    }

    /// Number of registered connections, authenticated or not.
    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&ConnectionRecord<C>> {
        self.connections.get(peer)
    }

    pub fn is_authenticated(&self, peer: &PeerId) -> bool {
        self.connections.get(peer).is_some_and(|c| c.authenticated)
    }

    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// New transport link from `peer`. Replaces any previous link for the same peer.
    pub fn on_connection(&mut self, peer: PeerId, channel: C, now: u64) {
        debug!(peer = %peer, "connection opened");
        self.remove(&peer, LeaveReason::Closed);
        self.connections.insert(
            peer.clone(),
            ConnectionRecord {
                peer_id: peer,
                channel,
                last_heartbeat: now,
                authenticated: false,
                closing_reason: None,
            },
        );
    }

    /// Transport reports the link to `peer` closed.
    pub fn on_close(&mut self, peer: &PeerId) {
        if self.remove(peer, LeaveReason::Closed) {
            info!(peer = %peer, "connection closed");
        }
    }

    pub fn on_envelope(&mut self, peer: &PeerId, envelope: Envelope, now: u64) {
        let Some(authenticated) = self.connections.get(peer).map(|c| c.authenticated) else {
            debug!(peer = %peer, kind = %envelope.kind, "envelope from unknown connection");
            return;
        };
        let msg = match Message::decode(&envelope) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(peer = %peer, kind = %envelope.kind, "dropping unknown envelope type");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, kind = %envelope.kind, error = %e, "dropping malformed envelope");
                return;
            }
        };
        let id = envelope.id();
        match msg {
            Message::Init { credential } => self.on_init(peer, id, &credential),
            Message::Disconnect { .. } => {
                self.remove(peer, LeaveReason::Confirmed);
            }
            _ if !authenticated => {
                debug!(peer = %peer, kind = %envelope.kind, "ignoring envelope before init");
            }
            Message::Heartbeat => {
                if let Some(conn) = self.connections.get_mut(peer) {
                    conn.last_heartbeat = now;
                }
                self.respond(peer, id, Response::ok(Value::Null));
            }
            Message::Post { path, body } => self.on_post(peer, id, path, body),
            Message::Var(var) => self.on_var(peer, id, var, now),
            Message::DisconnectRequest => {
                info!(peer = %peer, "peer requested disconnect");
                self.remove(peer, LeaveReason::Requested);
            }
            Message::Response { .. } | Message::Socket(_) => {
                debug!(peer = %peer, kind = %envelope.kind, "ignoring client-bound message");
            }
        }
    }

    /// Run the eviction sweep when due.
    pub fn tick(&mut self, now: u64) {
        if !self.sweep.due(now) {
            return;
        }
        let stale = stale_peers(
            self.connections.values().map(|c| (&c.peer_id, c.last_heartbeat)),
            now,
            self.config.stale_after_ms(),
        );
        for peer in stale {
            warn!(peer = %peer, "evicting silent peer");
            self.remove(&peer, LeaveReason::Timeout);
        }
    }

    pub fn active(&self, name: &str) -> Option<&Value> {
        self.variables.get(VarMode::Active, name).map(|v| v.value())
    }

    pub fn lazy(&self, name: &str) -> Option<&Value> {
        self.variables.get(VarMode::Lazy, name).map(|v| v.value())
    }

    pub fn snapshot(&self) -> VariableSnapshot {
        self.variables.snapshot()
    }

    /// Local write stamped `(now, self)`; a winning write is announced to every authenticated peer.
    /// Returns whether the write won.
    pub fn set_active(&mut self, name: &str, value: Value, now: u64) -> bool {
        let stamp = Stamp::new(now, self.peer_id.clone());
        self.write(VarMode::Active, name, value, stamp)
    }

    /// Local write to a lazy variable; readers fetch it on demand.
    pub fn set_lazy(&mut self, name: &str, value: Value, now: u64) -> bool {
        let stamp = Stamp::new(now, self.peer_id.clone());
        self.write(VarMode::Lazy, name, value, stamp)
    }

    fn write(&mut self, mode: VarMode, name: &str, value: Value, stamp: Stamp) -> bool {
        let outcome = self.variables.apply(mode, name, value, stamp);
        if !outcome.is_applied() {
            debug!(name, "local write lost to a newer stamp");
            return false;
        }
        self.note_change(mode, name, &outcome);
        if mode == VarMode::Active {
            self.announce(name);
        }
        true
    }

    /// Fire-and-forget `socket` push to every authenticated peer.
    pub fn broadcast(&mut self, body: Value) {
        let envelope = Message::Socket(body).into_envelope(None, 0);
        for conn in self.connections.values_mut().filter(|c| c.authenticated) {
            if let Err(e) = conn.channel.send(&envelope) {
                warn!(peer = %conn.peer_id, error = %e, "broadcast send failed");
            }
        }
    }

    /// Fire-and-forget `socket` push to one peer. `false` if the peer is not connected.
    pub fn push(&mut self, peer: &PeerId, body: Value) -> bool {
        if !self.is_authenticated(peer) {
            return false;
        }
        self.send_to(peer, &Message::Socket(body).into_envelope(None, 0));
        true
    }

    /// Answer a deferred post request. `false` if the peer has gone.
    pub fn reply(&mut self, reply_to: &ReplyTo, response: Response) -> bool {
        if !self.connections.contains_key(&reply_to.peer) {
            debug!(peer = %reply_to.peer, id = reply_to.id, "reply for departed peer");
            return false;
        }
        self.respond(&reply_to.peer, Some(reply_to.id), response);
        true
    }

    /// Graceful shutdown: ask every peer to disconnect. Each confirmation deregisters that peer.
    pub fn disconnect(&mut self) {
        info!(peers = self.connections.len(), "disconnecting all peers");
        let peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        for peer in peers {
            self.disconnect_peer(&peer, SHUTDOWN_REASON);
        }
    }

    /// Ask one peer to disconnect with `reason`. `false` if the peer is not connected.
    pub fn disconnect_peer(&mut self, peer: &PeerId, reason: &str) -> bool {
        let Some(conn) = self.connections.get_mut(peer) else {
            return false;
        };
        conn.closing_reason = Some(reason.to_owned());
        let envelope = Message::Disconnect {
            reason: Some(reason.to_owned()),
        }
        .into_envelope(None, 0);
        self.send_to(peer, &envelope);
        true
    }

    fn on_init(&mut self, peer: &PeerId, id: Option<u32>, credential: &str) {
        if let Some(expected) = &self.password {
            if credential != expected.as_str() {
                warn!(peer = %peer, "init with wrong password");
                self.disconnect_peer(peer, "password");
                return;
            }
        }
        let newly = match self.connections.get_mut(peer) {
            Some(conn) => !std::mem::replace(&mut conn.authenticated, true),
            None => return,
        };
        let snapshot = serde_json::to_value(self.variables.snapshot()).unwrap_or(Value::Null);
        self.respond(peer, id, Response::ok(snapshot));
        if newly {
            info!(peer = %peer, "peer connected");
            self.events.push(ServerEvent::PeerConnected(peer.clone()));
        }
    }

    fn on_post(&mut self, peer: &PeerId, id: Option<u32>, path: String, body: Value) {
        let Some(handler) = self.handlers.get_mut(&path) else {
            debug!(peer = %peer, path = %path, "no handler for post");
            self.respond(peer, id, Response::not_found());
            return;
        };
        let request = PostRequest {
            peer: peer.clone(),
            path,
            body,
            reply_to: id.map(|id| ReplyTo {
                peer: peer.clone(),
                id,
            }),
        };
        let mut responder = Responder::new();
        let deferred = handler(&request, &mut responder);
        match responder.into_response() {
            Some(response) => self.respond(peer, id, response),
            None if !deferred => self.respond(peer, id, Response::ok(Value::Null)),
            None => debug!(peer = %peer, path = %request.path, "post reply deferred"),
        }
    }

    fn on_var(&mut self, peer: &PeerId, id: Option<u32>, var: VarMessage, now: u64) {
        match var.action {
            VarAction::Read => {
                let var = self.variables.get_or_create(var.mode, &var.name, peer);
                let state = serde_json::to_value(var.state()).unwrap_or(Value::Null);
                self.respond(peer, id, Response::ok(state));
            }
            VarAction::Set => {
                let stamp = Stamp::new(
                    var.time.unwrap_or(now),
                    var.from.unwrap_or_else(|| peer.clone()),
                );
                let value = var.value.unwrap_or(Value::Null);
                let outcome = self.variables.apply(var.mode, &var.name, value, stamp);
                self.note_change(var.mode, &var.name, &outcome);
                if var.mode == VarMode::Active {
                    // Losers learn the winner too.
                    self.announce(&var.name);
                }
                self.respond(peer, id, Response::ok(Value::Null));
            }
        }
    }

    fn note_change(&mut self, mode: VarMode, name: &str, outcome: &WriteOutcome) {
        let Some(var) = self.variables.get(mode, name) else {
            return;
        };
        if outcome.changed(var.value()) {
            self.events.push(ServerEvent::VariableChanged {
                name: name.to_owned(),
                mode,
                value: var.value().clone(),
            });
        }
    }

    /// Send the current winner of an active variable to every authenticated peer.
    fn announce(&mut self, name: &str) {
        let Some(var) = self.variables.get(VarMode::Active, name) else {
            return;
        };
        let stamp = var.stamp();
        let msg = VarMessage::set(
            name,
            VarMode::Active,
            var.value().clone(),
            stamp.updater.clone(),
            stamp.time,
        );
        let envelope = Message::Var(msg).into_envelope(None, stamp.time);
        for conn in self.connections.values_mut().filter(|c| c.authenticated) {
            if let Err(e) = conn.channel.send(&envelope) {
                warn!(peer = %conn.peer_id, error = %e, "variable announce failed");
            }
        }
    }

    fn respond(&mut self, peer: &PeerId, id: Option<u32>, response: Response) {
        let Some(id) = id else {
            debug!(peer = %peer, "request without id; no response sent");
            return;
        };
        self.send_to(peer, &Message::Response { id, response }.into_envelope(None, 0));
    }

    fn send_to(&mut self, peer: &PeerId, envelope: &Envelope) {
        if let Some(conn) = self.connections.get_mut(peer) {
            if let Err(e) = conn.channel.send(envelope) {
                warn!(peer = %peer, kind = %envelope.kind, error = %e, "send failed");
            }
        }
    }

    /// Close and deregister. Returns whether a record existed.
    fn remove(&mut self, peer: &PeerId, reason: LeaveReason) -> bool {
        let Some(mut conn) = self.connections.remove(peer) else {
            return false;
        };
        conn.channel.close();
        if conn.authenticated {
            self.events.push(ServerEvent::PeerDisconnected {
                peer: peer.clone(),
                reason,
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VarState;
    use crate::transport::MemoryChannel;
    use serde_json::json;

    const PERIOD: u64 = 1000;

    fn server() -> ServerCore<MemoryChannel> {
        let config = SessionConfig {
            heartbeat_period_ms: PERIOD,
            ..SessionConfig::default()
        };
        ServerCore::new(config, "server".into())
    }

    fn request(msg: Message, id: u32) -> Envelope {
        msg.into_envelope(Some(id), 0)
    }

    fn responses(channel: &MemoryChannel) -> Vec<(u32, Response)> {
        channel
            .take_sent()
            .iter()
            .filter_map(|env| match Message::decode(env) {
                Ok(Some(Message::Response { id, response })) => Some((id, response)),
                _ => None,
            })
            .collect()
    }

    /// Register `peer` and complete init. Returns its channel.
    fn join(server: &mut ServerCore<MemoryChannel>, peer: &str, now: u64) -> MemoryChannel {
        let channel = MemoryChannel::new();
        let peer = PeerId::from(peer);
        server.on_connection(peer.clone(), channel.clone(), now);
        server.on_envelope(
            &peer,
            request(
                Message::Init {
                    credential: String::new(),
                },
                0,
            ),
            now,
        );
        channel.take_sent();
        channel
    }

    #[test]
    fn init_responds_with_snapshot() {
        let mut server = server();
        server.set_active("score", json!(3), 10);
        let channel = MemoryChannel::new();
        let peer = PeerId::from("A");
        server.on_connection(peer.clone(), channel.clone(), 0);
        server.on_envelope(&peer, request(Message::Init { credential: String::new() }, 0), 0);
        let replies = responses(&channel);
        assert_eq!(replies.len(), 1);
        let snapshot: VariableSnapshot = serde_json::from_value(replies[0].1.body.clone()).unwrap();
        assert_eq!(snapshot.active["score"].value, json!(3));
        assert!(server.is_authenticated(&peer));
        assert!(server
            .drain_events()
            .contains(&ServerEvent::PeerConnected(peer)));
    }

    #[test]
    fn wrong_password_is_disconnected() {
        let mut server = server().with_password("secret");
        let channel = MemoryChannel::new();
        let peer = PeerId::from("A");
        server.on_connection(peer.clone(), channel.clone(), 0);
        server.on_envelope(&peer, request(Message::Init { credential: "guess".into() }, 0), 0);
        let sent = channel.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "disconnect");
        assert_eq!(sent[0].body, json!("password"));
        assert!(!server.is_authenticated(&peer));

        server.on_envelope(&peer, Message::Disconnect { reason: None }.into_envelope(None, 0), 1);
        assert_eq!(server.connections(), 0);
        assert!(channel.is_closed());
        assert!(server.drain_events().is_empty());
    }

    #[test]
    fn unauthenticated_requests_are_ignored() {
        let mut server = server();
        let channel = MemoryChannel::new();
        let peer = PeerId::from("A");
        server.on_connection(peer.clone(), channel.clone(), 0);
        server.on_envelope(&peer, request(Message::Heartbeat, 0), 0);
        server.on_envelope(
            &peer,
            request(
                Message::Post {
                    path: "echo".into(),
                    body: Value::Null,
                },
                1,
            ),
            0,
        );
        assert_eq!(channel.sent_len(), 0);
    }

    #[test]
    fn unregistered_post_is_404() {
        let mut server = server();
        let channel = join(&mut server, "A", 0);
        let peer = PeerId::from("A");
        server.on_envelope(
            &peer,
            request(
                Message::Post {
                    path: "echo".into(),
                    body: json!("hi"),
                },
                4,
            ),
            1,
        );
        assert_eq!(responses(&channel), vec![(4, Response::not_found())]);
    }

    #[test]
    fn handler_reply_and_auto_reply() {
        let mut server = server();
        server.post("sum", |req, res| {
            let a = req.body["a"].as_i64().unwrap_or(0);
            let b = req.body["b"].as_i64().unwrap_or(0);
            res.send(a + b);
            false
        });
        server.post("ping", |_, _| false);
        let channel = join(&mut server, "A", 0);
        let peer = PeerId::from("A");
        server.on_envelope(
            &peer,
            request(
                Message::Post {
                    path: "sum".into(),
                    body: json!({"a": 2, "b": 3}),
                },
                1,
            ),
            1,
        );
        server.on_envelope(
            &peer,
            request(
                Message::Post {
                    path: "ping".into(),
                    body: Value::Null,
                },
                2,
            ),
            1,
        );
        assert_eq!(
            responses(&channel),
            vec![(1, Response::ok(json!(5))), (2, Response::ok(Value::Null))]
        );
    }

    #[test]
    fn deferred_reply_uses_token() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut server = server();
        let parked: Rc<RefCell<Vec<ReplyTo>>> = Rc::default();
        let sink = parked.clone();
        server.post("slow", move |req, _| {
            if let Some(token) = &req.reply_to {
                sink.borrow_mut().push(token.clone());
            }
            true
        });
        let channel = join(&mut server, "A", 0);
        server.on_envelope(
            &"A".into(),
            request(
                Message::Post {
                    path: "slow".into(),
                    body: Value::Null,
                },
                9,
            ),
            1,
        );
        assert!(responses(&channel).is_empty());
        let token = parked.borrow_mut().pop().unwrap();
        assert!(server.reply(&token, Response::new(202, json!("done"))));
        assert_eq!(responses(&channel), vec![(9, Response::new(202, json!("done")))]);
    }

    #[test]
    fn inbound_active_set_rebroadcasts_winner() {
        let mut server = ServerCore::<MemoryChannel>::new(SessionConfig::default(), "B".into());
        let a = join(&mut server, "A", 0);
        let c = join(&mut server, "C", 0);
        assert!(server.set_active("score", json!(5), 100));
        a.take_sent();
        c.take_sent();
        server.drain_events();

        let write = VarMessage::set("score", VarMode::Active, json!(10), "A".into(), 100);
        server.on_envelope(&"A".into(), request(Message::Var(write), 3), 100);

        assert_eq!(server.active("score"), Some(&json!(5)));
        assert!(server.drain_events().is_empty());
        let to_a = a.take_sent();
        let announce = to_a.iter().find(|e| e.kind == "var").unwrap();
        assert_eq!(announce.body["value"], json!(5));
        assert_eq!(announce.body["from"], json!("B"));
        assert!(to_a.iter().any(|e| e.kind == "response/3"));
        assert!(c.take_sent().iter().any(|e| e.kind == "var"));
    }

    #[test]
    fn lazy_set_is_not_broadcast_and_read_creates() {
        let mut server = server();
        let a = join(&mut server, "A", 0);
        let write = VarMessage::set("cfg", VarMode::Lazy, json!(1), "A".into(), 5);
        server.on_envelope(&"A".into(), request(Message::Var(write), 1), 5);
        assert!(a.take_sent().iter().all(|e| e.kind != "var"));
        assert_eq!(server.lazy("cfg"), Some(&json!(1)));

        server.on_envelope(&"A".into(), request(Message::Var(VarMessage::read("fresh", VarMode::Lazy)), 2), 6);
        let replies = responses(&a);
        let state: VarState = serde_json::from_value(replies[0].1.body.clone()).unwrap();
        assert_eq!(state.value, Value::Null);
        assert_eq!(state.time, 0);
        assert_eq!(server.lazy("fresh"), Some(&Value::Null));
    }

    #[test]
    fn sweep_evicts_silent_peers_once() {
        let mut server = server();
        join(&mut server, "A", 0);
        let b = join(&mut server, "B", 0);
        server.drain_events();
        server.tick(0);
        for now in (500..=4000).step_by(500) {
            server.on_envelope(&"B".into(), request(Message::Heartbeat, 1), now);
            server.tick(now);
        }
        assert_eq!(server.connections(), 1);
        assert_eq!(
            server.drain_events(),
            vec![ServerEvent::PeerDisconnected {
                peer: "A".into(),
                reason: LeaveReason::Timeout
            }]
        );
        assert!(!b.is_closed());
        server.tick(8000);
        server.tick(10_000);
        assert_eq!(server.connections(), 0);
    }

    #[test]
    fn graceful_disconnect_waits_for_confirmations() {
        let mut server = server();
        let a = join(&mut server, "A", 0);
        join(&mut server, "B", 0);
        server.drain_events();
        server.disconnect();
        let sent = a.take_sent();
        assert_eq!(sent[0].kind, "disconnect");
        assert_eq!(sent[0].body, json!(SHUTDOWN_REASON));
        assert_eq!(server.connections(), 2);

        server.on_envelope(&"A".into(), Message::Disconnect { reason: None }.into_envelope(None, 0), 1);
        assert_eq!(server.connections(), 1);
        assert!(a.is_closed());
        assert_eq!(
            server.drain_events(),
            vec![ServerEvent::PeerDisconnected {
                peer: "A".into(),
                reason: LeaveReason::Confirmed
            }]
        );
    }

    #[test]
    fn disconnect_request_deregisters_immediately() {
        let mut server = server();
        join(&mut server, "A", 0);
        server.on_envelope(&"A".into(), Message::DisconnectRequest.into_envelope(None, 0), 1);
        assert_eq!(server.connections(), 0);
    }

    #[test]
    fn push_and_broadcast_reach_authenticated_only() {
        let mut server = server();
        let a = join(&mut server, "A", 0);
        let pending = MemoryChannel::new();
        server.on_connection("P".into(), pending.clone(), 0);
        server.broadcast(json!("all"));
        assert!(server.push(&"A".into(), json!("one")));
        assert!(!server.push(&"P".into(), json!("nope")));
        let bodies: Vec<Value> = a.take_sent().into_iter().map(|e| e.body).collect();
        assert_eq!(bodies, vec![json!("all"), json!("one")]);
        assert_eq!(pending.sent_len(), 0);
    }

    #[test]
    fn new_link_replaces_old_record() {
        let mut server = server();
        let old = join(&mut server, "A", 0);
        server.drain_events();
        let fresh = MemoryChannel::new();
        server.on_connection("A".into(), fresh, 5);
        assert!(old.is_closed());
        assert_eq!(server.connections(), 1);
        assert!(!server.is_authenticated(&"A".into()));
        assert_eq!(server.drain_events().len(), 1);
    }
}
