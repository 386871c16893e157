//! Client actor: owns the `ClientSession`, runs command-line actions once connected.

use peersync_core::{ClientEvent, ClientSession, PendingResponse};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::transport::{LinkEvent, LinkTracker, TcpTransport};
use crate::{now_ms, shutdown_signal, TICK};

/// Something to do once the session is up.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetActive { name: String, value: Value },
    SetLazy { name: String, value: Value },
    ReadLazy { name: String },
    Post { path: String, body: Value },
}

impl Action {
    fn label(&self) -> String {
        match self {
            Action::SetActive { name, .. } => format!("set {name}"),
            Action::SetLazy { name, .. } => format!("set-lazy {name}"),
            Action::ReadLazy { name } => format!("read {name}"),
            Action::Post { path, .. } => format!("post/{path}"),
        }
    }

    fn perform(self, session: &mut ClientSession<TcpTransport>, now: u64) -> Option<PendingResponse> {
        match self {
            Action::SetActive { name, value } => session.set_active(&name, value, now),
            Action::SetLazy { name, value } => session.set_lazy(&name, value, now),
            Action::ReadLazy { name } => Some(session.read_lazy(&name, now)),
            Action::Post { path, body } => Some(session.post(&path, body, now)),
        }
    }
}

/// Run one client session until it disconnects or the process is asked to stop.
/// With `once`, disconnect after every action has been answered.
pub async fn run(cfg: NodeConfig, actions: Vec<Action>, once: bool) -> anyhow::Result<()> {
    let peer_id = cfg.peer_id();
    info!(peer = %peer_id, server = %cfg.server_addr, "client starting");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let transport = TcpTransport::new(cfg.server_addr.clone(), peer_id.clone(), events_tx);
    let links: LinkTracker = transport.links();
    let mut session = ClientSession::new(
        cfg.session.clone(),
        peer_id,
        cfg.server_id.clone(),
        cfg.password.clone(),
        transport,
    );

    let (done_tx, mut done) = mpsc::unbounded_channel::<()>();
    let mut actions = Some(actions);
    let mut outstanding = 0usize;

    let mut ticker = tokio::time::interval(TICK);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    session.start(now_ms());
    loop {
        for event in session.drain_events() {
            match event {
                ClientEvent::Connected => {
                    info!("connected");
                    if let Some(actions) = actions.take() {
                        let now = now_ms();
                        for action in actions {
                            let label = action.label();
                            let Some(pending) = action.perform(&mut session, now) else {
                                info!(action = %label, "write lost to a newer value");
                                continue;
                            };
                            outstanding += 1;
                            let done = done_tx.clone();
                            tokio::spawn(async move {
                                match pending.await {
                                    Ok(response) => info!(
                                        action = %label,
                                        status = response.status,
                                        body = %response.body,
                                        "response"
                                    ),
                                    Err(e) => warn!(action = %label, error = %e, "request failed"),
                                }
                                let _ = done.send(());
                            });
                        }
                    }
                    if once && outstanding == 0 {
                        session.disconnect(now_ms());
                    }
                }
                ClientEvent::Reconnecting => info!("link lost; reconnecting"),
                ClientEvent::Reconnected => info!("reconnected"),
                ClientEvent::VariableChanged { name, mode, value } => {
                    info!(name = %name, ?mode, %value, "variable changed")
                }
                ClientEvent::Socket(body) => info!(%body, "server push"),
                ClientEvent::Disconnected(reason) => {
                    info!(reason = %reason, "disconnected");
                    return Ok(());
                }
            }
        }
        if session.is_dead() {
            return Ok(());
        }

        tokio::select! {
            Some(event) = events.recv() => {
                let now = now_ms();
                match event {
                    LinkEvent::Opened { link } if links.is_current(link) => session.on_open(now),
                    LinkEvent::Envelope { link, envelope, .. } if links.is_current(link) => {
                        session.on_envelope(envelope, now)
                    }
                    LinkEvent::Error { link, error } if links.is_current(link) => session.on_error(&error),
                    LinkEvent::Closed { link, .. } if links.is_current(link) => session.on_close(now),
                    other => debug!(?other, "event from stale link"),
                }
            }
            Some(()) = done.recv() => {
                outstanding = outstanding.saturating_sub(1);
                if once && outstanding == 0 {
                    session.disconnect(now_ms());
                }
            }
            _ = ticker.tick() => session.tick(now_ms()),
            res = &mut shutdown => {
                res?;
                session.disconnect(now_ms());
            }
        }
    }
}
