//! Server actor: owns the `ServerCore`, fed by link events, a tick interval and the shutdown signal.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use peersync_core::{Channel, LeaveReason, PeerId, PostRequest, Responder, ServerCore, ServerEvent};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::transport::{self, LinkEvent, LinkId, TcpChannel};
use crate::{now_ms, shutdown_signal, TICK};

struct ServerNode {
    core: ServerCore<TcpChannel>,
    /// Current link per peer; events from replaced links are ignored.
    links: HashMap<PeerId, LinkId>,
}

impl ServerNode {
    fn handle(&mut self, event: LinkEvent) {
        let now = now_ms();
        match event {
            LinkEvent::Accepted {
                link,
                peer,
                channel,
            } => {
                self.links.insert(peer.clone(), link);
                self.core.on_connection(peer, channel, now);
            }
            LinkEvent::Envelope {
                link,
                peer,
                envelope,
            } => {
                if self.links.get(&peer) == Some(&link) {
                    self.core.on_envelope(&peer, envelope, now);
                } else {
                    debug!(peer = %peer, link, "envelope from replaced link");
                }
            }
            LinkEvent::Error { link, error } => debug!(link, error = %error, "link error"),
            LinkEvent::Closed { link, peer } => {
                if self.links.get(&peer) == Some(&link) {
                    self.links.remove(&peer);
                    self.core.on_close(&peer);
                }
            }
            LinkEvent::Opened { .. } => {}
        }
        self.log_events();
    }

    fn log_events(&mut self) {
        for event in self.core.drain_events() {
            match event {
                ServerEvent::PeerConnected(peer) => {
                    info!(peer = %peer, peers = self.core.connections(), "peer joined")
                }
                ServerEvent::PeerDisconnected { peer, reason } => {
                    info!(peer = %peer, reason = leave_reason(reason), "peer left")
                }
                ServerEvent::VariableChanged { name, mode, value } => {
                    debug!(name = %name, ?mode, %value, "variable changed")
                }
            }
        }
    }
}

fn leave_reason(reason: LeaveReason) -> &'static str {
    match reason {
        LeaveReason::Timeout => "timeout",
        LeaveReason::Requested => "requested",
        LeaveReason::Confirmed => "confirmed",
        LeaveReason::Closed => "closed",
    }
}

/// Handlers every node server exposes.
pub fn register_builtin<C: Channel>(core: &mut ServerCore<C>) {
    core.post("sum", sum);
    core.post("ping", |_: &PostRequest, res: &mut Responder| {
        res.send("pong");
        false
    });
}

/// `post/sum {a, b}` → `a + b`. Non-numeric operands count as 0.
fn sum(req: &PostRequest, res: &mut Responder) -> bool {
    let operand = |key: &str| req.body.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let total = operand("a") + operand("b");
    if total.fract() == 0.0 && total.abs() < i64::MAX as f64 {
        res.send(total as i64);
    } else {
        res.send(json!(total));
    }
    false
}

pub async fn run(cfg: NodeConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding port {}", cfg.listen_port))?;
    info!(port = cfg.listen_port, id = %cfg.server_id, "server listening");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    tokio::spawn(transport::accept_loop(listener, events_tx));

    let mut core = ServerCore::new(cfg.session.clone(), cfg.server_id.clone()).with_password(cfg.password.clone());
    register_builtin(&mut core);
    let mut node = ServerNode {
        core,
        links: HashMap::new(),
    };

    let mut ticker = tokio::time::interval(TICK);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            Some(event) = events.recv() => node.handle(event),
            _ = ticker.tick() => {
                node.core.tick(now_ms());
                node.log_events();
            }
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }

    // Graceful: ask everyone to leave, wait for confirmations up to the connect timeout.
    node.core.disconnect();
    let grace = tokio::time::sleep(Duration::from_millis(cfg.session.connect_timeout_ms));
    tokio::pin!(grace);
    while node.core.connections() > 0 {
        tokio::select! {
            Some(event) = events.recv() => node.handle(event),
            _ = &mut grace => {
                info!(remaining = node.core.connections(), "shutdown grace period over");
                break;
            }
        }
    }
    info!("server stopped");
    Ok(())
}
