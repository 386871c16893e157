//! TCP host transport: hello (version + peer ID), then length-prefixed JSON envelope frames.
//! Every link reports to the owning actor over one `mpsc` channel tagged with a link ID, so the
//! actor can ignore events from links it has already replaced.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peersync_core::wire::{decode_frame, encode_frame, LEN_SIZE, MAX_FRAME_LEN};
use peersync_core::{Channel, Envelope, PeerId, Transport, TransportError, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Longest peer ID accepted in a hello.
const MAX_HELLO_ID: usize = 1024;
/// Pause before re-dialing, so a refused server does not turn into a busy loop.
const REDIAL_DELAY: Duration = Duration::from_millis(250);

pub type LinkId = u64;

/// Link activity reported to the actor.
#[derive(Debug)]
pub enum LinkEvent {
    /// Server side: a client finished its hello.
    Accepted {
        link: LinkId,
        peer: PeerId,
        channel: TcpChannel,
    },
    /// Client side: the dial succeeded and the hello was sent.
    Opened { link: LinkId },
    Envelope {
        link: LinkId,
        peer: PeerId,
        envelope: Envelope,
    },
    Error { link: LinkId, error: String },
    Closed { link: LinkId, peer: PeerId },
}

/// Outbound half of a link. Frames are queued to a writer task; closing drops the queue,
/// which ends the writer and shuts the socket down.
#[derive(Debug)]
pub struct TcpChannel {
    frames: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl TcpChannel {
    fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { frames: Some(tx) }, rx)
    }
}

impl Channel for TcpChannel {
    fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let tx = self.frames.as_ref().ok_or(TransportError::Closed)?;
        let frame = encode_frame(envelope).map_err(|e| TransportError::Io(e.to_string()))?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.frames = None;
    }
}

/// Hello bytes: version, u16 LE ID length, ID.
pub fn hello_bytes(peer: &PeerId) -> std::io::Result<Vec<u8>> {
    let id = peer.as_str().as_bytes();
    if id.len() > MAX_HELLO_ID {
        return Err(invalid_data("peer id too long"));
    }
    let mut out = Vec::with_capacity(3 + id.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&(id.len() as u16).to_le_bytes());
    out.extend_from_slice(id);
    Ok(out)
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<PeerId> {
    let mut head = [0u8; 3];
    r.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(invalid_data("unsupported protocol version"));
    }
    let len = u16::from_le_bytes([head[1], head[2]]) as usize;
    if len == 0 || len > MAX_HELLO_ID {
        return Err(invalid_data("bad peer id length"));
    }
    let mut id = vec![0u8; len];
    r.read_exact(&mut id).await?;
    let id = String::from_utf8(id).map_err(|_| invalid_data("peer id not utf-8"))?;
    Ok(PeerId::new(id))
}

/// Read one frame. `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_envelope<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Option<Envelope>> {
    let mut buf = vec![0u8; LEN_SIZE];
    match r.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(invalid_data("frame too large"));
    }
    buf.resize(LEN_SIZE + len as usize, 0);
    r.read_exact(&mut buf[LEN_SIZE..]).await?;
    let (envelope, _) = decode_frame(&buf).map_err(|e| invalid_data(&e.to_string()))?;
    Ok(Some(envelope))
}

fn invalid_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_owned())
}

/// Pump one established link: a writer task drains `frames`, this task reads until EOF or error.
async fn run_link<S>(
    stream: S,
    link: LinkId,
    peer: PeerId,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
        let _ = writer.shutdown().await;
    });
    loop {
        match read_envelope(&mut reader).await {
            Ok(Some(envelope)) => {
                let event = LinkEvent::Envelope {
                    link,
                    peer: peer.clone(),
                    envelope,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(LinkEvent::Error {
                    link,
                    error: e.to_string(),
                });
                break;
            }
        }
    }
    let _ = events.send(LinkEvent::Closed { link, peer });
}

/// Accept loop for the server: each connection sends a hello, then becomes a link.
pub async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<LinkEvent>) {
    let mut next_link: LinkId = 0;
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        next_link += 1;
        let link = next_link;
        let events = events.clone();
        tokio::spawn(async move {
            let peer = match read_hello(&mut stream).await {
                Ok(peer) => peer,
                Err(e) => {
                    debug!(%addr, error = %e, "bad hello");
                    return;
                }
            };
            info!(%addr, peer = %peer, link, "peer link accepted");
            let (channel, frames) = TcpChannel::new();
            let accepted = LinkEvent::Accepted {
                link,
                peer: peer.clone(),
                channel,
            };
            if events.send(accepted).is_err() {
                return;
            }
            run_link(stream, link, peer, frames, events).await;
        });
    }
}

/// Shared view of the client transport's newest link.
#[derive(Debug, Clone, Default)]
pub struct LinkTracker(Arc<AtomicU64>);

impl LinkTracker {
    pub fn is_current(&self, link: LinkId) -> bool {
        self.0.load(Ordering::SeqCst) == link
    }
}

/// Client-side transport: each `connect` dials `server_addr` in the background and hands back a
/// channel whose frames are buffered until the socket is up.
pub struct TcpTransport {
    server_addr: String,
    local: PeerId,
    events: mpsc::UnboundedSender<LinkEvent>,
    links: LinkTracker,
}

impl TcpTransport {
    pub fn new(server_addr: String, local: PeerId, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            server_addr,
            local,
            events,
            links: LinkTracker::default(),
        }
    }

    pub fn links(&self) -> LinkTracker {
        self.links.clone()
    }
}

impl Transport for TcpTransport {
    type Channel = TcpChannel;

    fn connect(&mut self, target: &PeerId) -> Option<TcpChannel> {
        let addr: SocketAddr = match self.server_addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(addr = %self.server_addr, error = %e, "invalid server address");
                return None;
            }
        };
        let link = self.links.0.fetch_add(1, Ordering::SeqCst) + 1;
        let redial = link > 1;
        let hello = match hello_bytes(&self.local) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "cannot build hello");
                return None;
            }
        };
        let (channel, frames) = TcpChannel::new();
        let events = self.events.clone();
        let peer = target.clone();
        tokio::spawn(async move {
            if redial {
                tokio::time::sleep(REDIAL_DELAY).await;
            }
            let mut stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(LinkEvent::Error {
                        link,
                        error: e.to_string(),
                    });
                    let _ = events.send(LinkEvent::Closed { link, peer });
                    return;
                }
            };
            if let Err(e) = stream.write_all(&hello).await {
                let _ = events.send(LinkEvent::Error {
                    link,
                    error: e.to_string(),
                });
                let _ = events.send(LinkEvent::Closed { link, peer });
                return;
            }
            debug!(%addr, link, "connected");
            if events.send(LinkEvent::Opened { link }).is_err() {
                return;
            }
            run_link(stream, link, peer, frames, events).await;
        });
        Some(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_core::Message;
    use serde_json::json;

    #[tokio::test]
    async fn hello_round_trip() {
        let bytes = hello_bytes(&PeerId::from("alice")).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(&bytes[1..3], &5u16.to_le_bytes());
        let mut r = &bytes[..];
        assert_eq!(read_hello(&mut r).await.unwrap(), PeerId::from("alice"));
    }

    #[tokio::test]
    async fn hello_rejects_other_versions() {
        let mut bytes = hello_bytes(&PeerId::from("alice")).unwrap();
        bytes[0] = PROTOCOL_VERSION.wrapping_add(1);
        let mut r = &bytes[..];
        assert!(read_hello(&mut r).await.is_err());
    }

    #[tokio::test]
    async fn frames_read_back_in_order_then_eof() {
        let first = Message::Post {
            path: "sum".into(),
            body: json!({"a": 2, "b": 3}),
        }
        .into_envelope(Some(1), 10);
        let second = Message::Heartbeat.into_envelope(Some(2), 11);
        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());
        let mut r = &bytes[..];
        assert_eq!(read_envelope(&mut r).await.unwrap(), Some(first));
        assert_eq!(read_envelope(&mut r).await.unwrap(), Some(second));
        assert_eq!(read_envelope(&mut r).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let bytes = (MAX_FRAME_LEN + 1).to_le_bytes();
        let mut r = &bytes[..];
        assert!(read_envelope(&mut r).await.is_err());
    }

    #[tokio::test]
    async fn link_delivers_envelopes_and_close() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (mut channel, frames) = TcpChannel::new();
        tokio::spawn(run_link(ours, 7, PeerId::from("bob"), frames, events_tx));

        let (mut their_r, mut their_w) = tokio::io::split(theirs);
        let ping = Message::Heartbeat.into_envelope(Some(0), 1);
        their_w.write_all(&encode_frame(&ping).unwrap()).await.unwrap();
        match events.recv().await.unwrap() {
            LinkEvent::Envelope { link, peer, envelope } => {
                assert_eq!(link, 7);
                assert_eq!(peer, PeerId::from("bob"));
                assert_eq!(envelope, ping);
            }
            other => panic!("unexpected {other:?}"),
        }

        let pong = Message::Socket(json!("hi")).into_envelope(None, 2);
        channel.send(&pong).unwrap();
        assert_eq!(read_envelope(&mut their_r).await.unwrap(), Some(pong));

        channel.close();
        assert_eq!(channel.send(&ping), Err(TransportError::Closed));
        assert_eq!(read_envelope(&mut their_r).await.unwrap(), None);
        their_w.shutdown().await.unwrap();
        loop {
            if let LinkEvent::Closed { link, .. } = events.recv().await.unwrap() {
                assert_eq!(link, 7);
                break;
            }
        }
    }
}
