//! Transport adapter seam. The core never touches bytes: hosts supply channels that carry envelopes
//! and report `open`/`data`/`close`/`error` by calling the session's `on_*` methods.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::TransportError;
use crate::identity::PeerId;
use crate::protocol::Envelope;

/// One point-to-point link.
pub trait Channel {
    fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;
    fn close(&mut self);
}

/// Opens channels to a target peer. `None` means the target is unknown or unreachable.
pub trait Transport {
    type Channel: Channel;

    fn connect(&mut self, target: &PeerId) -> Option<Self::Channel>;
}

#[derive(Debug, Default)]
struct MemoryLink {
    sent: VecDeque<Envelope>,
    closed: bool,
}

/// In-process channel: records what was sent so the embedder can hand it to the other side.
/// Clones share the same link.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    link: Rc<RefCell<MemoryLink>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent since the last call, in order.
    pub fn take_sent(&self) -> Vec<Envelope> {
        self.link.borrow_mut().sent.drain(..).collect()
    }

    pub fn sent_len(&self) -> usize {
        self.link.borrow().sent.len()
    }

    pub fn is_closed(&self) -> bool {
        self.link.borrow().closed
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut link = self.link.borrow_mut();
        if link.closed {
            return Err(TransportError::Closed);
        }
        link.sent.push_back(envelope.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.link.borrow_mut().closed = true;
    }
}

#[derive(Debug)]
struct MemoryNetwork {
    reachable: bool,
    /// Only the newest channel is kept; older ones belong to replaced links.
    latest: Option<MemoryChannel>,
    connects: usize,
}

/// In-process transport handing out `MemoryChannel`s. Clones share state, so a test can keep a
/// handle while the session owns another.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    net: Rc<RefCell<MemoryNetwork>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            net: Rc::new(RefCell::new(MemoryNetwork {
                reachable: true,
                latest: None,
                connects: 0,
            })),
        }
    }

    /// Make `connect` return `None` (or channels again).
    pub fn set_reachable(&self, reachable: bool) {
        self.net.borrow_mut().reachable = reachable;
    }

    /// Most recently opened channel.
    pub fn last_channel(&self) -> Option<MemoryChannel> {
        self.net.borrow().latest.clone()
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> usize {
        self.net.borrow().connects
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    type Channel = MemoryChannel;

    fn connect(&mut self, _target: &PeerId) -> Option<MemoryChannel> {
        let mut net = self.net.borrow_mut();
        if !net.reachable {
            return None;
        }
        let channel = MemoryChannel::new();
        net.latest = Some(channel.clone());
        net.connects += 1;
        Some(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    #[test]
    fn closed_channel_refuses_sends() {
        let mut ch = MemoryChannel::new();
        let env = Message::Heartbeat.into_envelope(Some(0), 0);
        ch.send(&env).unwrap();
        ch.close();
        assert_eq!(ch.send(&env), Err(TransportError::Closed));
        assert_eq!(ch.take_sent(), vec![env]);
        assert!(ch.is_closed());
    }

    #[test]
    fn transport_tracks_channels() {
        let mut transport = MemoryTransport::new();
        let handle = transport.clone();
        let target = PeerId::from("server");
        assert!(transport.connect(&target).is_some());
        handle.set_reachable(false);
        assert!(transport.connect(&target).is_none());
        assert_eq!(handle.connects(), 1);
        assert!(handle.last_channel().is_some());
    }

    #[test]
    fn reconnects_keep_only_the_newest_channel() {
        let mut transport = MemoryTransport::new();
        let handle = transport.clone();
        let target = PeerId::from("server");
        let mut first = transport.connect(&target).unwrap();
        first.close();
        let second = transport.connect(&target).unwrap();
        assert_eq!(handle.connects(), 2);
        assert_eq!(Rc::strong_count(&first.link), 1);
        assert!(Rc::ptr_eq(&handle.last_channel().unwrap().link, &second.link));
    }
}
