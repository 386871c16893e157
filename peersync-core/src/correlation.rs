//! Request/response correlation: ID pool, pending-request table, send queue, resend policy.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::protocol::{split_type, Envelope, MessageKind, Response};

type Reply = oneshot::Sender<Result<Response, RequestError>>;

/// Request IDs. Freed IDs are reused (smallest first) before the counter advances.
#[derive(Debug, Clone, Default)]
pub struct IdPool {
    next_id: u32,
    freed: BTreeSet<u32>,
}

impl IdPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> u32 {
        if let Some(id) = self.freed.pop_first() {
            return id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Return an ID to the pool. Refuses IDs never issued or already free.
    pub fn release(&mut self, id: u32) -> bool {
        if id >= self.next_id || self.freed.contains(&id) {
            return false;
        }
        self.freed.insert(id);
        true
    }

    /// IDs issued and not yet released.
    pub fn in_use(&self) -> usize {
        self.next_id as usize - self.freed.len()
    }
}

/// Future for one request's response. Resolves once; also pollable without a runtime via `try_take`.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Response, RequestError>>,
}

impl PendingResponse {
    pub(crate) fn channel() -> (Reply, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn rejected(err: RequestError) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(Err(err));
        pending
    }

    /// Take the result if it has arrived. Yields `Some` at most once.
    pub fn try_take(&mut self) -> Option<Result<Response, RequestError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RequestError::Discarded)),
        }
    }
}

impl Future for PendingResponse {
    type Output = Result<Response, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(RequestError::Discarded)))
    }
}

/// Who is waiting on a request.
#[derive(Debug)]
pub(crate) enum Origin {
    Caller(Reply),
    Heartbeat,
    Init,
    LazyRead { name: String, reply: Reply },
}

impl Origin {
    fn reject(self, err: RequestError) {
        match self {
            Origin::Caller(reply) | Origin::LazyRead { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Origin::Heartbeat | Origin::Init => {}
        }
    }
}

/// What `resolve` found for a response.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// A caller future was fulfilled.
    Delivered,
    Heartbeat,
    Init(Response),
    LazyRead {
        name: String,
        reply: Reply,
        response: Response,
    },
}

#[derive(Debug)]
pub struct PendingRequest {
    id: u32,
    envelope: Envelope,
    seq: u64,
    origin: Origin,
}

impl PendingRequest {
    /// Heartbeats and init are restarted by the new connection; everything else is resent.
    /// A caller-sent `hb` counts as a heartbeat.
    fn survives_reconnect(&self) -> bool {
        matches!(self.origin, Origin::Caller(_) | Origin::LazyRead { .. })
            && split_type(&self.envelope.kind).0 != MessageKind::Heartbeat.as_str()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The original envelope, retransmitted verbatim on reconnect.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

/// Outstanding requests and envelopes waiting for the connection.
#[derive(Debug, Default)]
pub struct Correlation {
    ids: IdPool,
    pending: HashMap<u32, PendingRequest>,
    queue: VecDeque<Envelope>,
    next_seq: u64,
}

impl Correlation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an ID, build the request envelope, and record it as pending.
    /// Returns the envelope for the caller to transmit or enqueue.
    pub(crate) fn register(&mut self, kind: String, body: Value, sent: u64, origin: Origin) -> Envelope {
        let id = self.ids.allocate();
        let envelope = Envelope::new(kind, body, Some(id), sent);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            id,
            PendingRequest {
                id,
                envelope: envelope.clone(),
                seq,
                origin,
            },
        );
        envelope
    }

    pub fn enqueue(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    /// Take everything queued, in transmission order.
    pub fn drain_queue(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    /// Match a response to its request: release the ID, drop the record, fulfil a caller future.
    /// `None` for unknown IDs (duplicate response after a resend).
    pub(crate) fn resolve(&mut self, id: u32, response: Response) -> Option<Resolution> {
        let request = self.pending.remove(&id)?;
        self.ids.release(id);
        self.queue.retain(|e| e.id() != Some(id));
        Some(match request.origin {
            Origin::Caller(reply) => {
                let _ = reply.send(Ok(response));
                Resolution::Delivered
            }
            Origin::Heartbeat => Resolution::Heartbeat,
            Origin::Init => Resolution::Init(response),
            Origin::LazyRead { name, reply } => Resolution::LazyRead {
                name,
                reply,
                response,
            },
        })
    }

    /// Reconnect policy: discard heartbeat/init requests, then put every other pending request
    /// that is not already queued at the front of the queue in original send order.
    /// Returns how many requests will be retransmitted.
    pub fn prepare_resend(&mut self) -> usize {
        let discard: Vec<u32> = self
            .pending
            .values()
            .filter(|p| !p.survives_reconnect())
            .map(|p| p.id)
            .collect();
        for id in discard {
            if let Some(request) = self.pending.remove(&id) {
                self.ids.release(id);
                request.origin.reject(RequestError::Discarded);
            }
        }
        let pending = &self.pending;
        self.queue
            .retain(|e| e.id().map_or(true, |id| pending.contains_key(&id)));

        let queued: HashSet<u32> = self.queue.iter().filter_map(Envelope::id).collect();
        let mut resend: Vec<&PendingRequest> = self
            .pending
            .values()
            .filter(|p| !queued.contains(&p.id))
            .collect();
        resend.sort_by_key(|p| p.seq);
        let count = resend.len();
        let envelopes: Vec<Envelope> = resend.into_iter().map(|p| p.envelope.clone()).collect();
        for envelope in envelopes.into_iter().rev() {
            self.queue.push_front(envelope);
        }
        count
    }

    /// Teardown: reject every waiting caller, forget all requests and queued envelopes.
    pub fn reject_all(&mut self, err: RequestError) {
        for (id, request) in self.pending.drain() {
            self.ids.release(id);
            request.origin.reject(err.clone());
        }
        self.queue.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn caller() -> (Origin, PendingResponse) {
        let (tx, pending) = PendingResponse::channel();
        (Origin::Caller(tx), pending)
    }

    #[test]
    fn pool_prefers_freed_ids() {
        let mut pool = IdPool::new();
        assert_eq!(pool.allocate(), 0);
        assert_eq!(pool.allocate(), 1);
        assert_eq!(pool.allocate(), 2);
        assert!(pool.release(1));
        assert!(pool.release(0));
        assert_eq!(pool.allocate(), 0);
        assert_eq!(pool.allocate(), 1);
        assert_eq!(pool.allocate(), 3);
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn pool_refuses_bogus_release() {
        let mut pool = IdPool::new();
        assert!(!pool.release(0));
        let id = pool.allocate();
        assert!(pool.release(id));
        assert!(!pool.release(id));
    }

    #[test]
    fn resolve_fulfils_caller_once() {
        let mut c = Correlation::new();
        let (origin, mut pending) = caller();
        let env = c.register("post/sum".into(), json!({"a": 2}), 0, origin);
        let id = env.id().unwrap();
        assert!(pending.try_take().is_none());

        assert!(matches!(
            c.resolve(id, Response::ok(json!(5))),
            Some(Resolution::Delivered)
        ));
        assert_eq!(pending.try_take(), Some(Ok(Response::ok(json!(5)))));
        assert!(c.resolve(id, Response::ok(json!(5))).is_none());
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn rejected_response_is_immediate() {
        let mut pending = PendingResponse::rejected(RequestError::ConnectionDead);
        assert_eq!(pending.try_take(), Some(Err(RequestError::ConnectionDead)));
    }

    #[test]
    fn resend_discards_heartbeats_and_keeps_order() {
        let mut c = Correlation::new();
        let (o1, _p1) = caller();
        let (o2, _p2) = caller();
        let first = c.register("post/a".into(), json!(1), 0, o1);
        let hb = c.register("hb".into(), Value::Null, 0, Origin::Heartbeat);
        let second = c.register("post/b".into(), json!(2), 0, o2);

        assert_eq!(c.prepare_resend(), 2);
        assert!(!c.is_pending(hb.id().unwrap()));
        assert_eq!(c.drain_queue(), vec![first, second]);
    }

    #[test]
    fn caller_heartbeat_is_discarded_on_reconnect() {
        let mut c = Correlation::new();
        let (o1, mut hb_reply) = caller();
        let (o2, _p2) = caller();
        let hb = c.register("hb".into(), Value::Null, 0, o1);
        let post = c.register("post/a".into(), json!(1), 0, o2);

        assert_eq!(c.prepare_resend(), 1);
        assert!(!c.is_pending(hb.id().unwrap()));
        assert_eq!(hb_reply.try_take(), Some(Err(RequestError::Discarded)));
        assert_eq!(c.drain_queue(), vec![post]);
    }

    #[test]
    fn resend_goes_ahead_of_queued_and_skips_duplicates() {
        let mut c = Correlation::new();
        let (o1, _p1) = caller();
        let (o2, _p2) = caller();
        let in_flight = c.register("post/a".into(), json!(1), 0, o1);
        let queued = c.register("post/b".into(), json!(2), 0, o2);
        c.enqueue(queued.clone());

        assert_eq!(c.prepare_resend(), 1);
        assert_eq!(c.drain_queue(), vec![in_flight, queued]);
    }

    #[test]
    fn reject_all_closes_callers() {
        let mut c = Correlation::new();
        let (origin, mut pending) = caller();
        c.register("post/a".into(), Value::Null, 0, origin);
        c.reject_all(RequestError::Closed);
        assert_eq!(pending.try_take(), Some(Err(RequestError::Closed)));
        assert_eq!(c.pending_len(), 0);
        assert_eq!(c.queued_len(), 0);
    }

    proptest! {
        #[test]
        fn outstanding_ids_never_collide(ops in prop::collection::vec((any::<bool>(), any::<usize>()), 1..200)) {
            let mut c = Correlation::new();
            let mut outstanding: Vec<u32> = Vec::new();
            for (allocate, pick) in ops {
                if allocate || outstanding.is_empty() {
                    let env = c.register("hb".into(), Value::Null, 0, Origin::Heartbeat);
                    let id = env.id().unwrap();
                    prop_assert!(!outstanding.contains(&id));
                    outstanding.push(id);
                } else {
                    let id = outstanding.swap_remove(pick % outstanding.len());
                    prop_assert!(c.resolve(id, Response::ok(Value::Null)).is_some());
                }
                prop_assert_eq!(c.pending_len(), outstanding.len());
                prop_assert_eq!(c.ids.in_use(), outstanding.len());
            }
        }
    }
}
