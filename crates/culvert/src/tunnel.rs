//! A tunnel: one logical RPC channel over a set of symmetric links.
//!
//! The tunnel is the unit of call dispatch. Outbound messages are
//! load-balanced uniformly across its live links (no cross-link ordering),
//! inbound messages from every link funnel into one intake channel, and a
//! pending-call table correlates outgoing calls with the `Result`/`Error`
//! that eventually answers them.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{Notify, mpsc, oneshot};

use culvert_core::{CallId, MAX_CALL_ID, Message, NO_CALL_ID, RpcError, TransportError};

use crate::link::{Intake, Link};

/// Bound on a single wait inside [`Tunnel::listen`]. Keeps the receive loop
/// responsive to tunnel death even when the peer is silent.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Depth of the per-tunnel intake channel shared by all reader tasks.
const INTAKE_DEPTH: usize = 64;

type PendingSender = oneshot::Sender<Result<Bytes, RpcError>>;

pub struct Tunnel {
    links: Vec<Arc<Link>>,
    intake: tokio::sync::Mutex<mpsc::Receiver<Intake>>,
    /// In-flight outbound calls. Scan-and-insert happens under one lock
    /// acquisition, so a reserved id is visible to concurrent allocators
    /// the moment it exists.
    pending: Mutex<HashMap<CallId, PendingSender>>,
    /// Signalled whenever a pending entry is removed; allocators blocked on
    /// an exhausted id space wait here instead of polling.
    slot_freed: Notify,
    live: AtomicUsize,
}

impl Tunnel {
    /// Build a tunnel from already-established streams, one link per
    /// stream. Both negotiation sides construct tunnels this way.
    pub fn new<S>(streams: Vec<S>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(INTAKE_DEPTH);
        let links: Vec<Arc<Link>> = streams
            .into_iter()
            .enumerate()
            .map(|(index, stream)| Link::spawn(index, stream, tx.clone()))
            .collect();
        let live = links.len();
        Arc::new(Self {
            links,
            intake: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(HashMap::new()),
            slot_freed: Notify::new(),
            live: AtomicUsize::new(live),
        })
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// False once every link has retired. A dead tunnel fails all pending
    /// calls and refuses new sends.
    pub fn is_alive(&self) -> bool {
        self.live.load(Ordering::Acquire) > 0
    }

    /// Number of in-flight outbound calls (diagnostics).
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `msg` on one pseudo-randomly picked live link.
    ///
    /// Messages sent back to back may land on different links; only
    /// per-link order is preserved.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let live: Vec<&Arc<Link>> = self.links.iter().filter(|l| l.is_alive()).collect();
        if live.is_empty() {
            return Err(TransportError::Closed);
        }
        let pick = if live.len() == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..live.len())
        };
        live[pick].send(msg).await
    }

    /// Wait (bounded by [`LISTEN_TIMEOUT`]) for inbound traffic, route
    /// answers to their pending calls, and return everything unsolicited:
    /// `Call`s, `Ping`s, and `Result`/`Error`s that matched no pending
    /// entry. An empty return means the wait timed out or the tunnel died;
    /// check [`is_alive`](Self::is_alive).
    pub async fn listen(&self) -> Vec<Message> {
        let mut intake = self.intake.lock().await;
        let mut unsolicited = Vec::new();
        match tokio::time::timeout(LISTEN_TIMEOUT, intake.recv()).await {
            Err(_) => return unsolicited,
            Ok(None) => {
                // Every reader task is gone and the channel is drained.
                self.fail_all_pending();
                return unsolicited;
            }
            Ok(Some(item)) => self.route(item, &mut unsolicited),
        }
        // Drain whatever else is immediately available.
        while let Ok(item) = intake.try_recv() {
            self.route(item, &mut unsolicited);
        }
        unsolicited
    }

    fn route(&self, item: Intake, unsolicited: &mut Vec<Message>) {
        match item {
            Intake::Retired { link } => {
                let remaining = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
                tracing::warn!(link, remaining, "link retired");
                if remaining == 0 {
                    self.fail_all_pending();
                }
            }
            Intake::Message { link, msg } => match msg {
                Message::Result { fn_id, call_id, response } => {
                    match self.take_pending(CallId::new(call_id, fn_id)) {
                        Some(tx) => {
                            let _ = tx.send(Ok(response));
                        }
                        None => {
                            tracing::debug!(link, fn_id, call_id, "result matched no pending call");
                            unsolicited.push(Message::Result { fn_id, call_id, response });
                        }
                    }
                }
                Message::Error { fn_id, call_id, message } => {
                    match self.take_pending(CallId::new(call_id, fn_id)) {
                        Some(tx) => {
                            let text = String::from_utf8_lossy(&message).into_owned();
                            let _ = tx.send(Err(RpcError::Remote { message: text }));
                        }
                        None => {
                            tracing::debug!(link, fn_id, call_id, "error matched no pending call");
                            unsolicited.push(Message::Error { fn_id, call_id, message });
                        }
                    }
                }
                other => unsolicited.push(other),
            },
        }
    }

    fn take_pending(&self, key: CallId) -> Option<PendingSender> {
        let removed = self.pending.lock().remove(&key);
        if removed.is_some() {
            self.slot_freed.notify_one();
        }
        removed
    }

    fn fail_all_pending(&self) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            tracing::warn!(calls = drained.len(), "tunnel dead; failing pending calls");
        }
        for tx in drained {
            let _ = tx.send(Err(RpcError::Disconnected));
        }
        // Wake allocators so they observe the dead tunnel.
        self.slot_freed.notify_waiters();
        self.slot_freed.notify_one();
    }

    /// Dispatch an outbound call: allocate an identifier, reserve its
    /// pending entry, send the `Call`, and hand back the future. The
    /// call-site never waits for the answer here; resolution happens on
    /// whichever [`listen`](Self::listen) observes the reply.
    pub async fn call(self: &Arc<Self>, fn_id: u8, args: Bytes) -> Result<PendingCall, RpcError> {
        let (key, rx) = self.reserve(fn_id).await?;
        let msg = Message::Call { fn_id, call_id: key.call_id, args };
        if let Err(e) = self.send(&msg).await {
            self.abandon(key);
            return Err(e.into());
        }
        tracing::trace!(fn_id, call_id = key.call_id, "call dispatched");
        Ok(PendingCall { tunnel: self.clone(), key, rx, done: false })
    }

    /// Scan the id space for a free `(call_id, fn_id)` pair and insert the
    /// pending entry for it. With all 254 ids for this `fn_id` in flight,
    /// waits until a completion frees a slot.
    async fn reserve(
        &self,
        fn_id: u8,
    ) -> Result<(CallId, oneshot::Receiver<Result<Bytes, RpcError>>), RpcError> {
        loop {
            if !self.is_alive() {
                return Err(RpcError::Disconnected);
            }
            {
                let mut pending = self.pending.lock();
                for call_id in 0..=MAX_CALL_ID {
                    if call_id == NO_CALL_ID {
                        continue;
                    }
                    let key = CallId::new(call_id, fn_id);
                    if let Entry::Vacant(slot) = pending.entry(key) {
                        let (tx, rx) = oneshot::channel();
                        slot.insert(tx);
                        return Ok((key, rx));
                    }
                }
            }
            tracing::debug!(fn_id, "call ids exhausted; waiting for a completion");
            self.slot_freed.notified().await;
        }
    }

    /// Drop an unresolved call's pending entry so its id can be reused.
    fn abandon(&self, key: CallId) {
        if self.pending.lock().remove(&key).is_some() {
            tracing::debug!(fn_id = key.fn_id, call_id = key.call_id, "call abandoned");
            self.slot_freed.notify_one();
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("links", &self.links.len())
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("pending", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

/// The future side of an in-flight call.
///
/// Resolves to the remote response, the remote error text, or
/// [`RpcError::Disconnected`] if the tunnel dies first. Dropping it before
/// resolution abandons the call: the pending entry is removed and the id
/// becomes reusable; a late answer is then logged and dropped as unmatched.
pub struct PendingCall {
    tunnel: Arc<Tunnel>,
    key: CallId,
    rx: oneshot::Receiver<Result<Bytes, RpcError>>,
    done: bool,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.key
    }
}

impl Future for PendingCall {
    type Output = Result<Bytes, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.done = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                Poll::Ready(Err(RpcError::Disconnected))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Only abandon if the entry is still ours: once an answer has been
        // sent the entry is already gone and the id may belong to a newer
        // call, which a blind remove would corrupt.
        match self.rx.try_recv() {
            Ok(_) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => self.tunnel.abandon(self.key),
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Partition `streams` into tunnels of the declared sizes, in declaration
/// order. Both negotiation sides run this over the same counts and the same
/// socket order, which is what keeps their tunnel topologies mirrored.
pub(crate) fn partition_into_tunnels<S>(streams: Vec<S>, socket_counts: &[u8]) -> Vec<Arc<Tunnel>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug_assert_eq!(
        streams.len(),
        socket_counts.iter().map(|c| *c as usize).sum::<usize>(),
    );
    let mut tunnels = Vec::with_capacity(socket_counts.len());
    let mut rest = streams;
    for count in socket_counts {
        let tail = rest.split_off(*count as usize);
        tunnels.push(Tunnel::new(rest));
        rest = tail;
    }
    tunnels
}
