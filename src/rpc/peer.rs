use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;
use crate::rpc::{Call, EventSink, MethodTable, RpcError};

/// Keep-alive ping period on an idle connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

type Reply = Result<serde_json::Value, RpcError>;

struct Pending {
    events: Option<mpsc::UnboundedSender<serde_json::Value>>,
    reply: oneshot::Sender<Reply>,
}

struct Inbound {
    serial: u64,
    token: CancellationToken,
}

pub(crate) struct PeerInner {
    methods: MethodTable,
    next_id: AtomicU64,
    next_serial: AtomicU64,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, Pending>>,
    inbound: Mutex<HashMap<u64, Inbound>>,
    closed: CancellationToken,
}

impl PeerInner {
    /// Queue a frame produced by an inbound request's handler.
    ///
    /// Holding the inbound lock while checking the token means nothing from a
    /// handler of a dead connection can be queued after `connection_lost`.
    pub(crate) fn send_for_inbound(&self, token: &CancellationToken, msg: Message) -> Result<(), RpcError> {
        let _inbound = self.inbound.lock();
        if token.is_cancelled() {
            return Err(RpcError::Closed);
        }
        self.outgoing.send(msg).map_err(|_| RpcError::Closed)
    }
}

/// Why [`Peer::drive`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The transport dropped; a reconnect may follow.
    Lost,
    /// The peer was closed locally.
    Closed,
}

/// Outgoing frame queue. Survives reconnects so calls made while the
/// transport is down are delivered once it comes back.
pub struct Outbox {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Outbox {
    /// Drop every queued frame.
    fn clear(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// One end of an RPC session: issues calls to the remote side and serves
/// the remote side's calls from a [`MethodTable`].
///
/// Cheap to clone; all clones share the same pending-call table.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("pending", &self.inner.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub fn new(methods: MethodTable) -> (Self, Outbox) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let peer = Self {
            inner: Arc::new(PeerInner {
                methods,
                next_id: AtomicU64::new(1),
                next_serial: AtomicU64::new(1),
                outgoing,
                pending: Mutex::new(HashMap::new()),
                inbound: Mutex::new(HashMap::new()),
                closed: CancellationToken::new(),
            }),
        };
        (peer, Outbox { rx })
    }

    /// Capability names this side exposes.
    pub fn method_names(&self) -> Vec<String> {
        self.inner.methods.names()
    }

    /// True if both handles belong to the same session.
    pub fn same_session(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the peer has been closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> Arc<PeerInner> {
        self.inner.clone()
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Invoke `method` on the remote side and wait for its result.
    pub async fn call<P: Serialize>(&self, method: &str, params: P) -> Result<serde_json::Value, RpcError> {
        let params = serde_json::to_value(params).map_err(|e| RpcError::Internal(e.to_string()))?;
        let (_id, reply) = self.start_call(method, params, None)?;
        reply.await.unwrap_or(Err(RpcError::ConnectionLost))
    }

    /// Like [`Peer::call`] but deserializes the result.
    pub async fn call_as<P: Serialize, T: DeserializeOwned>(&self, method: &str, params: P) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Internal(format!("bad {} result: {}", method, e)))
    }

    /// Invoke a streaming method. The returned stream yields each event and
    /// ends when the remote side responds; an error response is yielded as
    /// the last item. Dropping the stream early cancels the call remotely.
    pub fn call_stream<P: Serialize>(&self, method: &str, params: P) -> CallStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let started = serde_json::to_value(params)
            .map_err(|e| RpcError::Internal(e.to_string()))
            .and_then(|params| self.start_call(method, params, Some(events_tx)));
        match started {
            Ok((id, reply)) => CallStream {
                id,
                peer: self.clone(),
                events: events_rx,
                reply: Some(reply),
                done: false,
            },
            Err(e) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(e));
                CallStream {
                    id: 0,
                    peer: self.clone(),
                    events: events_rx,
                    reply: Some(rx),
                    done: false,
                }
            }
        }
    }

    fn start_call(
        &self,
        method: &str,
        params: serde_json::Value,
        events: Option<mpsc::UnboundedSender<serde_json::Value>>,
    ) -> Result<(u64, oneshot::Receiver<Reply>), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, Pending { events, reply: tx });
        // close() may have drained the table between the check and the insert.
        if self.is_closed() {
            self.inner.pending.lock().remove(&id);
            return Err(RpcError::Closed);
        }
        let request = Message::Request {
            id,
            method: method.to_string(),
            params,
        };
        if self.inner.outgoing.send(request).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(RpcError::Closed);
        }
        Ok((id, rx))
    }

    fn cancel_call(&self, id: u64) {
        if self.inner.pending.lock().remove(&id).is_some() && !self.is_closed() {
            let _ = self.inner.outgoing.send(Message::Cancel { id });
        }
    }

    fn fail_pending(&self, err: RpcError) {
        let drained: Vec<Pending> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }

    fn cancel_inbound(&self) {
        let mut inbound = self.inner.inbound.lock();
        for (_, entry) in inbound.drain() {
            entry.token.cancel();
        }
    }

    /// Forget everything tied to the connection that just dropped: calls in
    /// flight fail with `ConnectionLost`, handlers serving the remote side are
    /// cancelled, and frames queued for the dead connection are discarded.
    pub fn connection_lost(&self, outbox: &mut Outbox) {
        self.cancel_inbound();
        self.fail_pending(RpcError::ConnectionLost);
        outbox.clear();
    }

    /// Tear the peer down for good. Every pending and future call fails with
    /// `Closed` and [`Peer::drive`] returns.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.cancel_inbound();
        self.fail_pending(RpcError::Closed);
    }

    /// Route one incoming frame.
    pub(crate) fn dispatch(&self, msg: Message) {
        match msg {
            Message::Request { id, method, params } => self.serve(id, method, params),
            Message::Event { id, data } => {
                let pending = self.inner.pending.lock();
                match pending.get(&id).and_then(|p| p.events.as_ref()) {
                    Some(events) => {
                        let _ = events.send(data);
                    }
                    None => tracing::debug!(id, "event for unknown call"),
                }
            }
            Message::Response { id, result, error } => {
                let entry = self.inner.pending.lock().remove(&id);
                match entry {
                    Some(pending) => {
                        let reply = match error {
                            Some(err) => Err(RpcError::from_wire(err)),
                            None => Ok(result.unwrap_or(serde_json::Value::Null)),
                        };
                        // Dropping `pending.events` first ends the caller's event stream.
                        drop(pending.events);
                        let _ = pending.reply.send(reply);
                    }
                    None => tracing::debug!(id, "response for unknown call"),
                }
            }
            Message::Cancel { id } => {
                if let Some(entry) = self.inner.inbound.lock().get(&id) {
                    entry.token.cancel();
                }
            }
        }
    }

    fn serve(&self, id: u64, method: String, params: serde_json::Value) {
        let token = CancellationToken::new();
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        self.inner.inbound.lock().insert(
            id,
            Inbound {
                serial,
                token: token.clone(),
            },
        );
        let sink = EventSink::new(id, self.inner.clone(), token.clone());
        let call = Call {
            params,
            sink,
            peer: self.clone(),
        };
        let fut = self.inner.methods.invoke(&method, call);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let response = match fut.await {
                Ok(result) => Message::Response {
                    id,
                    result: Some(result),
                    error: None,
                },
                Err(err) => {
                    tracing::debug!(%method, error = %err, "call failed");
                    Message::Response {
                        id,
                        result: None,
                        error: Some(err.to_wire()),
                    }
                }
            };
            let _ = inner.send_for_inbound(&token, response);
            let mut inbound = inner.inbound.lock();
            if inbound.get(&id).map(|e| e.serial) == Some(serial) {
                inbound.remove(&id);
            }
        });
    }

    /// Pump frames between `ws` and this peer until the transport drops or
    /// the peer is closed. `backlog` holds frames already read off the socket
    /// (e.g. during a handshake) that still need routing.
    pub async fn drive<S>(&self, ws: WebSocketStream<S>, outbox: &mut Outbox, backlog: Vec<Message>) -> Disconnect
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        for msg in backlog {
            self.dispatch(msg);
        }

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // Skip the first immediate tick.

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<Message>(text.as_str()) {
                                Ok(msg) => self.dispatch(msg),
                                Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if sink.send(WsMessage::Pong(data)).await.is_err() {
                                return Disconnect::Lost;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Disconnect::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "transport error");
                            return Disconnect::Lost;
                        }
                    }
                }
                next = outbox.rx.recv() => {
                    let Some(msg) = next else {
                        return Disconnect::Closed;
                    };
                    // A request whose caller already gave up is not worth sending.
                    if let Message::Request { id, .. } = &msg {
                        if !self.inner.pending.lock().contains_key(id) {
                            continue;
                        }
                    }
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        return Disconnect::Lost;
                    }
                }
                _ = ping_interval.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        return Disconnect::Lost;
                    }
                }
                _ = self.inner.closed.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Disconnect::Closed;
                }
            }
        }
    }
}

/// Events of a streaming call; see [`Peer::call_stream`].
pub struct CallStream {
    id: u64,
    peer: Peer,
    events: mpsc::UnboundedReceiver<serde_json::Value>,
    reply: Option<oneshot::Receiver<Reply>>,
    done: bool,
}

impl CallStream {
    /// Next event deserialized as `T`.
    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Option<Result<T, RpcError>> {
        let item = self.next().await?;
        Some(item.and_then(|value| {
            serde_json::from_value(value).map_err(|e| RpcError::Internal(format!("bad event: {}", e)))
        }))
    }
}

impl Stream for CallStream {
    type Item = Result<serde_json::Value, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Ready(Some(value)) => return Poll::Ready(Some(Ok(value))),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }
        let Some(reply) = this.reply.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };
        match Pin::new(reply).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                this.reply = None;
                match result {
                    Ok(Ok(_)) => Poll::Ready(None),
                    Ok(Err(e)) => Poll::Ready(Some(Err(e))),
                    Err(_) => Poll::Ready(Some(Err(RpcError::ConnectionLost))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if !self.done {
            self.peer.cancel_call(self.id);
        }
    }
}
