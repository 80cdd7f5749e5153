use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;
use crate::rpc::peer::PeerInner;
use crate::rpc::{Peer, RpcError};
#[cfg(test)]
use crate::rpc::Outbox;

type Handler = Arc<dyn Fn(Call) -> BoxFuture<'static, Result<serde_json::Value, RpcError>> + Send + Sync>;

/// Named methods one side of a session exposes to the other.
///
/// The peer looks incoming requests up by name; an unknown name is answered
/// with [`RpcError::MethodNotFound`].
#[derive(Clone, Default)]
pub struct MethodTable {
    handlers: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |call| handler(call).boxed());
        self.handlers.insert(name.to_string(), handler);
    }

    /// Method names, sorted. Sent to the hub as the capability set.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub(crate) fn invoke(
        &self,
        method: &str,
        call: Call,
    ) -> BoxFuture<'static, Result<serde_json::Value, RpcError>> {
        match self.handlers.get(method) {
            Some(handler) => handler(call),
            None => {
                let method = method.to_string();
                async move { Err(RpcError::MethodNotFound(method)) }.boxed()
            }
        }
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

/// One incoming request as seen by a handler.
pub struct Call {
    pub params: serde_json::Value,
    pub sink: EventSink,
    /// The session the request arrived on.
    pub peer: Peer,
}

impl Call {
    /// Deserialize the params, mapping failures to `invalid_params`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let params = if self.params.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.params.clone()
        };
        serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
    }

    /// A call on an unconnected peer, for driving handlers directly in tests.
    #[cfg(test)]
    pub(crate) fn detached(params: serde_json::Value) -> (Self, Outbox) {
        let (peer, outbox) = Peer::new(MethodTable::new());
        let sink = EventSink::new(0, peer.inner(), CancellationToken::new());
        (Call { params, sink, peer }, outbox)
    }
}

/// Streams `event` frames back to the caller of one request.
#[derive(Clone)]
pub struct EventSink {
    id: u64,
    peer: Arc<PeerInner>,
    cancelled: CancellationToken,
}

impl EventSink {
    pub(crate) fn new(id: u64, peer: Arc<PeerInner>, cancelled: CancellationToken) -> Self {
        Self { id, peer, cancelled }
    }

    /// Send one event to the caller.
    pub fn emit<T: Serialize>(&self, event: &T) -> Result<(), RpcError> {
        if self.cancelled.is_cancelled() {
            return Err(RpcError::Closed);
        }
        let data = serde_json::to_value(event).map_err(|e| RpcError::Internal(e.to_string()))?;
        self.peer
            .send_for_inbound(&self.cancelled, Message::Event { id: self.id, data })
    }

    /// Resolves when the caller cancelled the request or went away.
    pub async fn closed(&self) {
        self.cancelled.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Cancel the request from the handler side.
    pub fn cancel(&self) {
        self.cancelled.cancel()
    }
}
