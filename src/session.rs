use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::{AuthParams, AuthReply, Descriptor, Message, RegisterParams, Role};
use crate::rpc::{Disconnect, MethodTable, Outbox, Peer, RpcError};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What to do after the transport drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry forever, waiting this long between attempts.
    Fixed(Duration),
    /// Give up and close the session.
    Never,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hub control address, `host:port`.
    pub address: String,
    pub secret: String,
    pub role: Role,
    /// Identity to propose at `auth`. Replaced by the granted identity after
    /// the first successful handshake so reconnects keep it.
    pub identity: Option<String>,
    pub hostname: Option<String>,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    /// Host part of `address`, used to reach the hub's other ports.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Connecting => f.write_str("connecting"),
            Liveness::Connected => f.write_str("connected"),
            Liveness::Reconnecting => f.write_str("reconnecting"),
            Liveness::Closed => f.write_str("closed"),
        }
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Up(Descriptor),
    Down,
    Reconnecting,
    Denied(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("access denied: {0}")]
    Denied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake failed: {0}")]
    Handshake(RpcError),

    #[error("session closed")]
    Closed,
}

struct Shared {
    liveness: watch::Sender<Liveness>,
    events: broadcast::Sender<SessionEvent>,
    descriptor: watch::Sender<Option<Descriptor>>,
    failure: Mutex<Option<SessionError>>,
}

impl Shared {
    fn set(&self, liveness: Liveness, event: SessionEvent) {
        let _ = self.liveness.send(liveness);
        let _ = self.events.send(event);
    }
}

/// An authenticated connection to the hub that survives transport drops.
///
/// The connection task runs in the background from [`Session::connect`]
/// until the session is denied, closed, or (with [`ReconnectPolicy::Never`])
/// the transport drops. Calls made through [`Session::peer`] before the
/// session is up wait in the outbox.
pub struct Session {
    peer: Peer,
    shared: Arc<Shared>,
    liveness: watch::Receiver<Liveness>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Session {
    /// Start connecting. Returns immediately; use [`Session::wait_up`] to
    /// wait for the handshake.
    pub fn connect(config: SessionConfig, methods: MethodTable) -> Self {
        Self::connect_with(config, methods, watch::channel(None).0)
    }

    /// Like [`Session::connect`], publishing each handshake's descriptor on
    /// `descriptor`. The value is updated before any call from the remote
    /// side is served, so method handlers may read it.
    pub fn connect_with(
        config: SessionConfig,
        methods: MethodTable,
        descriptor: watch::Sender<Option<Descriptor>>,
    ) -> Self {
        let (peer, outbox) = Peer::new(methods);
        let (liveness_tx, liveness) = watch::channel(Liveness::Connecting);
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            liveness: liveness_tx,
            events,
            descriptor,
            failure: Mutex::new(None),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(connection_loop(
            config,
            peer.clone(),
            outbox,
            shared.clone(),
            cancel.clone(),
        ));
        Self {
            peer,
            shared,
            liveness,
            cancel,
            task: Some(task),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    /// Descriptor from the most recent successful handshake.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.shared.descriptor.borrow().clone()
    }

    /// Subscribe to lifecycle events. Only events after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the session is up, or fail if it closed first.
    pub async fn wait_up(&self) -> Result<Descriptor, SessionError> {
        let mut liveness = self.liveness.clone();
        loop {
            let current = *liveness.borrow_and_update();
            match current {
                Liveness::Connected => {
                    if let Some(descriptor) = self.descriptor() {
                        return Ok(descriptor);
                    }
                }
                Liveness::Closed => return Err(self.failure()),
                Liveness::Connecting | Liveness::Reconnecting => {}
            }
            if liveness.changed().await.is_err() {
                return Err(self.failure());
            }
        }
    }

    /// Why the session closed, if it has.
    pub fn failure(&self) -> SessionError {
        self.shared.failure.lock().clone().unwrap_or(SessionError::Closed)
    }

    pub async fn call<P: Serialize, T: DeserializeOwned>(&self, method: &str, params: P) -> Result<T, RpcError> {
        self.peer.call_as(method, params).await
    }

    /// Tear the session down and wait for the connection task to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.peer.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Resolves once the session has closed for any reason.
    pub async fn closed(&self) {
        let mut liveness = self.liveness.clone();
        while *liveness.borrow_and_update() != Liveness::Closed {
            if liveness.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.peer.close();
    }
}

async fn connection_loop(
    mut config: SessionConfig,
    peer: Peer,
    mut outbox: Outbox,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let url = format!("ws://{}/", config.address);
    let mut attempt: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if attempt > 0 {
            shared.set(Liveness::Reconnecting, SessionEvent::Reconnecting);
            tracing::debug!(hub = %config.address, attempt, "reconnecting");
        }
        attempt += 1;

        let attempt_result = tokio::select! {
            result = open(&url, &config, &peer) => result,
            _ = cancel.cancelled() => break,
        };

        match attempt_result {
            Ok((ws, descriptor, backlog)) => {
                if config.identity.is_none() {
                    config.identity = Some(descriptor.identity.clone());
                }
                shared.descriptor.send_replace(Some(descriptor.clone()));
                tracing::info!(
                    hub = %config.address,
                    identity = %descriptor.identity,
                    role = %config.role,
                    "session up"
                );
                shared.set(Liveness::Connected, SessionEvent::Up(descriptor));

                if peer.drive(ws, &mut outbox, backlog).await == Disconnect::Closed {
                    break;
                }
                peer.connection_lost(&mut outbox);
                tracing::warn!(hub = %config.address, "session down");
                let _ = shared.events.send(SessionEvent::Down);
                *shared.failure.lock() = Some(SessionError::Transport("connection lost".into()));
            }
            Err(SessionError::Denied(reason)) => {
                tracing::warn!(hub = %config.address, %reason, "authentication denied");
                let _ = shared.events.send(SessionEvent::Denied(reason.clone()));
                *shared.failure.lock() = Some(SessionError::Denied(reason));
                break;
            }
            Err(e) => {
                tracing::debug!(hub = %config.address, error = %e, "connection attempt failed");
                *shared.failure.lock() = Some(e);
            }
        }

        match config.reconnect {
            ReconnectPolicy::Never => break,
            ReconnectPolicy::Fixed(interval) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    peer.close();
    shared.set(Liveness::Closed, SessionEvent::Closed);
}

/// Connect and run the handshake: `auth`, then `register` for drones.
async fn open(
    url: &str,
    config: &SessionConfig,
    peer: &Peer,
) -> Result<(WsStream, Descriptor, Vec<Message>), SessionError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    let mut backlog = Vec::new();

    let auth = AuthParams {
        secret: config.secret.clone(),
        role: config.role,
        identity: config.identity.clone(),
    };
    let reply: AuthReply = exchange(&mut ws, peer, "auth", auth, &mut backlog).await?;
    let descriptor = match reply {
        AuthReply::Granted(descriptor) => descriptor,
        AuthReply::Denied { reason } => return Err(SessionError::Denied(reason)),
    };

    if config.role == Role::Drone {
        let register = RegisterParams {
            role: config.role,
            capabilities: peer.method_names(),
            hostname: config.hostname.clone(),
        };
        let _: serde_json::Value = exchange(&mut ws, peer, "register", register, &mut backlog).await?;
    }

    Ok((ws, descriptor, backlog))
}

/// One request/response over the raw socket, before the peer drives it.
/// Frames that are not the awaited response are kept in `backlog`.
async fn exchange<P: Serialize, T: DeserializeOwned>(
    ws: &mut WsStream,
    peer: &Peer,
    method: &str,
    params: P,
    backlog: &mut Vec<Message>,
) -> Result<T, SessionError> {
    let id = peer.allocate_id();
    let request = Message::Request {
        id,
        method: method.to_string(),
        params: serde_json::to_value(params).map_err(|e| SessionError::Handshake(RpcError::Internal(e.to_string())))?,
    };
    let text = serde_json::to_string(&request).map_err(|e| SessionError::Handshake(RpcError::Internal(e.to_string())))?;
    ws.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;

    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let msg: Message = match serde_json::from_str(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed frame");
                        continue;
                    }
                };
                match msg {
                    Message::Response {
                        id: reply_id,
                        result,
                        error,
                    } if reply_id == id => {
                        if let Some(err) = error {
                            return Err(SessionError::Handshake(RpcError::from_wire(err)));
                        }
                        let result = result.unwrap_or(serde_json::Value::Null);
                        return serde_json::from_value(result).map_err(|e| {
                            SessionError::Handshake(RpcError::Internal(format!("bad {} result: {}", method, e)))
                        });
                    }
                    other => backlog.push(other),
                }
            }
            Some(Ok(WsMessage::Ping(data))) => {
                ws.send(WsMessage::Pong(data))
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))?;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(SessionError::Transport("closed during handshake".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(SessionError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Ports;
    use tokio::time::timeout;

    /// A scripted hub: grants anyone presenting `secret`, acks `register`,
    /// then echoes `echo` calls. Drops the first connection after the
    /// handshake when `drop_first` is set.
    async fn spawn_fake_hub(secret: &'static str, drop_first: bool) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut connection = 0;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                connection += 1;
                let drop_now = drop_first && connection == 1;
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                        let Ok(Message::Request { id, method, params }) = serde_json::from_str::<Message>(text.as_str()) else {
                            continue;
                        };
                        let result = match method.as_str() {
                            "auth" => {
                                let auth: AuthParams = serde_json::from_value(params).unwrap();
                                let reply = if auth.secret == secret {
                                    AuthReply::Granted(Descriptor {
                                        identity: auth.identity.unwrap_or_else(|| "assigned".into()),
                                        ports: Ports { control: 1, git: 2 },
                                        hostname: None,
                                    })
                                } else {
                                    AuthReply::Denied {
                                        reason: "ACCESS DENIED".into(),
                                    }
                                };
                                serde_json::to_value(reply).unwrap()
                            }
                            _ => params,
                        };
                        let response = Message::Response {
                            id,
                            result: Some(result),
                            error: None,
                        };
                        ws.send(WsMessage::Text(serde_json::to_string(&response).unwrap().into()))
                            .await
                            .unwrap();
                        if drop_now && method == "register" {
                            return;
                        }
                    }
                });
            }
        });
        addr.to_string()
    }

    fn config(address: String, secret: &str, role: Role, reconnect: ReconnectPolicy) -> SessionConfig {
        SessionConfig {
            address,
            secret: secret.to_string(),
            role,
            identity: None,
            hostname: None,
            reconnect,
        }
    }

    #[tokio::test]
    async fn handshake_yields_descriptor() {
        let address = spawn_fake_hub("s3cret", false).await;
        let session = Session::connect(
            config(address, "s3cret", Role::Client, ReconnectPolicy::Never),
            MethodTable::new(),
        );
        let descriptor = timeout(Duration::from_secs(5), session.wait_up()).await.unwrap().unwrap();
        assert_eq!(descriptor.identity, "assigned");
        assert_eq!(descriptor.ports.git, 2);
        assert_eq!(session.liveness(), Liveness::Connected);
    }

    #[tokio::test]
    async fn wrong_secret_is_denied_without_retry() {
        let address = spawn_fake_hub("s3cret", false).await;
        let session = Session::connect(
            config(address, "nope", Role::Drone, ReconnectPolicy::Fixed(Duration::from_millis(10))),
            MethodTable::new(),
        );
        let err = timeout(Duration::from_secs(5), session.wait_up()).await.unwrap().unwrap_err();
        assert_eq!(err, SessionError::Denied("ACCESS DENIED".into()));
        timeout(Duration::from_secs(5), session.closed()).await.unwrap();
        assert_eq!(session.liveness(), Liveness::Closed);
    }

    #[tokio::test]
    async fn unreachable_hub_without_reconnect_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let session = Session::connect(
            config(address, "s", Role::Client, ReconnectPolicy::Never),
            MethodTable::new(),
        );
        let err = timeout(Duration::from_secs(5), session.wait_up()).await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn drone_reconnects_after_drop_and_keeps_identity() {
        let address = spawn_fake_hub("s3cret", true).await;
        let mut cfg = config(address, "s3cret", Role::Drone, ReconnectPolicy::Fixed(Duration::from_millis(20)));
        cfg.identity = Some("d1".into());
        let session = Session::connect(cfg, MethodTable::new());
        let mut events = session.subscribe();
        timeout(Duration::from_secs(5), session.wait_up()).await.unwrap().unwrap();

        let mut saw_down = false;
        let mut saw_reconnecting = false;
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
                SessionEvent::Down => saw_down = true,
                SessionEvent::Reconnecting => saw_reconnecting = true,
                SessionEvent::Up(descriptor) if saw_down => {
                    assert_eq!(descriptor.identity, "d1");
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_reconnecting);

        // The new connection serves calls.
        let echoed: String = timeout(Duration::from_secs(5), session.call("echo", "hi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, "hi");
    }

    #[tokio::test]
    async fn calls_made_before_up_are_delivered() {
        let address = spawn_fake_hub("s3cret", false).await;
        let session = Session::connect(
            config(address, "s3cret", Role::Client, ReconnectPolicy::Never),
            MethodTable::new(),
        );
        // Issued immediately, while the session is still connecting.
        let echoed: u32 = timeout(Duration::from_secs(5), session.call("echo", 42))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, 42);
    }

    #[test]
    fn host_strips_port() {
        let cfg = config("hub.local:7000".into(), "s", Role::Drone, ReconnectPolicy::Never);
        assert_eq!(cfg.host(), "hub.local");
    }
}
