use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::hub::dispatch::HubService;
use crate::hub::registry::{DroneEntry, DroneRegistry};
use crate::hub::remote::RemoteDrone;
use crate::protocol::{
    AuthParams, AuthReply, DeployRequest, Descriptor, DroneScrollbackRequest, GcRequest, Ports, ProcessTarget,
    RegisterParams, Role, SpawnRequest,
};
use crate::rpc::{Call, EventSink, MethodTable, Peer, RpcError};

/// Reason sent with every rejected `auth`.
pub const ACCESS_DENIED: &str = "ACCESS DENIED";

/// Longest identity a session may propose.
const MAX_IDENTITY_LEN: usize = 64;

/// Hub-wide state shared by every control connection.
pub struct ControlState {
    pub registry: DroneRegistry,
    pub service: Arc<dyn HubService>,
    pub secret: String,
    pub ports: Ports,
    pub hostname: Option<String>,
    next_session: AtomicU64,
}

impl ControlState {
    pub fn new(
        registry: DroneRegistry,
        service: Arc<dyn HubService>,
        secret: String,
        ports: Ports,
        hostname: Option<String>,
    ) -> Self {
        Self {
            registry,
            service,
            secret,
            ports,
            hostname,
            next_session: AtomicU64::new(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Authed {
    identity: String,
    role: Role,
}

/// Per-connection state.
struct Connection {
    session: u64,
    authed: Mutex<Option<Authed>>,
    /// Identity this connection registered as a drone, if any.
    registered: Mutex<Option<String>>,
    /// Fires when the server stops or another session takes over the identity.
    cancel: CancellationToken,
}

impl Connection {
    fn require_auth(&self) -> Result<Authed, RpcError> {
        self.authed.lock().clone().ok_or(RpcError::Unauthorized)
    }
}

/// Accept control connections until `cancel` fires.
pub async fn serve(listener: TcpListener, state: Arc<ControlState>, cancel: CancellationToken) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("control server received cancel signal, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = state.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tracing::debug!(%addr, "control connection accepted");
                            handle_connection(stream, state, cancel).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept control connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(stream: TcpStream, state: Arc<ControlState>, cancel: CancellationToken) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(error = %e, "websocket handshake failed");
            return;
        }
    };

    let conn = Arc::new(Connection {
        session: state.next_session.fetch_add(1, Ordering::Relaxed),
        authed: Mutex::new(None),
        registered: Mutex::new(None),
        cancel,
    });
    let (peer, mut outbox) = Peer::new(hub_methods(state.clone(), conn.clone()));

    tokio::select! {
        _ = peer.drive(ws, &mut outbox, Vec::new()) => {}
        _ = conn.cancel.cancelled() => {}
    }
    peer.close();

    let registered = conn.registered.lock().take();
    if let Some(identity) = registered {
        state.registry.remove(&identity, conn.session);
    }
    let authed = conn.authed.lock().take();
    if let Some(authed) = authed {
        tracing::info!(identity = %authed.identity, role = %authed.role, session = conn.session, "session closed");
    }
}

/// Register an authenticated method whose result is serialized as the reply.
fn register_authed<F, Fut, T>(table: &mut MethodTable, conn: &Arc<Connection>, name: &str, handler: F)
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
    T: Serialize,
{
    let conn = conn.clone();
    table.register(name, move |call| {
        let pending = conn.require_auth().map(|_| handler(call));
        async move {
            let result = pending?.await?;
            serde_json::to_value(result).map_err(|e| RpcError::Internal(e.to_string()))
        }
    });
}

fn hub_methods(state: Arc<ControlState>, conn: Arc<Connection>) -> MethodTable {
    let mut table = MethodTable::new();

    {
        let state = state.clone();
        let conn = conn.clone();
        table.register("auth", move |call| {
            let state = state.clone();
            let conn = conn.clone();
            async move {
                let params: AuthParams = call.parse()?;
                let reply = authenticate(&state, &conn, params);
                serde_json::to_value(reply).map_err(|e| RpcError::Internal(e.to_string()))
            }
        });
    }

    {
        let state = state.clone();
        let conn = conn.clone();
        table.register("register", move |call| {
            let state = state.clone();
            let conn = conn.clone();
            async move {
                let authed = conn.require_auth()?;
                let params: RegisterParams = call.parse()?;
                if params.role != authed.role {
                    return Err(RpcError::InvalidParams(format!(
                        "registering as {} on a {} session",
                        params.role, authed.role
                    )));
                }
                if authed.role == Role::Drone {
                    state.registry.register(DroneEntry {
                        identity: authed.identity.clone(),
                        session: conn.session,
                        hostname: params.hostname,
                        capabilities: params.capabilities,
                        handle: Arc::new(RemoteDrone::new(call.peer.clone())),
                        disconnect: conn.cancel.clone(),
                    });
                    *conn.registered.lock() = Some(authed.identity);
                }
                Ok(serde_json::json!({ "ok": true }))
            }
        });
    }

    let service = state.service.clone();

    {
        let service = service.clone();
        register_authed(&mut table, &conn, "deploy", move |call| {
            let service = service.clone();
            async move {
                let request: DeployRequest = call.parse()?;
                tracing::info!(repo = %request.repo, commit = %request.commit, "deploy requested");
                Ok(service.deploy(request).await)
            }
        });
    }

    {
        let service = service.clone();
        register_authed(&mut table, &conn, "spawn", move |call| {
            let service = service.clone();
            async move {
                let request: SpawnRequest = call.parse()?;
                tracing::info!(repo = %request.repo, commit = %request.commit, "spawn requested");
                let forwarded = forward(service.spawn(request), &call.sink).await;
                Ok(serde_json::json!({ "events": forwarded }))
            }
        });
    }

    {
        let service = service.clone();
        register_authed(&mut table, &conn, "ps", move |call| {
            let service = service.clone();
            async move {
                let forwarded = forward(service.ps(), &call.sink).await;
                Ok(serde_json::json!({ "drones": forwarded }))
            }
        });
    }

    {
        let service = service.clone();
        register_authed(&mut table, &conn, "drones", move |_call| {
            let service = service.clone();
            async move { Ok(service.drones()) }
        });
    }

    {
        let service = service.clone();
        register_authed(&mut table, &conn, "stop", move |call| {
            let service = service.clone();
            async move {
                let target: ProcessTarget = call.parse()?;
                service.stop(target).await
            }
        });
    }

    {
        let service = service.clone();
        register_authed(&mut table, &conn, "restart", move |call| {
            let service = service.clone();
            async move {
                let target: ProcessTarget = call.parse()?;
                service.restart(target).await
            }
        });
    }

    {
        let service = service.clone();
        register_authed(&mut table, &conn, "scrollback", move |call| {
            let service = service.clone();
            async move {
                let request: DroneScrollbackRequest = call.parse()?;
                service.scrollback(request).await
            }
        });
    }

    register_authed(&mut table, &conn, "gc", move |call| {
        let service = service.clone();
        async move {
            let request: GcRequest = call.parse()?;
            service.gc(request).await
        }
    });

    table
}

fn authenticate(state: &ControlState, conn: &Connection, params: AuthParams) -> AuthReply {
    let granted: bool = params.secret.as_bytes().ct_eq(state.secret.as_bytes()).into();
    if !granted {
        tracing::warn!(role = %params.role, session = conn.session, "authentication denied");
        return AuthReply::Denied {
            reason: ACCESS_DENIED.to_string(),
        };
    }

    let identity = match params.identity {
        Some(proposed) if acceptable_identity(&proposed) => proposed,
        Some(proposed) => {
            tracing::debug!(proposed = %proposed, "ignoring unusable identity");
            crate::random_token()
        }
        None => crate::random_token(),
    };
    tracing::info!(identity = %identity, role = %params.role, session = conn.session, "session authenticated");
    *conn.authed.lock() = Some(Authed {
        identity: identity.clone(),
        role: params.role,
    });

    AuthReply::Granted(Descriptor {
        identity,
        ports: state.ports,
        hostname: state.hostname.clone(),
    })
}

fn acceptable_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity.len() <= MAX_IDENTITY_LEN
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Emit every item of `stream` to the caller until it ends or the caller
/// goes away. Returns how many items were forwarded. Dropping the stream
/// cancels whatever feeds it.
async fn forward<T: Serialize>(mut stream: futures::stream::BoxStream<'static, T>, sink: &EventSink) -> usize {
    let mut forwarded = 0;
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(item) => {
                    if sink.emit(&item).is_err() {
                        break;
                    }
                    forwarded += 1;
                }
                None => break,
            },
            _ = sink.closed() => {
                tracing::debug!("caller went away, dropping stream");
                break;
            }
        }
    }
    forwarded
}
