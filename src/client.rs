//! Operator client: an authenticated, non-reconnecting session to the hub
//! with typed wrappers for each hub method.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::protocol::{
    DeployReport, DeployRequest, DroneInfo, DroneScrollbackRequest, FleetEvent, GcRecord, GcRequest, ProcessInfo,
    ProcessTarget, PsRecord, Role, ScrollbackParams, ScrollbackSlice, SpawnRequest,
};
use crate::rpc::{CallStream, MethodTable, RpcError};
use crate::session::{ReconnectPolicy, Session, SessionConfig, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("access denied: {0}")]
    AuthDenied(String),

    #[error("session failed: {0}")]
    Session(SessionError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Denied(reason) => ClientError::AuthDenied(reason),
            other => ClientError::Session(other),
        }
    }
}

/// Events of a streaming hub call, decoded as `T`.
pub struct Events<T> {
    inner: CallStream,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Events<T> {
    fn new(inner: CallStream) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Next event; `None` once the hub ended the stream.
    pub async fn next(&mut self) -> Option<Result<T, ClientError>> {
        self.inner.next_as::<T>().await.map(|r| r.map_err(ClientError::from))
    }
}

pub struct Client {
    session: Session,
}

impl Client {
    /// Connect to the hub control port and authenticate.
    pub async fn connect(hub: &str, secret: &str) -> Result<Self, ClientError> {
        let config = SessionConfig {
            address: hub.to_string(),
            secret: secret.to_string(),
            role: Role::Client,
            identity: None,
            hostname: None,
            reconnect: ReconnectPolicy::Never,
        };
        let session = Session::connect(config, MethodTable::new());
        session.wait_up().await?;
        Ok(Self { session })
    }

    /// Identity the hub assigned to this session.
    pub fn identity(&self) -> Option<String> {
        self.session.descriptor().map(|d| d.identity)
    }

    /// Fetch and check out a commit on the target drones.
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployReport, ClientError> {
        Ok(self.session.call("deploy", request).await?)
    }

    /// Deploy and start a command on the target drones, streaming their
    /// events. Dropping the stream cancels the spawn on the hub.
    pub fn spawn(&self, request: SpawnRequest) -> Events<FleetEvent> {
        Events::new(self.session.peer().call_stream("spawn", request))
    }

    /// Process tables, one record per drone.
    pub fn ps(&self) -> Events<PsRecord> {
        Events::new(self.session.peer().call_stream("ps", serde_json::Value::Null))
    }

    pub async fn drones(&self) -> Result<Vec<DroneInfo>, ClientError> {
        Ok(self.session.call("drones", serde_json::Value::Null).await?)
    }

    pub async fn stop(&self, drone: &str, id: &str) -> Result<ProcessInfo, ClientError> {
        Ok(self.session.call("stop", target(drone, id)).await?)
    }

    pub async fn restart(&self, drone: &str, id: &str) -> Result<ProcessInfo, ClientError> {
        Ok(self.session.call("restart", target(drone, id)).await?)
    }

    pub async fn scrollback(&self, drone: &str, params: ScrollbackParams) -> Result<ScrollbackSlice, ClientError> {
        let request = DroneScrollbackRequest {
            drone: drone.to_string(),
            params,
        };
        Ok(self.session.call("scrollback", request).await?)
    }

    /// Drop exited processes on one drone, or on every drone.
    pub async fn gc(&self, drone: Option<&str>) -> Result<Vec<GcRecord>, ClientError> {
        let request = GcRequest {
            drone: drone.map(str::to_string),
        };
        Ok(self.session.call("gc", request).await?)
    }

    pub async fn close(self) {
        self.session.close().await;
    }
}

fn target(drone: &str, id: &str) -> ProcessTarget {
    ProcessTarget {
        drone: drone.to_string(),
        id: id.to_string(),
    }
}
