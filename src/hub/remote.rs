use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use crate::protocol::{
    DeployParams, FetchParams, PipelineReport, ProcessEvent, ProcessIdParams, ProcessInfo, ScrollbackParams,
    ScrollbackSlice, SpawnParams,
};
use crate::rpc::{Peer, RpcError};

/// What the hub can ask of a drone.
///
/// [`RemoteDrone`] forwards each capability over the drone's session; tests
/// substitute in-process fakes.
pub trait DroneCapabilities: Send + Sync {
    fn fetch(&self, repo: &str) -> BoxFuture<'static, Result<PipelineReport, RpcError>>;

    fn deploy(&self, params: DeployParams) -> BoxFuture<'static, Result<PipelineReport, RpcError>>;

    /// Lifecycle and output events of the spawned process. RPC failures show
    /// up as a final [`ProcessEvent::Error`]. Dropping the stream cancels it.
    fn spawn(&self, params: SpawnParams) -> BoxStream<'static, ProcessEvent>;

    fn stop(&self, id: &str) -> BoxFuture<'static, Result<ProcessInfo, RpcError>>;

    fn restart(&self, id: &str) -> BoxFuture<'static, Result<ProcessInfo, RpcError>>;

    fn ps(&self) -> BoxFuture<'static, Result<Vec<ProcessInfo>, RpcError>>;

    fn scrollback(&self, params: ScrollbackParams) -> BoxFuture<'static, Result<ScrollbackSlice, RpcError>>;

    fn gc(&self) -> BoxFuture<'static, Result<Vec<String>, RpcError>>;
}

/// A drone reached through its session peer.
#[derive(Debug, Clone)]
pub struct RemoteDrone {
    peer: Peer,
}

impl RemoteDrone {
    pub fn new(peer: Peer) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl DroneCapabilities for RemoteDrone {
    fn fetch(&self, repo: &str) -> BoxFuture<'static, Result<PipelineReport, RpcError>> {
        let peer = self.peer.clone();
        let params = FetchParams { repo: repo.to_string() };
        async move { peer.call_as("fetch", params).await }.boxed()
    }

    fn deploy(&self, params: DeployParams) -> BoxFuture<'static, Result<PipelineReport, RpcError>> {
        let peer = self.peer.clone();
        async move { peer.call_as("deploy", params).await }.boxed()
    }

    fn spawn(&self, params: SpawnParams) -> BoxStream<'static, ProcessEvent> {
        self.peer
            .call_stream("spawn", params)
            .map(|item| match item {
                Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| ProcessEvent::Error {
                    message: format!("malformed spawn event: {}", e),
                }),
                Err(e) => ProcessEvent::Error { message: e.to_string() },
            })
            .boxed()
    }

    fn stop(&self, id: &str) -> BoxFuture<'static, Result<ProcessInfo, RpcError>> {
        let peer = self.peer.clone();
        let params = ProcessIdParams { id: id.to_string() };
        async move { peer.call_as("stop", params).await }.boxed()
    }

    fn restart(&self, id: &str) -> BoxFuture<'static, Result<ProcessInfo, RpcError>> {
        let peer = self.peer.clone();
        let params = ProcessIdParams { id: id.to_string() };
        async move { peer.call_as("restart", params).await }.boxed()
    }

    fn ps(&self) -> BoxFuture<'static, Result<Vec<ProcessInfo>, RpcError>> {
        let peer = self.peer.clone();
        async move { peer.call_as("ps", serde_json::Value::Null).await }.boxed()
    }

    fn scrollback(&self, params: ScrollbackParams) -> BoxFuture<'static, Result<ScrollbackSlice, RpcError>> {
        let peer = self.peer.clone();
        async move { peer.call_as("scrollback", params).await }.boxed()
    }

    fn gc(&self) -> BoxFuture<'static, Result<Vec<String>, RpcError>> {
        let peer = self.peer.clone();
        async move { peer.call_as("gc", serde_json::Value::Null).await }.boxed()
    }
}
