use futures::future::{join_all, BoxFuture};
use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::{FutureExt, StreamExt};

use crate::hub::registry::{DroneEntry, DroneRegistry};
use crate::protocol::{
    DeployParams, DeployReport, DeployRequest, DroneDeployResult, DroneInfo, DroneScrollbackRequest, FleetEvent,
    GcRecord, GcRequest, ProcessInfo, ProcessTarget, PsRecord, ScrollbackSlice, SpawnRequest,
};
use crate::rpc::RpcError;

/// Operations the hub offers operator clients.
pub trait HubService: Send + Sync {
    /// Completes once every target drone replied; vacuously for none.
    fn deploy(&self, request: DeployRequest) -> BoxFuture<'static, DeployReport>;

    /// Merged events of every target drone. Ends when each drone's feed
    /// reached a terminal event.
    fn spawn(&self, request: SpawnRequest) -> BoxStream<'static, FleetEvent>;

    /// One record per live drone, in reply order.
    fn ps(&self) -> BoxStream<'static, PsRecord>;

    fn drones(&self) -> Vec<DroneInfo>;

    fn stop(&self, target: ProcessTarget) -> BoxFuture<'static, Result<ProcessInfo, RpcError>>;

    fn restart(&self, target: ProcessTarget) -> BoxFuture<'static, Result<ProcessInfo, RpcError>>;

    fn scrollback(&self, request: DroneScrollbackRequest) -> BoxFuture<'static, Result<ScrollbackSlice, RpcError>>;

    fn gc(&self, request: GcRequest) -> BoxFuture<'static, Result<Vec<GcRecord>, RpcError>>;
}

/// Resolves targets against the registry and fans calls out to them.
#[derive(Clone)]
pub struct Dispatcher {
    registry: DroneRegistry,
}

impl Dispatcher {
    pub fn new(registry: DroneRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DroneRegistry {
        &self.registry
    }

    fn drone(&self, identity: &str) -> Result<DroneEntry, RpcError> {
        self.registry
            .get(identity)
            .ok_or_else(|| RpcError::NoSuchDrone(identity.to_string()))
    }
}

impl HubService for Dispatcher {
    fn deploy(&self, request: DeployRequest) -> BoxFuture<'static, DeployReport> {
        let targets = self.registry.resolve(&request.target.selector());
        tracing::info!(
            repo = %request.repo,
            commit = %request.commit,
            targets = targets.len(),
            "dispatching deploy"
        );
        let params = DeployParams {
            repo: request.repo,
            commit: request.commit,
        };
        let calls: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let reply = target.handle.deploy(params.clone());
                async move {
                    match reply.await {
                        Ok(report) => DroneDeployResult {
                            drone: target.identity,
                            report: Some(report),
                            error: None,
                        },
                        Err(e) => DroneDeployResult {
                            drone: target.identity,
                            report: None,
                            error: Some(e.to_string()),
                        },
                    }
                }
            })
            .collect();
        async move {
            DeployReport {
                results: join_all(calls).await,
            }
        }
        .boxed()
    }

    fn spawn(&self, request: SpawnRequest) -> BoxStream<'static, FleetEvent> {
        let targets = self.registry.resolve(&request.target.selector());
        tracing::info!(
            repo = %request.repo,
            commit = %request.commit,
            command = ?request.command,
            targets = targets.len(),
            "dispatching spawn"
        );
        let params = request.params();
        let feeds: Vec<BoxStream<'static, FleetEvent>> = targets
            .into_iter()
            .map(|target| {
                let drone = target.identity.clone();
                let feed = target.handle.spawn(params.clone()).map(move |event| FleetEvent {
                    drone: drone.clone(),
                    event,
                });
                through_terminal(feed.boxed())
            })
            .collect();
        if feeds.is_empty() {
            return stream::empty().boxed();
        }
        stream::select_all(feeds).boxed()
    }

    fn ps(&self) -> BoxStream<'static, PsRecord> {
        let replies: FuturesUnordered<_> = self
            .registry
            .list()
            .into_iter()
            .map(|target| {
                let reply = target.handle.ps();
                async move {
                    match reply.await {
                        Ok(processes) => PsRecord {
                            drone: target.identity,
                            processes,
                            error: None,
                        },
                        Err(e) => PsRecord {
                            drone: target.identity,
                            processes: Vec::new(),
                            error: Some(e.to_string()),
                        },
                    }
                }
            })
            .collect();
        replies.boxed()
    }

    fn drones(&self) -> Vec<DroneInfo> {
        self.registry.list().iter().map(DroneEntry::info).collect()
    }

    fn stop(&self, target: ProcessTarget) -> BoxFuture<'static, Result<ProcessInfo, RpcError>> {
        match self.drone(&target.drone) {
            Ok(entry) => entry.handle.stop(&target.id),
            Err(e) => async move { Err(e) }.boxed(),
        }
    }

    fn restart(&self, target: ProcessTarget) -> BoxFuture<'static, Result<ProcessInfo, RpcError>> {
        match self.drone(&target.drone) {
            Ok(entry) => entry.handle.restart(&target.id),
            Err(e) => async move { Err(e) }.boxed(),
        }
    }

    fn scrollback(&self, request: DroneScrollbackRequest) -> BoxFuture<'static, Result<ScrollbackSlice, RpcError>> {
        match self.drone(&request.drone) {
            Ok(entry) => entry.handle.scrollback(request.params),
            Err(e) => async move { Err(e) }.boxed(),
        }
    }

    fn gc(&self, request: GcRequest) -> BoxFuture<'static, Result<Vec<GcRecord>, RpcError>> {
        let targets = match &request.drone {
            Some(identity) => match self.drone(identity) {
                Ok(entry) => vec![entry],
                Err(e) => return async move { Err(e) }.boxed(),
            },
            None => self.registry.list(),
        };
        let calls: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let reply = target.handle.gc();
                async move {
                    match reply.await {
                        Ok(removed) => GcRecord {
                            drone: target.identity,
                            removed,
                            error: None,
                        },
                        Err(e) => GcRecord {
                            drone: target.identity,
                            removed: Vec::new(),
                            error: Some(e.to_string()),
                        },
                    }
                }
            })
            .collect();
        async move { Ok(join_all(calls).await) }.boxed()
    }
}

/// Pass events through up to and including the first terminal one.
fn through_terminal(feed: BoxStream<'static, FleetEvent>) -> BoxStream<'static, FleetEvent> {
    stream::unfold((feed, false), |(mut feed, finished)| async move {
        if finished {
            return None;
        }
        let event = feed.next().await?;
        let terminal = event.event.is_terminal();
        Some((event, (feed, terminal)))
    })
    .boxed()
}
