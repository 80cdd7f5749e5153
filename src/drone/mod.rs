//! The drone: a worker that mirrors hub repositories, checks out commits,
//! and keeps the commands it was asked to run alive.

pub mod scrollback;
pub mod supervisor;
pub mod workspace;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, watch};

use crate::protocol::{
    DeployParams, Descriptor, FetchParams, ProcessEvent, ProcessIdParams, ProcessInfo, Role, ScrollbackParams,
    SpawnParams,
};
use crate::rpc::{Call, MethodTable, RpcError};
use crate::session::{ReconnectPolicy, Session, SessionConfig};

pub use scrollback::ScrollbackBuffer;
pub use supervisor::{LaunchSpec, RespawnPolicy, Supervisor, SupervisorError};
pub use workspace::{GitWorkspace, WorkspaceError};

pub const DEFAULT_SCROLLBACK_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct DroneConfig {
    /// Hub control address, `host:port`.
    pub hub: String,
    pub secret: String,
    pub basedir: PathBuf,
    /// Identity proposed to the hub. A random one is generated when absent.
    pub identity: Option<String>,
    pub hostname: Option<String>,
    pub reconnect_interval: Duration,
    pub respawn_delay: Duration,
    pub scrollback_bytes: usize,
}

impl From<SupervisorError> for RpcError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::NoSuchProcess(id) => RpcError::NoSuchProcess(id),
            SupervisorError::EmptyCommand => RpcError::InvalidParams(e.to_string()),
        }
    }
}

impl From<WorkspaceError> for RpcError {
    fn from(e: WorkspaceError) -> Self {
        RpcError::InvalidParams(e.to_string())
    }
}

/// State shared by the drone's method handlers.
#[derive(Clone)]
struct DroneContext {
    supervisor: Supervisor,
    workspace: GitWorkspace,
    hub_host: String,
    descriptor: watch::Receiver<Option<Descriptor>>,
}

impl DroneContext {
    /// The hub's git URL for `repo`, known once the session is up.
    fn origin(&self, repo: &str) -> Option<String> {
        self.descriptor
            .borrow()
            .as_ref()
            .map(|d| format!("http://{}:{}/{}", self.hub_host, d.ports.git, repo))
    }
}

/// A running drone: its hub session plus the local supervisor.
pub struct Drone {
    session: Session,
    supervisor: Supervisor,
    workspace: GitWorkspace,
}

impl Drone {
    /// Start the drone and begin connecting to the hub.
    pub fn start(config: DroneConfig) -> Self {
        let supervisor = Supervisor::new(
            RespawnPolicy {
                delay: config.respawn_delay,
            },
            config.scrollback_bytes,
        );
        let workspace = GitWorkspace::new(&config.basedir);
        let (descriptor_tx, descriptor_rx) = watch::channel(None);

        let session_config = SessionConfig {
            address: config.hub.clone(),
            secret: config.secret.clone(),
            role: Role::Drone,
            identity: Some(config.identity.clone().unwrap_or_else(crate::random_token)),
            hostname: config.hostname.clone(),
            reconnect: ReconnectPolicy::Fixed(config.reconnect_interval),
        };
        let context = DroneContext {
            supervisor: supervisor.clone(),
            workspace: workspace.clone(),
            hub_host: session_config.host().to_string(),
            descriptor: descriptor_rx,
        };
        let session = Session::connect_with(session_config, drone_methods(context), descriptor_tx);

        Self {
            session,
            supervisor,
            workspace,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn workspace(&self) -> &GitWorkspace {
        &self.workspace
    }

    /// Stop every managed process and close the hub session.
    pub async fn shutdown(self) {
        self.supervisor.stop_all();
        self.session.close().await;
    }
}

fn drone_methods(context: DroneContext) -> MethodTable {
    let mut methods = MethodTable::new();

    let ctx = context.clone();
    methods.register("fetch", move |call: Call| {
        let ctx = ctx.clone();
        async move {
            let params: FetchParams = call.parse()?;
            let origin = ctx
                .origin(&params.repo)
                .ok_or_else(|| RpcError::Internal("hub git endpoint unknown".into()))?;
            let report = ctx.workspace.fetch(&params.repo, &origin).await?;
            if report.ok {
                tracing::info!(repo = %params.repo, "fetched");
            } else {
                tracing::warn!(repo = %params.repo, step = ?report.step, code = ?report.code, "fetch failed");
            }
            Ok(serde_json::to_value(report)?)
        }
    });

    let ctx = context.clone();
    methods.register("deploy", move |call: Call| {
        let ctx = ctx.clone();
        async move {
            let params: DeployParams = call.parse()?;
            let origin = ctx.origin(&params.repo);
            let report = ctx
                .workspace
                .deploy(&params.repo, &params.commit, origin.as_deref())
                .await?;
            Ok(serde_json::to_value(report)?)
        }
    });

    let ctx = context.clone();
    methods.register("spawn", move |call: Call| {
        let ctx = ctx.clone();
        async move { spawn(ctx, call).await }
    });

    let ctx = context.clone();
    methods.register("stop", move |call: Call| {
        let ctx = ctx.clone();
        async move {
            let params: ProcessIdParams = call.parse()?;
            ctx.supervisor.stop(&params.id)?;
            Ok(serde_json::to_value(ctx.supervisor.info(&params.id)?)?)
        }
    });

    let ctx = context.clone();
    methods.register("restart", move |call: Call| {
        let ctx = ctx.clone();
        async move {
            let params: ProcessIdParams = call.parse()?;
            ctx.supervisor.restart(&params.id)?;
            Ok(serde_json::to_value(ctx.supervisor.info(&params.id)?)?)
        }
    });

    let ctx = context.clone();
    methods.register("ps", move |_call: Call| {
        let ctx = ctx.clone();
        async move { Ok(serde_json::to_value(ctx.supervisor.ps())?) }
    });

    let ctx = context.clone();
    methods.register("scrollback", move |call: Call| {
        let ctx = ctx.clone();
        async move {
            let params: ScrollbackParams = call.parse()?;
            let slice = ctx.supervisor.scrollback(&params.id, params.offset, params.limit)?;
            Ok(serde_json::to_value(slice)?)
        }
    });

    let ctx = context;
    methods.register("gc", move |_call: Call| {
        let ctx = ctx.clone();
        async move {
            let removed = ctx.supervisor.collect_garbage();
            if !removed.is_empty() {
                tracing::info!(count = removed.len(), "collected stopped processes");
            }
            Ok(serde_json::to_value(removed)?)
        }
    });

    methods
}

/// Deploy, launch, and stream the process's events until its final exit or
/// until the caller goes away. The process keeps running in the latter case.
async fn spawn(ctx: DroneContext, call: Call) -> Result<serde_json::Value, RpcError> {
    let params: SpawnParams = call.parse()?;
    let origin = ctx.origin(&params.repo);
    let report = ctx
        .workspace
        .deploy(&params.repo, &params.commit, origin.as_deref())
        .await?;
    if !report.ok {
        tracing::warn!(repo = %params.repo, commit = %params.commit, step = ?report.step, "deploy failed, not spawning");
        call.sink.emit(&ProcessEvent::Failed { report: report.clone() })?;
        return Ok(json!({ "report": report }));
    }
    let Some(dir) = report.dir else {
        return Err(RpcError::Internal("deploy reported no checkout directory".into()));
    };

    let mut events = ctx.supervisor.subscribe();
    let id = ctx.supervisor.spawn(LaunchSpec {
        repo: params.repo,
        commit: params.commit,
        command: params.command,
        env: params.env,
        cwd: PathBuf::from(dir),
        scrollback: params.scrollback,
    })?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.process_id() == Some(id.as_str()) => {
                    let terminal = event.is_terminal();
                    if call.sink.emit(&event).is_err() || terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(process = %id, skipped = n, "spawn stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = call.sink.closed() => {
                tracing::debug!(process = %id, "spawn caller went away");
                break;
            }
        }
    }
    Ok(json!({ "id": id }))
}

/// One console line for the drone's event log.
pub fn describe_event(info: Option<&ProcessInfo>, event: &ProcessEvent) -> Option<String> {
    let label = match info {
        Some(info) => format!("[{}.{}]", info.repo, info.commit),
        None => format!("[{}]", event.process_id().unwrap_or("?")),
    };
    match event {
        ProcessEvent::Spawn { id, pid } => Some(format!(
            "{} spawn {} (pid {})",
            label,
            id,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
        )),
        ProcessEvent::Data { data, .. } => {
            let text = String::from_utf8_lossy(data);
            let text = text.trim_end_matches('\n');
            if text.is_empty() {
                None
            } else {
                Some(format!("{} {}", label, text))
            }
        }
        ProcessEvent::Exit {
            id,
            code,
            signal,
            respawning,
        } => {
            let how = match (code, signal) {
                (Some(code), _) => format!("code {}", code),
                (None, Some(signal)) => format!("signal {}", signal),
                (None, None) => "stopped".to_string(),
            };
            let next = if *respawning { ", respawning" } else { "" };
            Some(format!("{} exit {} ({}{})", label, id, how, next))
        }
        ProcessEvent::Failed { report } => Some(format!(
            "{} deploy failed at {}",
            label,
            report.step.as_deref().unwrap_or("?")
        )),
        ProcessEvent::Error { message } => Some(format!("{} error: {}", label, message)),
    }
}
