//! The hub: drone registry, dispatch of operator requests, git hosting and
//! push notification.

pub mod control;
pub mod dispatch;
pub mod git;
pub mod notifier;
pub mod registry;
pub mod remote;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::protocol::Ports;

pub use control::{ControlState, ACCESS_DENIED};
pub use dispatch::{Dispatcher, HubService};
pub use git::{GitState, PushEvent, RepoStore};
pub use registry::{DroneEntry, DroneRegistry, RegistryEvent};
pub use remote::{DroneCapabilities, RemoteDrone};

pub const DEFAULT_CONTROL_PORT: u16 = 7000;
pub const DEFAULT_GIT_PORT: u16 = 7001;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: IpAddr,
    /// Control port; 0 picks a free one.
    pub control_port: u16,
    /// Git endpoint port; 0 picks a free one.
    pub git_port: u16,
    pub secret: String,
    pub basedir: PathBuf,
    pub hostname: Option<String>,
}

impl HubConfig {
    pub fn new(secret: impl Into<String>, basedir: impl Into<PathBuf>) -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            git_port: DEFAULT_GIT_PORT,
            secret: secret.into(),
            basedir: basedir.into(),
            hostname: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to prepare {path}: {source}")]
    Basedir { path: PathBuf, source: std::io::Error },
}

/// A running hub.
pub struct Hub {
    registry: DroneRegistry,
    store: RepoStore,
    pushes: broadcast::Sender<PushEvent>,
    control_addr: SocketAddr,
    git_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Hub {
    /// Bind both listeners and start serving.
    pub async fn start(config: HubConfig) -> Result<Self, HubError> {
        let store = RepoStore::new(&config.basedir);
        tokio::fs::create_dir_all(store.root())
            .await
            .map_err(|source| HubError::Basedir {
                path: store.root().to_path_buf(),
                source,
            })?;

        let control_listener = bind("control", SocketAddr::new(config.bind, config.control_port)).await?;
        let git_listener = bind("git", SocketAddr::new(config.bind, config.git_port)).await?;
        let control_addr = local_addr("control", &control_listener, config.bind, config.control_port)?;
        let git_addr = local_addr("git", &git_listener, config.bind, config.git_port)?;

        let registry = DroneRegistry::new();
        let (pushes, push_rx) = broadcast::channel(256);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // The notifier subscribes before the control server can register anyone.
        tasks.push(notifier::spawn(
            registry.clone(),
            store.clone(),
            push_rx,
            cancel.clone(),
        ));

        let state = Arc::new(ControlState::new(
            registry.clone(),
            Arc::new(Dispatcher::new(registry.clone())),
            config.secret.clone(),
            Ports {
                control: control_addr.port(),
                git: git_addr.port(),
            },
            config.hostname.clone(),
        ));
        let control_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = control::serve(control_listener, state, control_cancel).await {
                tracing::error!(?e, "control server error");
            }
        }));

        let app = git::router(GitState {
            store: store.clone(),
            pushes: pushes.clone(),
        });
        let git_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move { git_cancel.cancelled().await };
            if let Err(e) = axum::serve(git_listener, app).with_graceful_shutdown(shutdown).await {
                tracing::error!(?e, "git endpoint error");
            }
        }));

        tracing::info!(%control_addr, %git_addr, basedir = %config.basedir.display(), "hub listening");

        Ok(Self {
            registry,
            store,
            pushes,
            control_addr,
            git_addr,
            cancel,
            tasks,
        })
    }

    pub fn registry(&self) -> &DroneRegistry {
        &self.registry
    }

    pub fn store(&self) -> &RepoStore {
        &self.store
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn git_addr(&self) -> SocketAddr {
        self.git_addr
    }

    /// Subscribe to completed pushes.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushEvent> {
        self.pushes.subscribe()
    }

    /// Resolves once [`Hub::shutdown`] has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Stop accepting, close every session, and wait for the servers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("hub stopped");
    }
}

async fn bind(what: &'static str, addr: SocketAddr) -> Result<TcpListener, HubError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| HubError::Bind { what, addr, source })
}

fn local_addr(what: &'static str, listener: &TcpListener, ip: IpAddr, port: u16) -> Result<SocketAddr, HubError> {
    listener.local_addr().map_err(|source| HubError::Bind {
        what,
        addr: SocketAddr::new(ip, port),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_on_ephemeral_ports_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HubConfig::new("s3cret", dir.path());
        config.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.control_port = 0;
        config.git_port = 0;

        let hub = Hub::start(config).await.unwrap();
        assert_ne!(hub.control_addr().port(), 0);
        assert_ne!(hub.git_addr().port(), 0);
        assert!(hub.store().root().is_dir());
        assert!(hub.registry().is_empty());
        // Only the notifier listens; the git endpoint logs pushes itself.
        assert_eq!(hub.pushes.receiver_count(), 1);

        tokio::time::timeout(std::time::Duration::from_secs(5), hub.shutdown())
            .await
            .unwrap();
    }
}
