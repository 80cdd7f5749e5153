use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::hub::git::{PushEvent, RepoStore};
use crate::hub::registry::{DroneEntry, DroneRegistry, RegistryEvent};

/// Keeps drone mirrors current: every push triggers a `fetch` of that
/// repository on every drone, and a newly joined drone fetches every hosted
/// repository. Fetches are fire-and-forget.
pub fn spawn(
    registry: DroneRegistry,
    store: RepoStore,
    mut pushes: broadcast::Receiver<PushEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    // Subscribe before returning so no join is missed.
    let mut joins = registry.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                push = pushes.recv() => match push {
                    Ok(PushEvent { repo }) => {
                        let drones = registry.list();
                        tracing::info!(repo = %repo, drones = drones.len(), "notifying drones of push");
                        for drone in drones {
                            fetch(drone, repo.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "push notifier lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                joined = joins.recv() => match joined {
                    Ok(RegistryEvent::Joined(drone)) => {
                        let repos = store.list().await;
                        tracing::debug!(drone = %drone.identity, repos = repos.len(), "catch-up fetch");
                        for repo in repos {
                            fetch(drone.clone(), repo);
                        }
                    }
                    Ok(RegistryEvent::Left { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "registry events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    })
}

fn fetch(drone: DroneEntry, repo: String) {
    tokio::spawn(async move {
        match drone.handle.fetch(&repo).await {
            Ok(report) if report.ok => tracing::debug!(drone = %drone.identity, repo = %repo, "fetched"),
            Ok(report) => tracing::warn!(
                drone = %drone.identity,
                repo = %repo,
                step = ?report.step,
                code = ?report.code,
                "fetch failed on drone"
            ),
            Err(e) => tracing::warn!(drone = %drone.identity, repo = %repo, error = %e, "fetch call failed"),
        }
    });
}
