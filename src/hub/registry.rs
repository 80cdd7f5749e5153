use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::hub::remote::DroneCapabilities;
use crate::protocol::{DroneInfo, TargetSelector};

/// A connected drone as the hub sees it.
#[derive(Clone)]
pub struct DroneEntry {
    pub identity: String,
    /// Control connection the drone registered on.
    pub session: u64,
    pub hostname: Option<String>,
    pub capabilities: Vec<String>,
    pub handle: Arc<dyn DroneCapabilities>,
    /// Closes the owning connection.
    pub disconnect: CancellationToken,
}

impl DroneEntry {
    pub fn info(&self) -> DroneInfo {
        DroneInfo {
            identity: self.identity.clone(),
            hostname: self.hostname.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

impl std::fmt::Debug for DroneEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DroneEntry")
            .field("identity", &self.identity)
            .field("session", &self.session)
            .field("hostname", &self.hostname)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Joined(DroneEntry),
    Left { identity: String },
}

/// The live set of drones, kept equal to the set of open drone sessions.
#[derive(Clone)]
pub struct DroneRegistry {
    entries: Arc<RwLock<Vec<DroneEntry>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DroneRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Add a drone. An entry with the same identity held by another session
    /// is replaced and returned, and that session is disconnected.
    pub fn register(&self, entry: DroneEntry) -> Option<DroneEntry> {
        let replaced = {
            let mut entries = self.entries.write();
            let replaced = entries
                .iter()
                .position(|e| e.identity == entry.identity)
                .map(|i| entries.remove(i));
            entries.push(entry.clone());
            replaced
        };
        if let Some(old) = &replaced {
            if old.session != entry.session {
                tracing::warn!(drone = %old.identity, session = old.session, "identity taken over, closing older session");
                old.disconnect.cancel();
            }
        }
        tracing::info!(drone = %entry.identity, session = entry.session, "drone registered");
        let _ = self.events.send(RegistryEvent::Joined(entry));
        replaced
    }

    /// Remove `identity` if it is still owned by `session`. Returns whether
    /// an entry was removed.
    pub fn remove(&self, identity: &str, session: u64) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            match entries
                .iter()
                .position(|e| e.identity == identity && e.session == session)
            {
                Some(i) => {
                    entries.remove(i);
                    true
                }
                None => false,
            }
        };
        if removed {
            tracing::info!(drone = %identity, session, "drone removed");
            let _ = self.events.send(RegistryEvent::Left {
                identity: identity.to_string(),
            });
        }
        removed
    }

    /// Drones a request addresses. Unknown names are dropped; `Random` picks
    /// one drone uniformly, or none from an empty registry.
    pub fn resolve(&self, selector: &TargetSelector) -> Vec<DroneEntry> {
        let entries = self.entries.read();
        match selector {
            TargetSelector::One(identity) => entries.iter().filter(|e| &e.identity == identity).cloned().collect(),
            TargetSelector::Set(identities) => {
                let mut picked: Vec<DroneEntry> = Vec::new();
                for identity in identities {
                    if picked.iter().any(|p| &p.identity == identity) {
                        continue;
                    }
                    if let Some(entry) = entries.iter().find(|e| &e.identity == identity) {
                        picked.push(entry.clone());
                    }
                }
                picked
            }
            TargetSelector::Random => entries.choose(&mut rand::thread_rng()).cloned().into_iter().collect(),
        }
    }

    pub fn get(&self, identity: &str) -> Option<DroneEntry> {
        self.entries.read().iter().find(|e| e.identity == identity).cloned()
    }

    /// All drones, in registration order.
    pub fn list(&self) -> Vec<DroneEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for DroneRegistry {
    fn default() -> Self {
        Self::new()
    }
}
