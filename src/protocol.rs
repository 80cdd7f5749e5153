//! Wire protocol shared by the hub, drones, and operator clients.
//!
//! Every WebSocket text frame carries one JSON [`Message`]. A call is a
//! `request` answered by exactly one `response` with the same id; streaming
//! calls additionally receive any number of `event` frames before the
//! response. Either side may abandon a call it issued with `cancel`.
//!
//! Method parameter and result types live here too so both ends agree on
//! field names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Envelope ───────────────────────────────────────────────────────

/// A single frame on the session transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    Event {
        id: u64,
        data: serde_json::Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Cancel {
        id: u64,
    },
}

/// Error payload inside a `response` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

// ── Handshake ──────────────────────────────────────────────────────

/// Which side of the fleet a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Drone,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Drone => f.write_str("drone"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Parameters of the hub's `auth` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    pub secret: String,
    pub role: Role,
    /// Identity the caller would like to keep across reconnects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// Reply to `auth`. A denial is a normal result, not an RPC error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthReply {
    Granted(Descriptor),
    Denied { reason: String },
}

/// What the hub tells a session about itself once authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub identity: String,
    pub ports: Ports,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    pub control: u16,
    pub git: u16,
}

/// Parameters of the hub's `register` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterParams {
    pub role: Role,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

// ── Dispatch requests (client → hub) ───────────────────────────────

/// Target selection fields shared by `deploy` and `spawn`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drones: Option<Vec<String>>,
}

/// Resolved form of [`TargetFields`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    One(String),
    Set(Vec<String>),
    Random,
}

impl TargetFields {
    /// `drones` wins over `drone` when both are given.
    pub fn selector(&self) -> TargetSelector {
        match (&self.drone, &self.drones) {
            (_, Some(set)) => TargetSelector::Set(set.clone()),
            (Some(one), None) => TargetSelector::One(one.clone()),
            (None, None) => TargetSelector::Random,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub repo: String,
    pub commit: String,
    #[serde(flatten)]
    pub target: TargetFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub repo: String,
    pub commit: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrollback: Option<usize>,
    #[serde(flatten)]
    pub target: TargetFields,
}

impl SpawnRequest {
    pub fn params(&self) -> SpawnParams {
        SpawnParams {
            repo: self.repo.clone(),
            commit: self.commit.clone(),
            command: self.command.clone(),
            env: self.env.clone(),
            scrollback: self.scrollback,
        }
    }
}

/// Addresses one managed process on one drone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTarget {
    pub drone: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneScrollbackRequest {
    pub drone: String,
    #[serde(flatten)]
    pub params: ScrollbackParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drone: Option<String>,
}

// ── Drone capabilities (hub → drone) ───────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchParams {
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployParams {
    pub repo: String,
    pub commit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnParams {
    pub repo: String,
    pub commit: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrollback: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessIdParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollbackParams {
    pub id: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_scrollback_limit")]
    pub limit: usize,
}

fn default_scrollback_limit() -> usize {
    100
}

/// Outcome of a git pipeline run on a drone.
///
/// A failing external step is reported here, not as an RPC error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

impl PipelineReport {
    pub fn success(dir: Option<String>) -> Self {
        Self {
            ok: true,
            dir,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Respawning,
    Stopped,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => f.write_str("running"),
            ProcessStatus::Respawning => f.write_str("respawning"),
            ProcessStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// One row of a drone's process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: String,
    pub status: ProcessStatus,
    pub repo: String,
    pub commit: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub exits: u64,
    pub scrollback_bytes: usize,
}

/// A window over a process's scrollback chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollbackSlice {
    pub total_chunks: usize,
    pub total_bytes: usize,
    pub offset: usize,
    #[serde(with = "base64_chunks")]
    pub chunks: Vec<Vec<u8>>,
}

/// Lifecycle and output events of a managed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessEvent {
    Spawn {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Data {
        id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Exit {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        /// False once the process has reached its final exit.
        respawning: bool,
    },
    /// The deploy pipeline failed before anything was spawned.
    Failed { report: PipelineReport },
    /// The drone could not be reached or returned an RPC error.
    Error { message: String },
}

impl ProcessEvent {
    /// Process the event belongs to, if any.
    pub fn process_id(&self) -> Option<&str> {
        match self {
            ProcessEvent::Spawn { id, .. } | ProcessEvent::Data { id, .. } | ProcessEvent::Exit { id, .. } => {
                Some(id)
            }
            ProcessEvent::Failed { .. } | ProcessEvent::Error { .. } => None,
        }
    }

    /// True for the last event a spawn feed will carry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessEvent::Exit {
                respawning: false,
                ..
            } | ProcessEvent::Failed { .. }
                | ProcessEvent::Error { .. }
        )
    }
}

// ── Aggregated hub results (hub → client) ──────────────────────────

/// A process event tagged with the drone it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetEvent {
    pub drone: String,
    #[serde(flatten)]
    pub event: ProcessEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroneDeployResult {
    pub drone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PipelineReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DroneDeployResult {
    pub fn is_ok(&self) -> bool {
        self.report.as_ref().map(|r| r.ok).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReport {
    pub results: Vec<DroneDeployResult>,
}

/// One drone's process table, as streamed by the hub's `ps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsRecord {
    pub drone: String,
    #[serde(default)]
    pub processes: Vec<ProcessInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroneInfo {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRecord {
    pub drone: String,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Check a repository name before it becomes part of a path or a git
/// argument. Names are single path components without a leading dot or dash.
pub fn validate_repo_name(name: &str) -> Result<(), String> {
    validate_component("repository name", name)
}

/// Same rules as [`validate_repo_name`]; a commit also names a checkout
/// directory.
pub fn validate_commit(commit: &str) -> Result<(), String> {
    validate_component("commit", commit)
}

fn validate_component(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} must not be empty", kind));
    }
    if value.starts_with('.') || value.starts_with('-') {
        return Err(format!("{} must not start with '.' or '-': {}", kind, value));
    }
    if value.chars().any(|c| c == '/' || c == '\\' || c == '\0' || c.is_whitespace()) {
        return Err(format!("{} contains an invalid character: {}", kind, value));
    }
    Ok(())
}

/// Serde helper for base64-encoded byte vectors in JSON.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_chunks {
    use base64::Engine;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chunks: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(chunks.len()))?;
        for chunk in chunks {
            seq.serialize_element(&base64::engine::general_purpose::STANDARD.encode(chunk))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
