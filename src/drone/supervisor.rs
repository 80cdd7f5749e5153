use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::broadcast;

use crate::broker::Broker;
use crate::drone::scrollback::ScrollbackBuffer;
use crate::protocol::{ProcessEvent, ProcessInfo, ProcessStatus, ScrollbackSlice};

/// Exit code reported when the command could not be started.
const LAUNCH_FAILURE_CODE: i32 = 127;

/// How long an exited process's output pipes may stay open (held by a
/// grandchild) before its exit is reported anyway.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 4096;

/// How long a process may ignore SIGTERM before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("no such process: {0}")]
    NoSuchProcess(String),

    #[error("command is empty")]
    EmptyCommand,
}

#[derive(Debug, Clone, Copy)]
pub struct RespawnPolicy {
    /// Wait between an unexpected exit and the relaunch.
    pub delay: Duration,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }
}

/// Everything needed to (re)launch a managed process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub repo: String,
    pub commit: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    /// Scrollback bound override for this process.
    pub scrollback: Option<usize>,
}

struct ManagedProcess {
    seq: u64,
    spec: LaunchSpec,
    status: ProcessStatus,
    pid: Option<u32>,
    /// A native process for this record is currently running.
    alive: bool,
    /// Bumped on every launch; exit handlers and delayed relaunches carry
    /// the generation they belong to.
    generation: u64,
    exits: u64,
    scrollback: ScrollbackBuffer,
}

impl ManagedProcess {
    fn info(&self, id: &str) -> ProcessInfo {
        ProcessInfo {
            id: id.to_string(),
            status: self.status,
            repo: self.spec.repo.clone(),
            commit: self.spec.commit.clone(),
            command: self.spec.command.clone(),
            pid: if self.alive { self.pid } else { None },
            exits: self.exits,
            scrollback_bytes: self.scrollback.total_bytes(),
        }
    }
}

struct SupervisorInner {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    next_seq: Mutex<u64>,
    broker: Broker,
    policy: RespawnPolicy,
    scrollback_bytes: usize,
}

/// Keeps the drone's managed processes alive.
///
/// Status moves `running -> respawning -> running` on unexpected exits,
/// to `stopped` on [`Supervisor::stop`], and back to `running` on
/// [`Supervisor::restart`]. Records survive their process and are only
/// dropped by [`Supervisor::collect_garbage`].
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(policy: RespawnPolicy, scrollback_bytes: usize) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                processes: Mutex::new(HashMap::new()),
                next_seq: Mutex::new(0),
                broker: Broker::new(),
                policy,
                scrollback_bytes,
            }),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Live events for every managed process.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.broker.subscribe()
    }

    /// Register a new process and launch it. Subscribe before calling this
    /// to see its `spawn` event.
    pub fn spawn(&self, spec: LaunchSpec) -> Result<String, SupervisorError> {
        if spec.command.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        let seq = {
            let mut next = self.inner.next_seq.lock();
            *next += 1;
            *next
        };
        let scrollback = ScrollbackBuffer::new(spec.scrollback.unwrap_or(self.inner.scrollback_bytes));
        let id = {
            let mut processes = self.inner.processes.lock();
            let id = loop {
                let candidate = crate::random_token();
                if !processes.contains_key(&candidate) {
                    break candidate;
                }
            };
            processes.insert(
                id.clone(),
                ManagedProcess {
                    seq,
                    spec,
                    status: ProcessStatus::Running,
                    pid: None,
                    alive: false,
                    generation: 0,
                    exits: 0,
                    scrollback,
                },
            );
            id
        };
        self.launch(&id);
        Ok(id)
    }

    /// Mark the process stopped and terminate it. Stopping a stopped
    /// process is a no-op.
    pub fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let mut processes = self.inner.processes.lock();
        let proc = processes
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NoSuchProcess(id.to_string()))?;
        if proc.status == ProcessStatus::Stopped {
            return Ok(());
        }
        proc.status = ProcessStatus::Stopped;
        if proc.alive {
            if let Some(pid) = proc.pid {
                self.terminate(id, proc.generation, pid);
            }
        } else {
            // Stopped during the respawn delay or before a failed launch was
            // reported. Retire the generation so nothing pending for it
            // publishes after this final event.
            proc.generation += 1;
            self.inner.broker.publish(ProcessEvent::Exit {
                id: id.to_string(),
                code: None,
                signal: None,
                respawning: false,
            });
        }
        tracing::info!(process = %id, "stopped");
        Ok(())
    }

    /// Relaunch a process. A running process is terminated and relaunched
    /// by its exit handler without the respawn delay.
    pub fn restart(&self, id: &str) -> Result<(), SupervisorError> {
        let launch_now = {
            let mut processes = self.inner.processes.lock();
            let proc = processes
                .get_mut(id)
                .ok_or_else(|| SupervisorError::NoSuchProcess(id.to_string()))?;
            if proc.alive {
                proc.status = ProcessStatus::Respawning;
                if let Some(pid) = proc.pid {
                    self.terminate(id, proc.generation, pid);
                }
                false
            } else {
                true
            }
        };
        tracing::info!(process = %id, "restarting");
        if launch_now {
            self.launch(id);
        }
        Ok(())
    }

    /// Snapshot of every record, oldest first.
    pub fn ps(&self) -> Vec<ProcessInfo> {
        let processes = self.inner.processes.lock();
        let mut rows: Vec<(u64, ProcessInfo)> = processes.iter().map(|(id, p)| (p.seq, p.info(id))).collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, info)| info).collect()
    }

    pub fn info(&self, id: &str) -> Result<ProcessInfo, SupervisorError> {
        self.inner
            .processes
            .lock()
            .get(id)
            .map(|p| p.info(id))
            .ok_or_else(|| SupervisorError::NoSuchProcess(id.to_string()))
    }

    pub fn scrollback(&self, id: &str, offset: usize, limit: usize) -> Result<ScrollbackSlice, SupervisorError> {
        self.inner
            .processes
            .lock()
            .get(id)
            .map(|p| p.scrollback.slice(offset, limit))
            .ok_or_else(|| SupervisorError::NoSuchProcess(id.to_string()))
    }

    /// Drop stopped records whose process has exited. Returns their ids.
    pub fn collect_garbage(&self) -> Vec<String> {
        let mut processes = self.inner.processes.lock();
        let mut removed: Vec<String> = processes
            .iter()
            .filter(|(_, p)| p.status == ProcessStatus::Stopped && !p.alive)
            .map(|(id, _)| id.clone())
            .collect();
        removed.sort();
        for id in &removed {
            processes.remove(id);
        }
        removed
    }

    /// Stop every process, e.g. on drone shutdown.
    pub fn stop_all(&self) {
        let ids: Vec<String> = self.inner.processes.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id) {
                tracing::warn!(process = %id, error = %e, "failed to stop process");
            }
        }
    }

    fn launch(&self, id: &str) {
        let mut processes = self.inner.processes.lock();
        let Some(proc) = processes.get_mut(id) else {
            return;
        };
        proc.generation += 1;
        let generation = proc.generation;

        let spec = proc.spec.clone();
        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..])
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .env("REPO", &spec.repo)
            .env("COMMIT", &spec.commit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        match cmd.spawn() {
            Ok(mut child) => {
                proc.status = ProcessStatus::Running;
                proc.alive = true;
                proc.pid = child.id();
                tracing::info!(
                    process = %id,
                    repo = %spec.repo,
                    commit = %spec.commit,
                    pid = ?proc.pid,
                    "spawned"
                );
                self.inner.broker.publish(ProcessEvent::Spawn {
                    id: id.to_string(),
                    pid: proc.pid,
                });

                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                let supervisor = self.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    let mut pumps = Vec::new();
                    if let Some(stdout) = stdout {
                        pumps.push(tokio::spawn(pump(supervisor.clone(), id.clone(), stdout)));
                    }
                    if let Some(stderr) = stderr {
                        pumps.push(tokio::spawn(pump(supervisor.clone(), id.clone(), stderr)));
                    }
                    let (code, signal) = match child.wait().await {
                        Ok(status) => (status.code(), status.signal()),
                        Err(e) => {
                            tracing::warn!(process = %id, error = %e, "failed to wait for child");
                            (None, None)
                        }
                    };
                    let drained = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, futures::future::join_all(pumps)).await;
                    if drained.is_err() {
                        tracing::debug!(process = %id, "output pipes still open after exit");
                    }
                    supervisor.on_exit(&id, generation, code, signal);
                });
            }
            Err(e) => {
                proc.alive = false;
                proc.pid = None;
                tracing::warn!(process = %id, command = ?spec.command, error = %e, "failed to launch");
                let supervisor = self.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    supervisor.on_exit(&id, generation, Some(LAUNCH_FAILURE_CODE), None);
                });
            }
        }
    }

    fn on_exit(&self, id: &str, generation: u64, code: Option<i32>, signal: Option<i32>) {
        let relaunch_now = {
            let mut processes = self.inner.processes.lock();
            let Some(proc) = processes.get_mut(id) else {
                return;
            };
            if proc.generation != generation {
                return;
            }
            proc.alive = false;
            proc.pid = None;
            proc.exits += 1;

            match proc.status {
                ProcessStatus::Stopped => {
                    tracing::info!(process = %id, ?code, ?signal, "exited");
                    self.inner.broker.publish(ProcessEvent::Exit {
                        id: id.to_string(),
                        code,
                        signal,
                        respawning: false,
                    });
                    false
                }
                ProcessStatus::Running => {
                    proc.status = ProcessStatus::Respawning;
                    tracing::info!(process = %id, ?code, ?signal, exits = proc.exits, "exited, respawning");
                    self.inner.broker.publish(ProcessEvent::Exit {
                        id: id.to_string(),
                        code,
                        signal,
                        respawning: true,
                    });
                    let supervisor = self.clone();
                    let id = id.to_string();
                    let delay = self.inner.policy.delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        supervisor.relaunch_if_current(&id, generation);
                    });
                    false
                }
                ProcessStatus::Respawning => {
                    // Terminated by restart.
                    self.inner.broker.publish(ProcessEvent::Exit {
                        id: id.to_string(),
                        code,
                        signal,
                        respawning: true,
                    });
                    true
                }
            }
        };
        if relaunch_now {
            self.launch(id);
        }
    }

    fn relaunch_if_current(&self, id: &str, generation: u64) {
        let due = {
            let processes = self.inner.processes.lock();
            processes
                .get(id)
                .map(|p| p.generation == generation && p.status == ProcessStatus::Respawning && !p.alive)
                .unwrap_or(false)
        };
        if due {
            self.launch(id);
        }
    }

    /// SIGTERM the process group, then SIGKILL it if the same launch is
    /// still alive after [`KILL_GRACE`].
    fn terminate(&self, id: &str, generation: u64, pid: u32) {
        signal_group(pid, libc::SIGTERM);
        let supervisor = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let processes = supervisor.inner.processes.lock();
            let lingering = processes
                .get(&id)
                .map(|p| p.generation == generation && p.alive && p.pid == Some(pid))
                .unwrap_or(false);
            if lingering {
                tracing::warn!(process = %id, pid, "process ignored SIGTERM, killing");
                signal_group(pid, libc::SIGKILL);
            }
        });
    }

    fn record_output(&self, id: &str, chunk: Bytes) {
        let mut processes = self.inner.processes.lock();
        if let Some(proc) = processes.get_mut(id) {
            proc.scrollback.push(chunk.clone());
            self.inner.broker.publish(ProcessEvent::Data {
                id: id.to_string(),
                data: chunk.to_vec(),
            });
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(supervisor: Supervisor, id: String, mut reader: R) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => supervisor.record_output(&id, Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                tracing::debug!(process = %id, error = %e, "output read failed");
                break;
            }
        }
    }
}

/// Send `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: libc::c_int) {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions. Callers only pass
    // the pid of a launch whose exit has not been recorded yet.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn supervisor(delay_ms: u64) -> Supervisor {
        Supervisor::new(
            RespawnPolicy {
                delay: Duration::from_millis(delay_ms),
            },
            4096,
        )
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            repo: "webapp".into(),
            commit: "abc123".into(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            env: HashMap::new(),
            cwd: std::env::temp_dir(),
            scrollback: None,
        }
    }

    async fn next_for(rx: &mut broadcast::Receiver<ProcessEvent>, id: &str) -> ProcessEvent {
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
            if event.process_id() == Some(id) {
                return event;
            }
        }
    }

    async fn wait_for_status(sup: &Supervisor, id: &str, status: ProcessStatus) -> ProcessInfo {
        for _ in 0..500 {
            let info = sup.info(id).unwrap();
            if info.status == status {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn output_reaches_events_and_scrollback() {
        let sup = supervisor(10_000);
        let mut rx = sup.subscribe();
        let id = sup.spawn(sh("echo \"$REPO@$COMMIT\"; sleep 5")).unwrap();

        assert!(matches!(next_for(&mut rx, &id).await, ProcessEvent::Spawn { .. }));
        match next_for(&mut rx, &id).await {
            ProcessEvent::Data { data, .. } => assert_eq!(data, b"webapp@abc123\n"),
            other => panic!("unexpected event: {:?}", other),
        }
        let slice = sup.scrollback(&id, 0, 10).unwrap();
        assert_eq!(slice.chunks.concat(), b"webapp@abc123\n");
        sup.stop(&id).unwrap();
    }

    #[tokio::test]
    async fn extra_env_is_visible() {
        let sup = supervisor(10_000);
        let mut rx = sup.subscribe();
        let mut spec = sh("echo $GREETING; sleep 5");
        spec.env.insert("GREETING".into(), "beep boop".into());
        let id = sup.spawn(spec).unwrap();
        next_for(&mut rx, &id).await;
        match next_for(&mut rx, &id).await {
            ProcessEvent::Data { data, .. } => assert_eq!(data, b"beep boop\n"),
            other => panic!("unexpected event: {:?}", other),
        }
        sup.stop(&id).unwrap();
    }

    #[tokio::test]
    async fn failing_command_cycles_with_same_id() {
        let sup = supervisor(20);
        let mut rx = sup.subscribe();
        let id = sup.spawn(sh("exit 1")).unwrap();

        let mut exits = 0;
        let mut spawns = 0;
        while exits < 3 {
            match next_for(&mut rx, &id).await {
                ProcessEvent::Spawn { .. } => spawns += 1,
                ProcessEvent::Exit { code, respawning, .. } => {
                    assert_eq!(code, Some(1));
                    assert!(respawning);
                    exits += 1;
                }
                _ => {}
            }
        }
        assert!(spawns >= 3);
        assert!(sup.info(&id).unwrap().exits >= 3);
        assert_eq!(sup.ps().len(), 1);
        sup.stop(&id).unwrap();
    }

    #[tokio::test]
    async fn stop_then_restart_gives_a_new_process_under_the_same_id() {
        let sup = supervisor(10_000);
        let mut rx = sup.subscribe();
        let id = sup.spawn(sh("sleep 30")).unwrap();
        let first_pid = match next_for(&mut rx, &id).await {
            ProcessEvent::Spawn { pid, .. } => pid,
            other => panic!("unexpected event: {:?}", other),
        };

        sup.stop(&id).unwrap();
        match next_for(&mut rx, &id).await {
            ProcessEvent::Exit { respawning, .. } => assert!(!respawning),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(sup.info(&id).unwrap().status, ProcessStatus::Stopped);
        // Idempotent.
        sup.stop(&id).unwrap();

        sup.restart(&id).unwrap();
        let second_pid = match next_for(&mut rx, &id).await {
            ProcessEvent::Spawn { pid, .. } => pid,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_ne!(first_pid, second_pid);
        let info = sup.info(&id).unwrap();
        assert_eq!(info.status, ProcessStatus::Running);
        assert_eq!(info.id, id);
        sup.stop(&id).unwrap();
    }

    #[tokio::test]
    async fn restart_of_running_process_skips_the_delay() {
        let sup = supervisor(60_000);
        let mut rx = sup.subscribe();
        let id = sup.spawn(sh("sleep 30")).unwrap();
        next_for(&mut rx, &id).await;

        sup.restart(&id).unwrap();
        match next_for(&mut rx, &id).await {
            ProcessEvent::Exit { respawning, .. } => assert!(respawning),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(next_for(&mut rx, &id).await, ProcessEvent::Spawn { .. }));
        wait_for_status(&sup, &id, ProcessStatus::Running).await;
        sup.stop(&id).unwrap();
    }

    #[tokio::test]
    async fn stop_during_respawn_delay_is_final() {
        let sup = supervisor(60_000);
        let mut rx = sup.subscribe();
        let id = sup.spawn(sh("exit 3")).unwrap();
        loop {
            if let ProcessEvent::Exit { .. } = next_for(&mut rx, &id).await {
                break;
            }
        }
        wait_for_status(&sup, &id, ProcessStatus::Respawning).await;
        sup.stop(&id).unwrap();
        match next_for(&mut rx, &id).await {
            ProcessEvent::Exit { respawning, code, .. } => {
                assert!(!respawning);
                assert_eq!(code, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(sup.collect_garbage(), vec![id.clone()]);
        assert!(sup.ps().is_empty());
    }

    #[tokio::test]
    async fn missing_binary_reports_127_and_respawns() {
        let sup = supervisor(10);
        let mut rx = sup.subscribe();
        let mut spec = sh("");
        spec.command = vec!["/nonexistent/flotilla-test-binary".into()];
        let id = sup.spawn(spec).unwrap();
        match next_for(&mut rx, &id).await {
            ProcessEvent::Exit { code, respawning, .. } => {
                assert_eq!(code, Some(127));
                assert!(respawning);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        sup.stop(&id).unwrap();
    }

    #[tokio::test]
    async fn stop_kills_a_process_that_ignores_sigterm() {
        let sup = supervisor(10_000);
        let mut rx = sup.subscribe();
        let id = sup.spawn(sh("trap '' TERM; sleep 30")).unwrap();
        next_for(&mut rx, &id).await;
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        sup.stop(&id).unwrap();
        match next_for(&mut rx, &id).await {
            ProcessEvent::Exit { signal, respawning, .. } => {
                assert_eq!(signal, Some(libc::SIGKILL));
                assert!(!respawning);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(sup.info(&id).unwrap().pid, None);
    }

    #[tokio::test]
    async fn stop_before_a_failed_launch_is_reported_exits_once() {
        let sup = supervisor(10_000);
        let mut rx = sup.subscribe();
        let mut spec = sh("");
        spec.command = vec!["/nonexistent/flotilla-test-binary".into()];
        let id = sup.spawn(spec).unwrap();
        sup.stop(&id).unwrap();

        match next_for(&mut rx, &id).await {
            ProcessEvent::Exit { respawning, code, .. } => {
                assert!(!respawning);
                assert_eq!(code, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
        assert_eq!(sup.info(&id).unwrap().status, ProcessStatus::Stopped);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let sup = supervisor(10);
        assert_eq!(sup.stop("nope"), Err(SupervisorError::NoSuchProcess("nope".into())));
        assert_eq!(sup.restart("nope"), Err(SupervisorError::NoSuchProcess("nope".into())));
        assert!(sup.scrollback("nope", 0, 1).is_err());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let sup = supervisor(10);
        let mut spec = sh("");
        spec.command.clear();
        assert_eq!(sup.spawn(spec), Err(SupervisorError::EmptyCommand));
    }

    #[tokio::test]
    async fn gc_keeps_live_records() {
        let sup = supervisor(10_000);
        let mut rx = sup.subscribe();
        let id = sup.spawn(sh("sleep 30")).unwrap();
        next_for(&mut rx, &id).await;
        assert!(sup.collect_garbage().is_empty());
        sup.stop(&id).unwrap();
        next_for(&mut rx, &id).await;
        assert_eq!(sup.collect_garbage(), vec![id]);
    }
}
