#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use flotilla::client::Client;
use flotilla::drone::{Drone, DroneConfig, LaunchSpec};
use flotilla::hub::{Hub, HubConfig};

pub const SECRET: &str = "s3cret";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Start a hub on loopback with ephemeral ports.
pub async fn start_hub(basedir: &Path) -> Hub {
    let mut config = HubConfig::new(SECRET, basedir);
    config.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.control_port = 0;
    config.git_port = 0;
    config.hostname = Some("test-hub".into());
    Hub::start(config).await.expect("hub should start")
}

pub fn hub_address(hub: &Hub) -> String {
    format!("127.0.0.1:{}", hub.control_addr().port())
}

pub fn drone_config(hub: &Hub, basedir: &Path, identity: &str) -> DroneConfig {
    DroneConfig {
        hub: hub_address(hub),
        secret: SECRET.to_string(),
        basedir: basedir.to_path_buf(),
        identity: Some(identity.to_string()),
        hostname: Some(format!("{}-host", identity)),
        reconnect_interval: Duration::from_millis(100),
        respawn_delay: Duration::from_millis(100),
        scrollback_bytes: 4096,
    }
}

/// Start a drone and wait until the hub lists it.
pub async fn start_drone(hub: &Hub, basedir: &Path, identity: &str) -> Drone {
    let drone = Drone::start(drone_config(hub, basedir, identity));
    let registry = hub.registry().clone();
    let identity = identity.to_string();
    wait_for("drone registration", || registry.get(&identity).is_some()).await;
    drone
}

pub async fn connect_client(hub: &Hub) -> Client {
    Client::connect(&hub_address(hub), SECRET)
        .await
        .expect("client should connect")
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=flotilla", "-c", "user.email=flotilla@localhost"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a one-commit repository serving `index.html` and push it to the
/// hub as `webapp`. Returns the commit id.
pub fn push_webapp(workdir: &Path, git_port: u16) -> String {
    std::fs::create_dir_all(workdir).unwrap();
    git(workdir, &["init", "-q"]);
    std::fs::write(workdir.join("index.html"), "beep boop").unwrap();
    git(workdir, &["add", "index.html"]);
    git(workdir, &["commit", "-q", "-m", "initial"]);
    let commit = git(workdir, &["rev-parse", "HEAD"]);
    let remote = format!("http://127.0.0.1:{}/webapp", git_port);
    git(workdir, &["push", "-q", &remote, "HEAD:refs/heads/main"]);
    commit
}

/// A spec running `sh -c script` from `cwd`, for driving a drone's
/// supervisor without a git checkout.
pub fn shell_spec(cwd: &Path, script: &str) -> LaunchSpec {
    LaunchSpec {
        repo: "webapp".into(),
        commit: "abc123".into(),
        command: vec!["sh".into(), "-c".into(), script.into()],
        env: HashMap::new(),
        cwd: cwd.to_path_buf(),
        scrollback: None,
    }
}

/// Poll `check` until it holds, panicking after a timeout.
pub async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("timed out waiting for {}", what);
}
