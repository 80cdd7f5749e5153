//! Hub, drones and an operator client wired together over loopback.
//!
//! Most of these start processes straight on a drone's supervisor and then
//! manage them through the hub. Spawning through the hub pushes a small
//! repository first, so that test needs the `git` binary.

mod common;

use std::time::Duration;

use flotilla::client::{Client, ClientError};
use flotilla::drone::Drone;
use flotilla::protocol::{
    DeployRequest, ProcessEvent, ProcessStatus, ScrollbackParams, SpawnRequest, TargetFields,
};
use flotilla::rpc::RpcError;
use flotilla::session::SessionError;

use common::*;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::test]
async fn wrong_secret_is_denied_and_never_registered() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(dir.path()).await;

        let result = Client::connect(&hub_address(&hub), "wrong").await;
        assert!(matches!(result, Err(ClientError::AuthDenied(reason)) if reason == "ACCESS DENIED"));

        let mut config = drone_config(&hub, dir.path(), "intruder");
        config.secret = "wrong".into();
        let drone = Drone::start(config);
        drone.session().closed().await;
        assert_eq!(drone.session().failure(), SessionError::Denied("ACCESS DENIED".into()));
        assert!(hub.registry().is_empty());

        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn disconnecting_a_drone_removes_exactly_that_drone() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let a = start_drone(&hub, &dir.path().join("a"), "a").await;
        let b = start_drone(&hub, &dir.path().join("b"), "b").await;
        let c = start_drone(&hub, &dir.path().join("c"), "c").await;
        assert_eq!(hub.registry().len(), 3);

        b.shutdown().await;
        let registry = hub.registry().clone();
        wait_for("drone b removal", || registry.len() == 2).await;
        let mut left: Vec<String> = registry.list().into_iter().map(|e| e.identity).collect();
        left.sort();
        assert_eq!(left, vec!["a", "c"]);

        a.shutdown().await;
        c.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn duplicate_identity_never_leaves_a_live_drone_unlisted() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let first = start_drone(&hub, &dir.path().join("first"), "twin").await;
        let registry = hub.registry().clone();
        let hostname_is = |registry: &flotilla::hub::DroneRegistry, name: &str| {
            registry
                .get("twin")
                .map(|e| e.hostname.as_deref() == Some(name))
                .unwrap_or(false)
        };

        let mut config = drone_config(&hub, &dir.path().join("second"), "twin");
        config.hostname = Some("second-host".into());
        let second = Drone::start(config);
        wait_for("second drone takeover", || hostname_is(&registry, "second-host")).await;
        assert_eq!(registry.len(), 1);

        second.shutdown().await;
        wait_for("first drone back in the registry", || hostname_is(&registry, "twin-host")).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(registry.len(), 1);
        assert!(hostname_is(&registry, "twin-host"));

        first.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn drones_lists_hostnames_and_capabilities() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let drone = start_drone(&hub, &dir.path().join("d"), "d1").await;
        let client = connect_client(&hub).await;

        let drones = client.drones().await.unwrap();
        assert_eq!(drones.len(), 1);
        assert_eq!(drones[0].identity, "d1");
        assert_eq!(drones[0].hostname.as_deref(), Some("d1-host"));
        for method in ["deploy", "fetch", "ps", "spawn", "stop"] {
            assert!(drones[0].capabilities.iter().any(|c| c == method), "missing {}", method);
        }

        client.close().await;
        drone.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn unknown_targets_complete_vacuously() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let drone = start_drone(&hub, &dir.path().join("d"), "d1").await;
        let client = connect_client(&hub).await;

        let report = client
            .deploy(DeployRequest {
                repo: "webapp".into(),
                commit: "abc123".into(),
                target: TargetFields {
                    drone: Some("ghost".into()),
                    drones: None,
                },
            })
            .await
            .unwrap();
        assert!(report.results.is_empty());

        let mut events = client.spawn(SpawnRequest {
            repo: "webapp".into(),
            commit: "abc123".into(),
            command: vec!["true".into()],
            env: Default::default(),
            scrollback: None,
            target: TargetFields {
                drone: None,
                drones: Some(vec!["ghost".into(), "phantom".into()]),
            },
        });
        assert!(events.next().await.is_none());
        assert!(drone.supervisor().ps().is_empty());

        client.close().await;
        drone.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_streams_output_and_exit_through_the_hub() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let drone = start_drone(&hub, &dir.path().join("d"), "d1").await;
        let client = connect_client(&hub).await;
        let commit = push_webapp(&dir.path().join("src"), hub.git_addr().port());

        let mut events = client.spawn(SpawnRequest {
            repo: "webapp".into(),
            commit,
            command: vec!["sh".into(), "-c".into(), "echo hi; exit 3".into()],
            env: Default::default(),
            scrollback: None,
            target: TargetFields {
                drone: Some("d1".into()),
                drones: None,
            },
        });

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.drone, "d1");
        let id = match first.event {
            ProcessEvent::Spawn { id, .. } => id,
            other => panic!("expected spawn, got {:?}", other),
        };

        let mut output = Vec::new();
        loop {
            match events.next().await.unwrap().unwrap().event {
                ProcessEvent::Data { data, .. } => output.extend_from_slice(&data),
                ProcessEvent::Exit {
                    id: exited,
                    code,
                    respawning,
                    ..
                } => {
                    assert_eq!(exited, id);
                    assert_eq!(code, Some(3));
                    assert!(respawning);
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(String::from_utf8_lossy(&output), "hi\n");

        // The same record comes back up after the respawn delay.
        loop {
            match events.next().await.unwrap().unwrap().event {
                ProcessEvent::Spawn { id: respawned, .. } => {
                    assert_eq!(respawned, id);
                    break;
                }
                ProcessEvent::Data { .. } | ProcessEvent::Exit { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }

        client.stop("d1", &id).await.unwrap();
        loop {
            match events.next().await {
                Some(Ok(event)) => {
                    if let ProcessEvent::Exit { respawning: false, .. } = event.event {
                        break;
                    }
                }
                other => panic!("stream ended before the final exit: {:?}", other.map(|r| r.is_ok())),
            }
        }
        assert!(events.next().await.is_none());
        assert_eq!(drone.supervisor().info(&id).unwrap().status, ProcessStatus::Stopped);

        client.close().await;
        drone.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn stop_and_restart_through_the_hub() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let drone = start_drone(&hub, &dir.path().join("d"), "d1").await;
        let client = connect_client(&hub).await;

        let id = drone
            .supervisor()
            .spawn(shell_spec(dir.path(), "sleep 30"))
            .unwrap();
        let supervisor = drone.supervisor().clone();
        wait_for("first launch", || supervisor.info(&id).map(|i| i.pid.is_some()).unwrap_or(false)).await;
        let first_pid = supervisor.info(&id).unwrap().pid;

        let info = client.stop("d1", &id).await.unwrap();
        assert_eq!(info.status, ProcessStatus::Stopped);

        let mut records = client.ps();
        let record = records.next().await.unwrap().unwrap();
        assert_eq!(record.drone, "d1");
        assert_eq!(record.processes.len(), 1);
        assert_eq!(record.processes[0].status, ProcessStatus::Stopped);
        assert!(records.next().await.is_none());

        wait_for("stopped process exit", || supervisor.info(&id).map(|i| i.pid.is_none()).unwrap_or(false)).await;
        let info = client.restart("d1", &id).await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.status, ProcessStatus::Running);
        wait_for("relaunch", || supervisor.info(&id).map(|i| i.pid.is_some()).unwrap_or(false)).await;
        assert_ne!(supervisor.info(&id).unwrap().pid, first_pid);

        client.stop("d1", &id).await.unwrap();
        client.close().await;
        drone.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn process_errors_are_reported_to_the_operator() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let drone = start_drone(&hub, &dir.path().join("d"), "d1").await;
        let client = connect_client(&hub).await;

        let err = client.stop("d1", "0000000000000000").await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc(RpcError::NoSuchProcess(id)) if id == "0000000000000000"));

        let err = client.restart("nobody", "0000000000000000").await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc(RpcError::NoSuchDrone(name)) if name == "nobody"));

        client.close().await;
        drone.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn logs_and_gc_through_the_hub() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let drone = start_drone(&hub, &dir.path().join("d"), "d1").await;
        let client = connect_client(&hub).await;

        let id = drone
            .supervisor()
            .spawn(shell_spec(dir.path(), "echo beep boop; sleep 30"))
            .unwrap();
        let supervisor = drone.supervisor().clone();
        wait_for("output", || {
            supervisor.info(&id).map(|i| i.scrollback_bytes > 0).unwrap_or(false)
        })
        .await;

        let slice = client
            .scrollback(
                "d1",
                ScrollbackParams {
                    id: id.clone(),
                    offset: 0,
                    limit: 100,
                },
            )
            .await
            .unwrap();
        let text: Vec<u8> = slice.chunks.concat();
        assert_eq!(String::from_utf8_lossy(&text), "beep boop\n");

        client.stop("d1", &id).await.unwrap();
        wait_for("exit after stop", || supervisor.info(&id).map(|i| i.pid.is_none()).unwrap_or(false)).await;

        let records = client.gc(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].removed, vec![id]);
        assert!(drone.supervisor().ps().is_empty());

        client.close().await;
        drone.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn drone_reconnects_after_hub_restart_with_same_identity() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let hub = start_hub(&dir.path().join("hub")).await;
        let port = hub.control_addr().port();
        let drone = start_drone(&hub, &dir.path().join("d"), "steady").await;
        hub.shutdown().await;

        // Bring a hub back on the same control port.
        let mut config = flotilla::hub::HubConfig::new(SECRET, dir.path().join("hub"));
        config.bind = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        config.control_port = port;
        config.git_port = 0;
        let hub = flotilla::hub::Hub::start(config).await.unwrap();
        let registry = hub.registry().clone();
        wait_for("re-registration", || registry.get("steady").is_some()).await;

        drone.shutdown().await;
        hub.shutdown().await;
    })
    .await
    .unwrap();
}
