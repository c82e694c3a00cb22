//! Tests for mapping lifecycle against a scripted tunnel client
#![cfg(unix)]

use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use remote_console::bridge::ChannelOpener;
use remote_console::connection::{derive_bridge_port, LocalTarget, StopOutcome};
use remote_console::{Config, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionStatus, ServerSettings};

const LONG_RUNNING: &str = "echo \"login to server success\"\nexec sleep 30";
const IGNORES_TERM: &str = "trap '' TERM\necho ready\nwhile true; do sleep 0.1; done";

struct Harness {
    dir: TempDir,
    manager: ConnectionManager,
    opener: Arc<ChannelOpener>,
}

impl Harness {
    fn new(script: Option<&str>) -> Self {
        Self::with_config(script, |_| {})
    }

    fn with_config(script: Option<&str>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir(&artifacts).unwrap();

        let executable = match script {
            Some(body) => fake_frpc(dir.path(), body),
            None => dir.path().join("frpc-not-installed"),
        };

        let mut config = Config::default();
        config.tunnel.executable = executable;
        config.tunnel.artifact_dir = Some(artifacts);
        config.tunnel.terminate_timeout = Duration::from_secs(1);
        config.bridge.bind_host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.bridge.read_timeout = Duration::from_millis(20);
        config.bridge.socket_timeout = Duration::from_millis(50);
        config.shutdown.poll_interval = Duration::from_millis(50);
        config.shutdown.timeout = Duration::from_secs(3);
        tweak(&mut config);

        let server = ServerSettings {
            addr: "203.0.113.7".to_string(),
            port: 7000,
            token: "test-token".to_string(),
        };
        let opener = Arc::new(ChannelOpener::new());
        let manager = ConnectionManager::with_opener(Arc::new(config), server, opener.clone());

        Self { dir, manager, opener }
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.dir.path().join("artifacts"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    async fn wait_for_status(&self, remote_port: u16, status: ConnectionStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.manager.status(remote_port).await != Some(status) {
            assert!(Instant::now() < deadline, "{} never reached {}", remote_port, status);
            sleep(Duration::from_millis(20)).await;
        }
    }
}

fn fake_frpc(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("frpc");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn next_output(rx: &mut broadcast::Receiver<ConnectionEvent>, remote_port: u16) -> String {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        if let ConnectionEvent::TunnelOutput { remote_port: port, line } = event {
            if port == remote_port {
                return line;
            }
        }
    }
}

#[tokio::test]
async fn test_tcp_mapping_start_stop_restart() {
    let h = Harness::new(Some(LONG_RUNNING));
    let mut rx = h.manager.subscribe();

    h.manager.add_tcp("127.0.0.1", 22, 2222).await.unwrap();
    assert_eq!(h.manager.status(2222).await, Some(ConnectionStatus::Running));
    assert_eq!(next_output(&mut rx, 2222).await, "login to server success");

    let info = h.manager.get_info(2222).await.unwrap();
    assert!(info.pid.is_some());
    assert_eq!(
        info.target,
        LocalTarget::Tcp {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 22,
        }
    );

    let artifacts = h.artifacts();
    assert_eq!(artifacts.len(), 1);
    let content = std::fs::read_to_string(&artifacts[0]).unwrap();
    assert!(content.contains("server_addr = 203.0.113.7\n"));
    assert!(content.contains("[proxy_2222]\n"));

    // Starting a running mapping changes nothing
    h.manager.start(2222).await.unwrap();
    assert_eq!(h.artifacts(), artifacts);

    h.manager.stop(2222).await.unwrap().wait().await;
    assert_eq!(h.manager.status(2222).await, Some(ConnectionStatus::Stopped));
    assert!(matches!(
        h.manager.stop(2222).await.unwrap(),
        StopOutcome::AlreadyStopped
    ));

    // A restart writes a fresh artifact and drops the old one
    h.manager.start(2222).await.unwrap();
    assert_eq!(h.manager.status(2222).await, Some(ConnectionStatus::Running));
    let restarted = h.artifacts();
    assert_eq!(restarted.len(), 1);
    assert_ne!(restarted, artifacts);

    h.manager.remove(2222).await.unwrap().wait().await;
    assert!(h.manager.list().await.is_empty());
    assert!(h.artifacts().is_empty());
}

#[tokio::test]
async fn test_serial_mapping_forwards_through_bridge() {
    let h = Harness::new(Some(LONG_RUNNING));
    let end = h.opener.attach("ttyFAKE0");

    h.manager.add_serial("ttyFAKE0", 9600, 48765).await.unwrap();
    let info = h.manager.get_info(48765).await.unwrap();
    assert_eq!(
        info.target,
        LocalTarget::Serial {
            device: "ttyFAKE0".to_string(),
            baud_rate: 9600,
            bridge_port: 20765,
        }
    );

    let content = std::fs::read_to_string(&h.artifacts()[0]).unwrap();
    assert!(content.contains("local_ip = 127.0.0.1\n"));
    assert!(content.contains("local_port = 20765\n"));
    assert!(content.contains("remote_port = 48765\n"));

    let mut client = tokio::net::TcpStream::connect(("127.0.0.1", 20765)).await.unwrap();
    client.write_all(b"AT\r\n").await.unwrap();
    let (end, received) = tokio::task::spawn_blocking(move || {
        let bytes = end.recv_bytes(4, Duration::from_secs(3));
        (end, bytes)
    })
    .await
    .unwrap();
    assert_eq!(received, b"AT\r\n");
    drop(client);
    drop(end);

    h.manager.stop(48765).await.unwrap().wait().await;
    assert_eq!(h.opener.handle_count("ttyFAKE0"), 1);
}

#[tokio::test]
async fn test_missing_executable_releases_bridge() {
    let h = Harness::new(None);
    let _end = h.opener.attach("ttyFAKE1");

    let result = h.manager.add_serial("ttyFAKE1", 115200, 3001).await;
    assert!(matches!(result, Err(ConnectionError::Spawn(_))));
    assert_eq!(h.manager.status(3001).await, Some(ConnectionStatus::Stopped));

    assert_eq!(h.opener.handle_count("ttyFAKE1"), 1);
    let bridge = &h.manager.config().bridge;
    let bridge_port = derive_bridge_port(3001, bridge.port_base, bridge.port_span);
    assert_eq!(bridge_port, 20001);
    assert!(std::net::TcpListener::bind(("127.0.0.1", bridge_port)).is_ok());

    // Retrying fails the same way without leaking anything
    assert!(h.manager.start(3001).await.is_err());
    assert_eq!(h.opener.handle_count("ttyFAKE1"), 1);
    assert_eq!(h.artifacts().len(), 1);
}

#[tokio::test]
async fn test_missing_serial_device_keeps_mapping_stopped() {
    let h = Harness::new(Some(LONG_RUNNING));

    let result = h.manager.add_serial("ttyGONE", 9600, 3002).await;
    assert!(matches!(result, Err(ConnectionError::SerialOpen { .. })));
    assert_eq!(h.manager.status(3002).await, Some(ConnectionStatus::Stopped));
    assert!(h.artifacts().is_empty());
}

#[tokio::test]
async fn test_conflict_removes_mapping() {
    let h = Harness::new(Some(
        "echo '[W] [proxy_3389] start error: proxy [3389] already exists'\nexec sleep 30",
    ));
    let mut rx = h.manager.subscribe();

    let _ = h.manager.add_tcp("192.168.1.20", 3389, 3389).await;

    let mut saw_conflict = false;
    let mut saw_removed = false;
    while !(saw_conflict && saw_removed) {
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
            ConnectionEvent::Conflict { remote_port: 3389 } => saw_conflict = true,
            ConnectionEvent::Removed { remote_port: 3389 } => saw_removed = true,
            _ => {}
        }
    }

    assert!(h.manager.list().await.is_empty());
    assert_eq!(h.manager.status(3389).await, None);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !h.artifacts().is_empty() {
        assert!(Instant::now() < deadline, "artifact was not deleted");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_exited_client_marks_mapping_stopped() {
    let h = Harness::new(Some("echo 'login failed'\nexit 1"));

    let _ = h.manager.add_tcp("127.0.0.1", 23, 2323).await;
    h.wait_for_status(2323, ConnectionStatus::Stopped).await;

    // The record stays and can be started again
    assert_eq!(h.manager.list().await.len(), 1);
    assert!(h.manager.get_info(2323).await.unwrap().pid.is_none());
}

#[tokio::test]
async fn test_stop_does_not_block_and_serializes_with_start() {
    let h = Harness::new(Some(IGNORES_TERM));
    let mut rx = h.manager.subscribe();

    h.manager.add_tcp("127.0.0.1", 5900, 5900).await.unwrap();
    assert_eq!(next_output(&mut rx, 5900).await, "ready");

    let requested = Instant::now();
    let outcome = h.manager.stop(5900).await.unwrap();
    assert!(requested.elapsed() < Duration::from_millis(500));

    // Queued behind the teardown, which needs the 1s terminate timeout
    h.manager.start(5900).await.unwrap();
    assert!(requested.elapsed() >= Duration::from_secs(1));
    outcome.wait().await;
    assert_eq!(h.manager.status(5900).await, Some(ConnectionStatus::Running));

    let report = h.manager.shutdown_all().await;
    assert!(report.elapsed < Duration::from_secs(4));
}

#[tokio::test]
async fn test_shutdown_all_stops_everything_and_cleans_up() {
    let h = Harness::new(Some(LONG_RUNNING));
    let _end = h.opener.attach("ttyFAKE2");

    h.manager.add_tcp("127.0.0.1", 22, 2201).await.unwrap();
    h.manager.add_tcp("127.0.0.1", 80, 8001).await.unwrap();
    h.manager.add_serial("ttyFAKE2", 9600, 49001).await.unwrap();
    assert_eq!(h.artifacts().len(), 3);

    let report = h.manager.shutdown_all().await;
    assert!(report.is_clean());
    assert_eq!(report.stopped, vec![2201, 8001, 49001]);
    assert!(report.elapsed < Duration::from_secs(3));

    for info in h.manager.list().await {
        assert_eq!(info.status, ConnectionStatus::Stopped);
    }
    assert!(h.artifacts().is_empty());
    assert_eq!(h.opener.handle_count("ttyFAKE2"), 1);
    assert!(matches!(
        h.manager.start(2201).await,
        Err(ConnectionError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_shutdown_all_is_bounded_with_stubborn_clients() {
    let h = Harness::with_config(Some(IGNORES_TERM), |config| {
        config.tunnel.terminate_timeout = Duration::from_secs(5);
        config.shutdown.timeout = Duration::from_millis(800);
    });
    let mut rx = h.manager.subscribe();

    for port in [6001u16, 6002, 6003] {
        h.manager.add_tcp("127.0.0.1", 22, port as u32).await.unwrap();
        assert_eq!(next_output(&mut rx, port).await, "ready");
    }

    let report = h.manager.shutdown_all().await;
    assert!(report.elapsed >= Duration::from_millis(800));
    assert!(report.elapsed < Duration::from_secs(2));
    let mut abandoned = report.abandoned.clone();
    abandoned.sort_unstable();
    assert_eq!(abandoned, vec![6001, 6002, 6003]);
    assert!(h.artifacts().is_empty());

    // The forced kill lets the pending stops finish
    for port in [6001u16, 6002, 6003] {
        h.wait_for_status(port, ConnectionStatus::Stopped).await;
    }
}
