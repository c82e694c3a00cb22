//! Tunnel client process supervision.
//!
//! Runs `frpc -c <config>` for one mapping, streams its merged output line by
//! line, reports the conflict signature once, and tells the owner when the
//! process exits on its own.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::signature::{conflicting_proxy, is_proxy_conflict};
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, EventBus};

/// Callbacks a supervisor invokes. Each runs at most once, on a runtime task.
pub struct SupervisorHooks {
    pub on_conflict: Box<dyn FnOnce() + Send>,
    /// The process exited without being terminated through the supervisor
    pub on_exit: Box<dyn FnOnce(Option<ExitStatus>) + Send>,
}

impl Default for SupervisorHooks {
    fn default() -> Self {
        Self {
            on_conflict: Box::new(|| {}),
            on_exit: Box::new(|_| {}),
        }
    }
}

/// Owns one running tunnel client
pub struct TunnelSupervisor {
    remote_port: u16,
    pid: Option<u32>,
    child: Arc<Mutex<Option<Child>>>,
    reaped: Arc<AtomicBool>,
    terminate_timeout: Duration,
    events: EventBus,
    _reader: JoinHandle<()>,
}

impl TunnelSupervisor {
    /// Spawn `executable -c config_path` and start reading its output.
    ///
    /// Must be called within a Tokio runtime.
    pub fn launch(
        executable: &Path,
        config_path: &Path,
        remote_port: u16,
        terminate_timeout: Duration,
        events: EventBus,
        hooks: SupervisorHooks,
    ) -> Result<Self, ConnectionError> {
        let mut cmd = Command::new(executable);
        cmd.arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        info!(
            remote_port,
            executable = %executable.display(),
            config = %config_path.display(),
            "Starting tunnel client"
        );

        let mut child = cmd.spawn().map_err(|e| {
            let reason = if e.kind() == std::io::ErrorKind::NotFound {
                anyhow!("Cannot find {}", executable.display())
            } else {
                anyhow!("Failed to run {}: {}", executable.display(), e)
            };
            events.error(Some(remote_port), format!("Failed to start {}: {}", remote_port, reason));
            ConnectionError::Spawn(reason)
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(Some(child)));
        let reaped = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(supervise_output(
            remote_port,
            stdout,
            stderr,
            Arc::clone(&child),
            Arc::clone(&reaped),
            terminate_timeout,
            events.clone(),
            hooks,
        ));

        Ok(Self {
            remote_port,
            pid,
            child,
            reaped,
            terminate_timeout,
            events,
            _reader: reader,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the supervisor still holds an unreaped process
    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Ask the process to exit, then kill it if it has not exited within the
    /// terminate timeout. Returns false if there was nothing to terminate.
    pub async fn terminate(&self) -> bool {
        let Some(mut child) = self.child.lock().await.take() else {
            return false;
        };
        let remote_port = self.remote_port;

        request_exit(&mut child, remote_port);

        match timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(remote_port, ?status, "Tunnel client exited");
            }
            Ok(Err(e)) => {
                warn!(remote_port, "Error waiting for tunnel client: {}", e);
                self.kill(&mut child).await;
            }
            Err(_) => {
                warn!(remote_port, "Tunnel client did not respond to terminate, forcing kill");
                self.events.warn(
                    Some(remote_port),
                    format!("{} did not respond to terminate, forcing kill", remote_port),
                );
                self.kill(&mut child).await;
            }
        }

        self.reaped.store(true, Ordering::SeqCst);
        true
    }

    async fn kill(&self, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            debug!(remote_port = self.remote_port, "Kill failed: {}", e);
        }
        match timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => info!(remote_port = self.remote_port, ?status, "Tunnel client killed"),
            Ok(Err(e)) => warn!(remote_port = self.remote_port, "Error reaping killed tunnel client: {}", e),
            Err(_) => warn!(remote_port = self.remote_port, "Killed tunnel client has not exited yet"),
        }
    }

    /// Kill the process without waiting. Used when a shutdown deadline passes
    /// while a graceful terminate may still be in progress.
    pub fn force_kill(&self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                if let Err(e) = child.start_kill() {
                    debug!(remote_port = self.remote_port, "Kill failed: {}", e);
                }
                return;
            }
        }

        // A terminate in progress owns the handle; signal by pid unless reaped
        #[cfg(unix)]
        {
            let Some(pid) = self.pid else {
                return;
            };
            if self.reaped.load(Ordering::SeqCst) {
                return;
            }
            // SAFETY: kill(2) has no memory-safety preconditions; the pid
            // belongs to our child and has not been reaped.
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            if ret != 0 {
                debug!(
                    remote_port = self.remote_port,
                    "SIGKILL failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

/// Request a graceful exit: SIGTERM on unix, TerminateProcess elsewhere
fn request_exit(child: &mut Child, remote_port: u16) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from our own unreaped Child handle.
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if ret != 0 {
                warn!(
                    remote_port,
                    pid,
                    "Failed to send SIGTERM: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!(remote_port, "Failed to terminate tunnel client: {}", e);
        }
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output stream error: {}", e);
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise_output<O, E>(
    remote_port: u16,
    stdout: Option<O>,
    stderr: Option<E>,
    child: Arc<Mutex<Option<Child>>>,
    reaped: Arc<AtomicBool>,
    wait_timeout: Duration,
    events: EventBus,
    hooks: SupervisorHooks,
) where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = stdout {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    let SupervisorHooks {
        on_conflict,
        on_exit,
    } = hooks;
    let mut on_conflict = Some(on_conflict);

    while let Some(line) = rx.recv().await {
        info!(remote_port, "{}", line);
        events.publish(ConnectionEvent::TunnelOutput {
            remote_port,
            line: line.clone(),
        });

        if is_proxy_conflict(&line) {
            if let Some(callback) = on_conflict.take() {
                warn!(
                    remote_port,
                    proxy = conflicting_proxy(&line).unwrap_or_default(),
                    "Remote port already taken on the tunnel server"
                );
                tokio::spawn(async move { callback() });
            }
        }
    }

    debug!(remote_port, "Tunnel client output closed");

    let status = {
        let mut guard = child.lock().await;
        let Some(process) = guard.as_mut() else {
            // Terminated through the supervisor
            return;
        };
        let status = match timeout(wait_timeout, process.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(remote_port, "Error waiting for tunnel client: {}", e);
                None
            }
            Err(_) => {
                warn!(remote_port, "Tunnel client closed its output but is still running");
                return;
            }
        };
        guard.take();
        status
    };
    reaped.store(true, Ordering::SeqCst);

    info!(remote_port, ?status, "Tunnel client exited");
    on_exit(status);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Instant;
    use tokio::sync::oneshot;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_executable_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = TunnelSupervisor::launch(
            &dir.path().join("frpc"),
            &dir.path().join("frpc.ini"),
            3389,
            Duration::from_secs(1),
            EventBus::new(),
            SupervisorHooks::default(),
        );
        assert!(matches!(result, Err(ConnectionError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_output_lines_are_published() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = script(dir.path(), "frpc", "echo \"config $2\"\necho oops >&2\nexec sleep 30");
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let supervisor = TunnelSupervisor::launch(
            &exe,
            Path::new("/tmp/frpc_22_x.ini"),
            22,
            Duration::from_secs(2),
            events,
            SupervisorHooks::default(),
        )
        .unwrap();

        let mut lines = Vec::new();
        while lines.len() < 2 {
            let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            if let ConnectionEvent::TunnelOutput { remote_port, line } = event {
                assert_eq!(remote_port, 22);
                lines.push(line);
            }
        }
        lines.sort();
        assert_eq!(lines, vec!["config /tmp/frpc_22_x.ini", "oops"]);

        assert!(supervisor.terminate().await);
        assert!(!supervisor.terminate().await);
    }

    #[tokio::test]
    async fn test_conflict_callback_fires_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = script(
            dir.path(),
            "frpc",
            "echo 'start error: proxy [3389] already exists'\n\
             echo 'start error: proxy [3389] already exists'\n\
             exec sleep 30",
        );
        let (tx, rx) = oneshot::channel();
        let hooks = SupervisorHooks {
            on_conflict: Box::new(move || {
                let _ = tx.send(());
            }),
            ..SupervisorHooks::default()
        };

        let supervisor = TunnelSupervisor::launch(
            &exe,
            Path::new("unused.ini"),
            3389,
            Duration::from_secs(2),
            EventBus::new(),
            hooks,
        )
        .unwrap();

        timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        supervisor.terminate().await;
    }

    #[tokio::test]
    async fn test_exit_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = script(dir.path(), "frpc", "echo bye\nexit 3");
        let (tx, rx) = oneshot::channel();
        let hooks = SupervisorHooks {
            on_exit: Box::new(move |status| {
                let _ = tx.send(status);
            }),
            ..SupervisorHooks::default()
        };

        let supervisor = TunnelSupervisor::launch(
            &exe,
            Path::new("unused.ini"),
            2222,
            Duration::from_secs(2),
            EventBus::new(),
            hooks,
        )
        .unwrap();

        let status = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(status.and_then(|s| s.code()), Some(3));
        assert!(!supervisor.is_running().await);
        assert!(!supervisor.terminate().await);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = script(
            dir.path(),
            "frpc",
            "trap '' TERM\necho ready\nwhile true; do sleep 0.1; done",
        );
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let supervisor = TunnelSupervisor::launch(
            &exe,
            Path::new("unused.ini"),
            5900,
            Duration::from_millis(300),
            events,
            SupervisorHooks::default(),
        )
        .unwrap();

        // Wait until the trap is installed
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            if matches!(event, ConnectionEvent::TunnelOutput { .. }) {
                break;
            }
        }

        let started = Instant::now();
        assert!(supervisor.terminate().await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!supervisor.is_running().await);
    }
}
