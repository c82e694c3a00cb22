//! Connection Manager Implementation
//!
//! Owns every mapping, drives its `Stopped → Starting → Running → Stopping →
//! Stopped` lifecycle and wires the serial bridge, config writer and tunnel
//! supervisor together.

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::types::{
    check_remote_port, derive_bridge_port, ConnectionInfo, ConnectionStatus, LocalTarget, MappingRequest,
};
use crate::bridge::{BridgeSettings, SerialBridge, SerialOpener, SystemSerialOpener};
use crate::config::{Config, ServerSettings};
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, EventBus};
use crate::tunnel::{ConfigArtifact, ConfigWriter, ProxySpec, SupervisorHooks, TunnelSupervisor};

/// Lock a std mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resources touched only while holding the connection's operation guard
#[derive(Default)]
struct Resources {
    bridge: Option<SerialBridge>,
    /// Bumped on every start so exit reports from older processes are ignored
    generation: u64,
}

/// One logical mapping
struct Connection {
    remote_port: u16,
    target: LocalTarget,
    status: Mutex<ConnectionStatus>,
    /// Held across every start and stop
    resources: Arc<tokio::sync::Mutex<Resources>>,
    /// Readable without the guard so shutdown can force-kill a stuck stop
    supervisor: Mutex<Option<Arc<TunnelSupervisor>>>,
    artifact: Mutex<Option<ConfigArtifact>>,
    removed: AtomicBool,
    events: EventBus,
}

impl Connection {
    fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *lock(&self.status), status);
        if previous != status {
            debug!(remote_port = self.remote_port, %previous, %status, "Status changed");
            self.events.publish(ConnectionEvent::StatusChanged {
                remote_port: self.remote_port,
                status,
            });
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote_port: self.remote_port,
            target: self.target.clone(),
            status: self.status(),
            pid: lock(&self.supervisor).as_ref().and_then(|s| s.pid()),
        }
    }

    /// Stop the bridge, then terminate the tunnel client
    async fn teardown(&self, resources: &mut Resources) {
        let remote_port = self.remote_port;
        self.set_status(ConnectionStatus::Stopping);

        if let Some(mut bridge) = resources.bridge.take() {
            bridge.stop().await;
        }

        let supervisor = lock(&self.supervisor).clone();
        if let Some(supervisor) = supervisor {
            if supervisor.terminate().await {
                info!(remote_port, "Tunnel client terminated");
            }
            lock(&self.supervisor).take();
        }

        self.set_status(ConnectionStatus::Stopped);
        self.events.info(Some(remote_port), format!("{} stopped", remote_port));
    }

    /// Take the operation guard now if it is free, so a stop requested
    /// before a start is also performed before it
    fn reserve(&self) -> Option<OwnedMutexGuard<Resources>> {
        Arc::clone(&self.resources).try_lock_owned().ok()
    }

    async fn stop_with(&self, reserved: Option<OwnedMutexGuard<Resources>>) {
        let mut resources = match reserved {
            Some(guard) => guard,
            None => Arc::clone(&self.resources).lock_owned().await,
        };
        if self.status() == ConnectionStatus::Stopped && resources.bridge.is_none() {
            return;
        }
        self.teardown(&mut resources).await;
    }

    /// The tunnel client of `generation` exited on its own
    async fn on_exited(&self, generation: u64, status: Option<ExitStatus>) {
        let mut resources = self.resources.lock().await;
        if resources.generation != generation || lock(&self.supervisor).is_none() {
            debug!(remote_port = self.remote_port, "Ignoring exit of a replaced tunnel client");
            return;
        }

        let remote_port = self.remote_port;
        let detail = status.map_or_else(|| "unknown status".to_string(), |s| s.to_string());
        warn!(remote_port, "Tunnel client exited unexpectedly: {}", detail);
        self.events.warn(
            Some(remote_port),
            format!("Tunnel client for {} exited ({})", remote_port, detail),
        );

        lock(&self.supervisor).take();
        if let Some(mut bridge) = resources.bridge.take() {
            bridge.stop().await;
        }
        self.set_status(ConnectionStatus::Stopped);
    }

    fn delete_artifact(&self) {
        let Some(artifact) = lock(&self.artifact).take() else {
            return;
        };
        let path = artifact.path().display().to_string();
        match artifact.delete() {
            Ok(()) => {
                debug!(remote_port = self.remote_port, "Deleted temp config {}", path);
                self.events.info(Some(self.remote_port), format!("Deleted temp config: {}", path));
            }
            Err(e) => {
                warn!(remote_port = self.remote_port, "Failed to delete temp config {}: {}", path, e);
                self.events.warn(
                    Some(self.remote_port),
                    format!("Failed to delete temp config {}: {}", path, e),
                );
            }
        }
    }

    fn force_kill(&self) {
        if let Some(supervisor) = lock(&self.supervisor).as_ref() {
            warn!(remote_port = self.remote_port, "Forcing tunnel client termination");
            supervisor.force_kill();
        }
    }
}

/// Result of a stop or remove request
#[derive(Debug)]
pub enum StopOutcome {
    /// Nothing was running
    AlreadyStopped,
    /// Teardown continues in the background
    Stopping(JoinHandle<()>),
}

impl StopOutcome {
    /// Wait for the background teardown, if any
    pub async fn wait(self) {
        if let StopOutcome::Stopping(task) = self {
            if let Err(e) = task.await {
                warn!("Stop task failed: {}", e);
            }
        }
    }
}

/// What `shutdown_all` managed to do
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub stopped: Vec<u16>,
    /// Still not stopped at the deadline; their processes were killed
    pub abandoned: Vec<u16>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

struct Inner {
    config: Arc<Config>,
    server: ServerSettings,
    writer: ConfigWriter,
    opener: Arc<dyn SerialOpener>,
    events: EventBus,
    connections: RwLock<HashMap<u16, Arc<Connection>>>,
    shutting_down: AtomicBool,
}

/// Manages tunnel mappings and their lifecycle
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager using the system serial ports
    pub fn new(config: Arc<Config>, server: ServerSettings) -> Self {
        Self::with_opener(config, server, Arc::new(SystemSerialOpener))
    }

    /// Create a ConnectionManager with a custom serial device opener
    pub fn with_opener(config: Arc<Config>, server: ServerSettings, opener: Arc<dyn SerialOpener>) -> Self {
        let writer = ConfigWriter::new(config.tunnel.artifact_dir.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                server,
                writer,
                opener,
                events: EventBus::new(),
                connections: RwLock::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn server(&self) -> &ServerSettings {
        &self.inner.server
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Address users connect to for a public port
    pub fn public_address(&self, remote_port: u16) -> String {
        self.inner.server.public_address(remote_port)
    }

    /// Register a serial mapping and start it.
    ///
    /// A failed start leaves the mapping registered as `Stopped` and returns
    /// the error.
    pub async fn add_serial(&self, device: &str, baud_rate: u32, remote_port: u32) -> Result<(), ConnectionError> {
        self.add_mapping(&MappingRequest::Serial {
            device: device.to_string(),
            baud_rate,
            remote_port,
        })
        .await
    }

    /// Register a TCP mapping and start it
    pub async fn add_tcp(&self, ip: &str, port: u32, remote_port: u32) -> Result<(), ConnectionError> {
        self.add_mapping(&MappingRequest::Tcp {
            ip: ip.to_string(),
            port,
            remote_port,
        })
        .await
    }

    pub async fn add_mapping(&self, request: &MappingRequest) -> Result<(), ConnectionError> {
        let (remote_port, target) = self.resolve(request)?;
        self.add(remote_port, target).await
    }

    /// Render the tunnel configuration a request would produce, without
    /// registering or starting anything
    pub fn preview(&self, request: &MappingRequest) -> Result<String, ConnectionError> {
        let (remote_port, target) = self.resolve(request)?;
        Ok(ConfigWriter::render(
            &self.inner.server,
            &ProxySpec {
                remote_port,
                local_ip: target.local_ip(),
                local_port: target.local_port(),
            },
        ))
    }

    /// Validate a request before any resource is touched
    fn resolve(&self, request: &MappingRequest) -> Result<(u16, LocalTarget), ConnectionError> {
        match request {
            MappingRequest::Serial {
                device,
                baud_rate,
                remote_port,
            } => {
                let remote_port = self.validate_remote_port(*remote_port, "serial")?;
                let device = device.trim();
                if device.is_empty() {
                    return Err(self.rejected(ConnectionError::MissingField("serial device")));
                }
                if *baud_rate == 0 {
                    return Err(self.rejected(ConnectionError::InvalidInput {
                        field: "baud rate",
                        value: baud_rate.to_string(),
                    }));
                }

                let bridge = &self.inner.config.bridge;
                let target = LocalTarget::Serial {
                    device: device.to_string(),
                    baud_rate: *baud_rate,
                    bridge_port: derive_bridge_port(remote_port, bridge.port_base, bridge.port_span),
                };
                Ok((remote_port, target))
            }
            MappingRequest::Tcp {
                ip,
                port,
                remote_port,
            } => {
                let remote_port = self.validate_remote_port(*remote_port, "TCP")?;
                let ip = ip.trim();
                if ip.is_empty() {
                    return Err(self.rejected(ConnectionError::MissingField("local ip")));
                }
                let ip: IpAddr = ip.parse().map_err(|_| {
                    self.rejected(ConnectionError::InvalidInput {
                        field: "local ip",
                        value: ip.to_string(),
                    })
                })?;
                let port = check_remote_port(*port).ok_or_else(|| {
                    self.rejected(ConnectionError::InvalidInput {
                        field: "local port",
                        value: port.to_string(),
                    })
                })?;
                Ok((remote_port, LocalTarget::Tcp { ip, port }))
            }
        }
    }

    fn validate_remote_port(&self, remote_port: u32, kind: &str) -> Result<u16, ConnectionError> {
        check_remote_port(remote_port).ok_or_else(|| {
            self.inner.events.warn(
                None,
                format!(
                    "Failed to add {} mapping: public port {} invalid.",
                    kind, remote_port
                ),
            );
            ConnectionError::InvalidRemotePort(remote_port)
        })
    }

    fn rejected(&self, error: ConnectionError) -> ConnectionError {
        warn!("Rejected mapping: {}", error);
        self.inner.events.warn(None, error.to_string());
        error
    }

    async fn add(&self, remote_port: u16, target: LocalTarget) -> Result<(), ConnectionError> {
        let connection = {
            let mut connections = self.inner.connections.write().await;
            // Checked under the lock so shutdown_all's snapshot sees every insert
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(ConnectionError::ShuttingDown);
            }
            if connections.contains_key(&remote_port) {
                return Err(self.rejected(ConnectionError::DuplicateRemotePort(remote_port)));
            }

            if let LocalTarget::Serial { bridge_port, .. } = &target {
                let taken_by = connections.values().find(|c| {
                    matches!(&c.target, LocalTarget::Serial { bridge_port: other, .. } if other == bridge_port)
                });
                if let Some(existing) = taken_by {
                    return Err(self.rejected(ConnectionError::BridgePortCollision {
                        remote_port,
                        bridge_port: *bridge_port,
                        existing: existing.remote_port,
                    }));
                }
            }

            let connection = Arc::new(Connection {
                remote_port,
                target,
                status: Mutex::new(ConnectionStatus::Stopped),
                resources: Arc::new(tokio::sync::Mutex::new(Resources::default())),
                supervisor: Mutex::new(None),
                artifact: Mutex::new(None),
                removed: AtomicBool::new(false),
                events: self.inner.events.clone(),
            });
            connections.insert(remote_port, Arc::clone(&connection));
            connection
        };

        info!(remote_port, target = %connection.target, "Added mapping");
        self.start_connection(&connection).await
    }

    async fn lookup(&self, remote_port: u16) -> Result<Arc<Connection>, ConnectionError> {
        self.inner
            .connections
            .read()
            .await
            .get(&remote_port)
            .cloned()
            .ok_or(ConnectionError::NotFound(remote_port))
    }

    /// Start a stopped mapping. Starting a running one only reports it.
    pub async fn start(&self, remote_port: u16) -> Result<(), ConnectionError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ConnectionError::ShuttingDown);
        }
        let connection = self.lookup(remote_port).await?;
        self.start_connection(&connection).await
    }

    #[instrument(skip(self, connection), fields(remote_port = connection.remote_port))]
    async fn start_connection(&self, connection: &Arc<Connection>) -> Result<(), ConnectionError> {
        let remote_port = connection.remote_port;
        let mut resources = connection.resources.lock().await;

        if connection.removed.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotFound(remote_port));
        }
        if connection.status() == ConnectionStatus::Running {
            info!(remote_port, "Already running");
            self.inner
                .events
                .info(Some(remote_port), format!("{} already running", remote_port));
            return Ok(());
        }

        connection.set_status(ConnectionStatus::Starting);
        self.inner
            .events
            .info(Some(remote_port), format!("Starting {}", remote_port));
        resources.generation += 1;
        let generation = resources.generation;

        match self.acquire(connection, &mut resources, generation).await {
            Ok(supervisor) => {
                *lock(&connection.supervisor) = Some(Arc::new(supervisor));
                connection.set_status(ConnectionStatus::Running);
                info!(remote_port, "Mapping running");
                Ok(())
            }
            Err(e) => {
                warn!(remote_port, "Failed to start: {}", e);
                self.inner
                    .events
                    .error(Some(remote_port), format!("Failed to start {}: {}", remote_port, e));
                if let Some(mut bridge) = resources.bridge.take() {
                    bridge.stop().await;
                }
                connection.set_status(ConnectionStatus::Stopped);
                Err(e)
            }
        }
    }

    /// Bring up bridge, artifact and tunnel client. On error the caller
    /// releases whatever was left in `resources`.
    async fn acquire(
        &self,
        connection: &Arc<Connection>,
        resources: &mut Resources,
        generation: u64,
    ) -> Result<TunnelSupervisor, ConnectionError> {
        let remote_port = connection.remote_port;
        let config = &self.inner.config;

        if let LocalTarget::Serial {
            device,
            baud_rate,
            bridge_port,
        } = &connection.target
        {
            if let Some(mut old) = resources.bridge.take() {
                self.inner.events.info(Some(remote_port), "Stopping old serial bridge...");
                old.stop().await;
            }

            let settings = BridgeSettings::from_config(device, *baud_rate, *bridge_port, &config.bridge);
            let mut bridge = SerialBridge::new(settings, Arc::clone(&self.inner.opener), self.inner.events.clone());
            bridge.start().await?;
            resources.bridge = Some(bridge);
        }

        let proxy = ProxySpec {
            remote_port,
            local_ip: connection.target.local_ip(),
            local_port: connection.target.local_port(),
        };
        let artifact = self
            .inner
            .writer
            .write(&self.inner.server, &proxy)
            .map_err(ConnectionError::ConfigWrite)?;
        let artifact_path = artifact.path().to_path_buf();
        // The previous artifact is deleted when replaced
        *lock(&connection.artifact) = Some(artifact);

        TunnelSupervisor::launch(
            &config.tunnel.executable,
            &artifact_path,
            remote_port,
            config.tunnel.terminate_timeout,
            self.inner.events.clone(),
            self.hooks(connection, generation),
        )
    }

    fn hooks(&self, connection: &Arc<Connection>, generation: u64) -> SupervisorHooks {
        let manager = Arc::downgrade(&self.inner);
        let conflicted = Arc::downgrade(connection);
        let exited = Arc::downgrade(connection);

        SupervisorHooks {
            on_conflict: Box::new(move || {
                if let (Some(inner), Some(connection)) = (Weak::upgrade(&manager), Weak::upgrade(&conflicted)) {
                    tokio::spawn(async move {
                        ConnectionManager { inner }.handle_conflict(connection).await;
                    });
                }
            }),
            on_exit: Box::new(move |status| {
                if let Some(connection) = Weak::upgrade(&exited) {
                    tokio::spawn(async move {
                        connection.on_exited(generation, status).await;
                    });
                }
            }),
        }
    }

    /// The tunnel server refused the remote port: drop the mapping entirely
    async fn handle_conflict(&self, connection: Arc<Connection>) {
        let remote_port = connection.remote_port;
        let current = match self.inner.connections.read().await.get(&remote_port) {
            Some(registered) => Arc::ptr_eq(registered, &connection),
            None => false,
        };
        if !current {
            debug!(remote_port, "Conflict reported by a mapping that was already removed");
            return;
        }

        warn!(remote_port, "Public port already in use, removing mapping");
        self.inner
            .events
            .publish(ConnectionEvent::Conflict { remote_port });

        match self.detach(remote_port, Some(&connection)).await {
            Ok(outcome) => outcome.wait().await,
            Err(e) => debug!(remote_port, "Conflict removal skipped: {}", e),
        }
    }

    /// Stop a mapping in the background. Never blocks on the teardown itself.
    pub async fn stop(&self, remote_port: u16) -> Result<StopOutcome, ConnectionError> {
        let connection = self.lookup(remote_port).await?;
        Ok(self.spawn_stop(connection))
    }

    fn spawn_stop(&self, connection: Arc<Connection>) -> StopOutcome {
        if connection.status() == ConnectionStatus::Stopped {
            info!(remote_port = connection.remote_port, "Already stopped");
            self.inner.events.info(
                Some(connection.remote_port),
                format!("{} already stopped", connection.remote_port),
            );
            return StopOutcome::AlreadyStopped;
        }

        let reserved = connection.reserve();
        StopOutcome::Stopping(tokio::spawn(async move {
            connection.stop_with(reserved).await;
        }))
    }

    /// Stop a mapping, forget it and delete its config artifact
    pub async fn remove(&self, remote_port: u16) -> Result<StopOutcome, ConnectionError> {
        self.detach(remote_port, None).await
    }

    /// Remove the entry for `remote_port`, only if it is still `expected` when given
    async fn detach(
        &self,
        remote_port: u16,
        expected: Option<&Arc<Connection>>,
    ) -> Result<StopOutcome, ConnectionError> {
        let connection = {
            let mut connections = self.inner.connections.write().await;
            let matches = match (connections.get(&remote_port), expected) {
                (Some(registered), Some(expected)) => Arc::ptr_eq(registered, expected),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                return Err(ConnectionError::NotFound(remote_port));
            }
            connections
                .remove(&remote_port)
                .ok_or(ConnectionError::NotFound(remote_port))?
        };
        connection.removed.store(true, Ordering::SeqCst);

        info!(remote_port, "Removing mapping");
        self.inner
            .events
            .publish(ConnectionEvent::Removed { remote_port });

        let reserved = connection.reserve();
        let task = tokio::spawn(async move {
            connection.stop_with(reserved).await;
            connection.delete_artifact();
        });
        Ok(StopOutcome::Stopping(task))
    }

    /// Snapshot of all mappings, ordered by public port
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let connections = self.inner.connections.read().await;
        let mut list: Vec<_> = connections.values().map(|c| c.info()).collect();
        list.sort_by_key(|c| c.remote_port);
        list
    }

    pub async fn get_info(&self, remote_port: u16) -> Option<ConnectionInfo> {
        self.lookup(remote_port).await.ok().map(|c| c.info())
    }

    pub async fn status(&self, remote_port: u16) -> Option<ConnectionStatus> {
        self.lookup(remote_port).await.ok().map(|c| c.status())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop everything within the configured shutdown budget.
    ///
    /// Polls until every mapping is `Stopped` or the budget runs out, then
    /// kills whatever is left and deletes all config artifacts.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let shutdown = &self.inner.config.shutdown;
        let deadline = started + shutdown.timeout;

        let connections: Vec<Arc<Connection>> = self.inner.connections.read().await.values().cloned().collect();
        info!(count = connections.len(), "Closing all connections");
        self.inner
            .events
            .info(None, "Closing all connections, please wait...");

        for connection in &connections {
            if connection.status() != ConnectionStatus::Stopped {
                // Detached; the poll below observes completion
                drop(self.spawn_stop(Arc::clone(connection)));
            }
        }

        let abandoned = loop {
            let pending: Vec<&Arc<Connection>> = connections
                .iter()
                .filter(|c| c.status() != ConnectionStatus::Stopped)
                .collect();
            if pending.is_empty() {
                break Vec::new();
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(pending = pending.len(), "Close timeout, forcing exit");
                self.inner.events.warn(None, "Close timeout, forcing exit");
                for connection in &pending {
                    connection.force_kill();
                }
                break pending.iter().map(|c| c.remote_port).collect();
            }

            tokio::time::sleep(shutdown.poll_interval.min(deadline - now)).await;
        };

        for connection in &connections {
            connection.delete_artifact();
        }

        let mut stopped: Vec<u16> = connections
            .iter()
            .map(|c| c.remote_port)
            .filter(|port| !abandoned.contains(port))
            .collect();
        stopped.sort_unstable();

        let report = ShutdownReport {
            stopped,
            abandoned,
            elapsed: started.elapsed(),
        };
        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );
        report
    }
}
