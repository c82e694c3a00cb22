//! Serial Bridge
//!
//! Exposes one serial device as a TCP endpoint so the tunnel client, which
//! only forwards TCP, can carry serial traffic. The device is owned
//! exclusively by the bridge and served to one client session at a time.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::device::{SerialDevice, SerialOpener, SerialTimeouts};
use super::session::{BridgeSession, SessionOptions};
use crate::config::BridgeConfig;
use crate::error::ConnectionError;
use crate::events::EventBus;

/// Back-off after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Everything needed to run one bridge
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub device: String,
    pub baud_rate: u32,
    pub bind_host: IpAddr,
    /// 0 lets the OS pick a port
    pub local_port: u16,
    pub timeouts: SerialTimeouts,
    pub socket_timeout: Duration,
    pub stop_timeout: Duration,
    pub buffer_size: usize,
}

impl BridgeSettings {
    pub fn from_config(device: &str, baud_rate: u32, local_port: u16, config: &BridgeConfig) -> Self {
        Self {
            device: device.to_string(),
            baud_rate,
            bind_host: config.bind_host,
            local_port,
            timeouts: SerialTimeouts {
                read: config.read_timeout,
                write: config.write_timeout,
            },
            socket_timeout: config.socket_timeout,
            stop_timeout: config.stop_timeout,
            buffer_size: config.buffer_size,
        }
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            socket_timeout: self.socket_timeout,
            write_timeout: self.timeouts.write,
            buffer_size: self.buffer_size,
        }
    }
}

struct RunningBridge {
    local_addr: SocketAddr,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Serial-to-TCP bridge
pub struct SerialBridge {
    settings: BridgeSettings,
    opener: Arc<dyn SerialOpener>,
    events: EventBus,
    running: Option<RunningBridge>,
}

impl SerialBridge {
    pub fn new(settings: BridgeSettings, opener: Arc<dyn SerialOpener>, events: EventBus) -> Self {
        Self {
            settings,
            opener,
            events,
            running: None,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Open the device, bind the listener and start accepting clients.
    /// Starting a running bridge does nothing.
    pub async fn start(&mut self) -> Result<(), ConnectionError> {
        if self.running.is_some() {
            debug!("Serial bridge for {} already running", self.settings.device);
            return Ok(());
        }

        let device = self.open_device().await.map_err(|e| {
            error!("Failed to open serial port {}: {:#}", self.settings.device, e);
            self.events.error(
                None,
                format!("Failed to open serial port {}: {:#}", self.settings.device, e),
            );
            ConnectionError::SerialOpen {
                device: self.settings.device.clone(),
                source: e,
            }
        })?;

        // On failure the device is dropped here, closing it
        let listener = TcpListener::bind((self.settings.bind_host, self.settings.local_port))
            .await
            .map_err(|e| {
                error!("Failed to bind bridge port {}: {}", self.settings.local_port, e);
                self.events.error(
                    None,
                    format!("Failed to bind bridge port {}: {}", self.settings.local_port, e),
                );
                ConnectionError::BridgeBind {
                    port: self.settings.local_port,
                    source: e,
                }
            })?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ConnectionError::BridgeBind {
                port: self.settings.local_port,
                source: e,
            })?;

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            device,
            self.settings.clone(),
            self.events.clone(),
            Arc::clone(&shutdown_flag),
            shutdown_rx,
        ));

        info!(
            device = %self.settings.device,
            baud_rate = self.settings.baud_rate,
            local_port = local_addr.port(),
            "Serial bridge started"
        );
        self.events.info(
            None,
            format!(
                "Serial bridge started: {}@{} → TCP {}",
                self.settings.device,
                self.settings.baud_rate,
                local_addr.port()
            ),
        );

        self.running = Some(RunningBridge {
            local_addr,
            shutdown_flag,
            shutdown_tx,
            accept_task,
        });
        Ok(())
    }

    async fn open_device(&self) -> crate::Result<Box<dyn SerialDevice>> {
        let opener = Arc::clone(&self.opener);
        let device = self.settings.device.clone();
        let baud_rate = self.settings.baud_rate;
        let timeouts = self.settings.timeouts;

        tokio::task::spawn_blocking(move || opener.open(&device, baud_rate, timeouts)).await?
    }

    /// Stop accepting, end any active session and release the device.
    ///
    /// Waits at most the configured stop timeout for the accept loop.
    /// Stopping a stopped bridge does nothing. Never fails.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!("Stopping serial bridge: {}", self.settings.device);
        self.events.info(
            None,
            format!("Stopping serial bridge: {}", self.settings.device),
        );

        running.shutdown_flag.store(true, Ordering::SeqCst);
        if running.shutdown_tx.send(()).is_err() {
            debug!("Accept loop for {} already gone", self.settings.device);
        }

        let mut accept_task = running.accept_task;
        match timeout(self.settings.stop_timeout, &mut accept_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Accept loop for {} ended abnormally: {}", self.settings.device, e);
                self.events.warn(
                    None,
                    format!("Error during bridge shutdown: {}", e),
                );
            }
            Err(_) => {
                warn!(
                    "Accept loop for {} did not stop within {:?}, abandoning it",
                    self.settings.device, self.settings.stop_timeout
                );
                accept_task.abort();
            }
        }

        info!("Serial bridge stopped: {}", self.settings.device);
        self.events.info(
            None,
            format!("Serial bridge stopped: {}", self.settings.device),
        );
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown_flag.store(true, Ordering::SeqCst);
            running.accept_task.abort();
        }
    }
}

/// Serve clients one after another until shutdown. A client that connects
/// while another is being served waits in the listen backlog.
async fn accept_loop(
    listener: TcpListener,
    device: Box<dyn SerialDevice>,
    settings: BridgeSettings,
    events: EventBus,
    shutdown_flag: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let local_port = listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(settings.local_port);
    debug!(local_port, "Starting bridge accept loop");

    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(local_port, "Error accepting bridge client: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                if shutdown_flag.load(Ordering::SeqCst) {
                    debug!("Rejecting client {} due to shutdown", peer);
                    break;
                }

                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Failed to prepare client socket {}: {}", peer, e);
                        continue;
                    }
                };

                let session = match BridgeSession::new(
                    stream,
                    peer,
                    local_port,
                    device.as_ref(),
                    events.clone(),
                    Arc::clone(&shutdown_flag),
                    settings.session_options(),
                ) {
                    Ok(session) => session,
                    Err(e) => {
                        error!("Failed to start session for {}: {}", peer, e);
                        events.error(None, format!("Failed to start session for {}: {}", peer, e));
                        continue;
                    }
                };

                let session_id = session.session_id().to_string();
                match tokio::task::spawn_blocking(move || session.run()).await {
                    Ok(stats) => debug!(
                        session_id = %stats.session_id,
                        bytes_to_serial = stats.bytes_to_serial,
                        bytes_to_tcp = stats.bytes_to_tcp,
                        "Session finished"
                    ),
                    Err(e) => error!(session_id = %session_id, "Session task failed: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(local_port, "Bridge accept loop received shutdown signal");
                break;
            }
        }
    }

    drop(device);
    debug!(local_port, "Bridge accept loop stopped");
}
